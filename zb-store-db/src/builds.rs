// SPDX-License-Identifier: MIT

//! Build records, per-output results, and captured builder logs.

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::{Error, Result};
use crate::types::{BuildRecord, BuildResultRecord, BuildStatus, now_unix};

impl StoreDb {
    /// Create a build record in the `active` state; returns its id.
    pub fn create_build(&mut self, drv_paths: &[String]) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO Builds (status, startedAt, drvPaths) VALUES (?1, ?2, ?3)",
            params![
                BuildStatus::Active.as_str(),
                now_unix(),
                serde_json::to_string(drv_paths)?,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Move an active build to a terminal status. Terminal rows are
    /// never updated again, keeping status transitions monotonic.
    pub fn finish_build(&mut self, build_id: i64, status: BuildStatus) -> Result<()> {
        debug_assert!(status.is_terminal());
        let updated = self.conn.execute(
            "UPDATE Builds SET status = ?1, endedAt = ?2 WHERE id = ?3 AND status = 'active'",
            params![status.as_str(), now_unix(), build_id],
        )?;
        if updated == 0 {
            return Err(Error::NoSuchBuild(build_id));
        }
        Ok(())
    }

    /// Attach the expand operation's result to a build.
    pub fn set_expand_result(&mut self, build_id: i64, result: &serde_json::Value) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE Builds SET expandResult = ?1 WHERE id = ?2",
            params![serde_json::to_string(result)?, build_id],
        )?;
        if updated == 0 {
            return Err(Error::NoSuchBuild(build_id));
        }
        Ok(())
    }

    /// Record the outcome of one output of one derivation.
    pub fn upsert_build_result(&mut self, build_id: i64, result: &BuildResultRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO BuildResults (buildId, drvPath, outputName, outputPath, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (buildId, drvPath, outputName)
            DO UPDATE SET outputPath = excluded.outputPath, status = excluded.status
            "#,
            params![
                build_id,
                result.drv_path,
                result.output_name,
                result.output_path,
                result.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a build with its per-output results, or `None` for ids the
    /// server does not know.
    pub fn get_build(&self, build_id: i64) -> Result<Option<BuildRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT status, startedAt, endedAt, drvPaths, expandResult FROM Builds WHERE id = ?1",
                params![build_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, started_at, ended_at, drv_paths, expand_result)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT drvPath, outputName, outputPath, status
            FROM BuildResults WHERE buildId = ?1
            ORDER BY drvPath, outputName
            "#,
        )?;
        let results = stmt
            .query_map(params![build_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(drv_path, output_name, output_path, status)| {
                Ok(BuildResultRecord {
                    drv_path,
                    output_name,
                    output_path,
                    status: status.parse()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(BuildRecord {
            id: build_id,
            status: status.parse()?,
            started_at,
            ended_at,
            drv_paths: serde_json::from_str(&drv_paths)?,
            expand_result: expand_result.map(|s| serde_json::from_str(&s)).transpose()?,
            results,
        }))
    }

    /// Append a chunk of captured builder output.
    pub fn append_log_chunk(&mut self, build_id: i64, bytes: &[u8]) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO LogChunks (buildId, seq, bytes, ts)
            VALUES (?1, (SELECT coalesce(max(seq), -1) + 1 FROM LogChunks WHERE buildId = ?1), ?2, ?3)
            "#,
            params![build_id, bytes, now_unix()],
        )?;
        Ok(())
    }

    /// Read captured log bytes starting at `offset` in the concatenated
    /// stream. Returns the bytes and the offset to poll from next.
    pub fn read_log(&self, build_id: i64, offset: u64) -> Result<(Vec<u8>, u64)> {
        let mut stmt = self
            .conn
            .prepare("SELECT bytes FROM LogChunks WHERE buildId = ?1 ORDER BY seq")?;
        let chunks = stmt.query_map(params![build_id], |row| row.get::<_, Vec<u8>>(0))?;

        let mut position: u64 = 0;
        let mut out = Vec::new();
        for chunk in chunks {
            let chunk = chunk?;
            let end = position + chunk.len() as u64;
            if end > offset {
                let skip = offset.saturating_sub(position) as usize;
                out.extend_from_slice(&chunk[skip..]);
            }
            position = end;
        }
        Ok((out, position.max(offset)))
    }

    /// Delete old rows: log chunks beyond the log retention window, and
    /// terminal builds (with their results) beyond the build retention
    /// window. Build rows always outlive their logs.
    pub fn reap(&mut self, log_retention_secs: i64, build_retention_secs: i64) -> Result<(u64, u64)> {
        let build_retention_secs = build_retention_secs.max(log_retention_secs);
        let now = now_unix();

        let tx = self.conn.transaction()?;
        let logs = tx.execute(
            "DELETE FROM LogChunks WHERE ts < ?1",
            params![now - log_retention_secs],
        )?;
        let builds = tx.execute(
            "DELETE FROM Builds WHERE status != 'active' AND endedAt IS NOT NULL AND endedAt < ?1",
            params![now - build_retention_secs],
        )?;
        tx.commit()?;
        Ok((logs as u64, builds as u64))
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::StoreDb;
    use crate::types::{BuildResultRecord, BuildStatus};

    #[test]
    fn build_lifecycle() {
        let mut db = StoreDb::open_memory().unwrap();
        let id = db.create_build(&["/opt/zb/store/aaaa-x.drv".into()]).unwrap();

        let record = db.get_build(id).unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Active);
        assert!(record.ended_at.is_none());
        assert_eq!(record.drv_paths, vec!["/opt/zb/store/aaaa-x.drv".to_string()]);

        db.upsert_build_result(
            id,
            &BuildResultRecord {
                drv_path: "/opt/zb/store/aaaa-x.drv".into(),
                output_name: "out".into(),
                output_path: Some("/opt/zb/store/bbbb-x".into()),
                status: BuildStatus::Success,
            },
        )
        .unwrap();
        db.finish_build(id, BuildStatus::Success).unwrap();

        let record = db.get_build(id).unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Success);
        assert!(record.ended_at.is_some());
        assert_eq!(record.results.len(), 1);
        assert_eq!(record.results[0].status, BuildStatus::Success);

        // Terminal rows stay terminal.
        db.finish_build(id, BuildStatus::Fail).unwrap_err();
        assert!(db.get_build(id + 1).unwrap().is_none());
    }

    #[test]
    fn log_chunks_and_offsets() {
        let mut db = StoreDb::open_memory().unwrap();
        let id = db.create_build(&[]).unwrap();
        db.append_log_chunk(id, b"hello ").unwrap();
        db.append_log_chunk(id, b"world\n").unwrap();

        let (all, next) = db.read_log(id, 0).unwrap();
        assert_eq!(all, b"hello world\n");
        assert_eq!(next, 12);

        let (tail, next) = db.read_log(id, 6).unwrap();
        assert_eq!(tail, b"world\n");
        assert_eq!(next, 12);

        let (empty, next) = db.read_log(id, 12).unwrap();
        assert!(empty.is_empty());
        assert_eq!(next, 12);

        // Offsets inside a chunk work too.
        let (mid, _) = db.read_log(id, 3).unwrap();
        assert_eq!(mid, b"lo world\n");
    }

    #[test]
    fn reap_logs_before_builds() {
        let mut db = StoreDb::open_memory().unwrap();
        let id = db.create_build(&[]).unwrap();
        db.append_log_chunk(id, b"some output").unwrap();
        db.finish_build(id, BuildStatus::Fail).unwrap();

        // Retention of zero seconds reaps everything terminal.
        let (logs, builds) = db.reap(-1, -1).unwrap();
        assert_eq!(logs, 1);
        assert_eq!(builds, 1);
        assert!(db.get_build(id).unwrap().is_none());
    }

    #[test]
    fn active_builds_survive_reaping() {
        let mut db = StoreDb::open_memory().unwrap();
        let id = db.create_build(&[]).unwrap();
        db.reap(-1, -1).unwrap();
        assert!(db.get_build(id).unwrap().is_some());
    }
}
