// SPDX-License-Identifier: MIT

//! Store object rows and their references.

use std::collections::BTreeSet;

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::{Error, Result};
use crate::types::{ObjectInfo, RegisterObject, now_unix};

impl StoreDb {
    /// Register a store object together with its references.
    ///
    /// Registration is idempotent: re-registering a path with the same
    /// NAR hash and content address is a no-op; a differing hash or
    /// content address fails with [Error::CaMismatch] and changes
    /// nothing.
    pub fn register_object(&mut self, object: &RegisterObject) -> Result<()> {
        self.register_objects(std::slice::from_ref(object))
    }

    /// Register several store objects in one transaction. Object rows
    /// are inserted before any references, so members of the batch may
    /// reference each other (outputs of one derivation frequently do).
    pub fn register_objects(&mut self, objects: &[RegisterObject]) -> Result<()> {
        let tx = self.conn.transaction()?;

        let mut fresh = Vec::new();
        for object in objects {
            let existing: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT narHash, ca FROM Objects WHERE path = ?1",
                    params![object.path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((nar_hash, ca)) if nar_hash == object.nar_hash && ca == object.ca => {
                    // Already registered identically.
                    continue;
                }
                Some(_) => {
                    return Err(Error::CaMismatch {
                        path: object.path.clone(),
                    });
                }
                None => {}
            }

            tx.execute(
                r#"
                INSERT INTO Objects (path, narHash, narSize, ca, deriver, registrationTime)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    object.path,
                    object.nar_hash,
                    object.nar_size as i64,
                    object.ca,
                    object.deriver,
                    now_unix(),
                ],
            )?;
            fresh.push((tx.last_insert_rowid(), object));
        }

        for (id, object) in fresh {
            for reference in &object.references {
                if reference == &object.path {
                    tx.execute(
                        "INSERT OR IGNORE INTO Refs (referrer, reference) VALUES (?1, ?1)",
                        params![id],
                    )?;
                    continue;
                }
                // References must already be present; an object cannot
                // refer to something the store doesn't hold.
                let ref_id: i64 = tx
                    .query_row(
                        "SELECT id FROM Objects WHERE path = ?1",
                        params![reference],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| Error::BadValue(format!("unknown reference {reference:?}")))?;
                tx.execute(
                    "INSERT OR IGNORE INTO Refs (referrer, reference) VALUES (?1, ?2)",
                    params![id, ref_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Whether `path` is a registered store object.
    pub fn object_exists(&self, path: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM Objects WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Metadata and references of `path`, or `None` if unregistered.
    pub fn query_object(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, narHash, narSize, ca, deriver, registrationTime
                FROM Objects WHERE path = ?1
                "#,
                params![path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, nar_hash, nar_size, ca, deriver, registration_time)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT o.path FROM Refs r JOIN Objects o ON o.id = r.reference
            WHERE r.referrer = ?1
            "#,
        )?;
        let references: BTreeSet<String> = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        Ok(Some(ObjectInfo {
            path: path.to_string(),
            nar_hash,
            nar_size: nar_size as u64,
            ca,
            deriver,
            registration_time,
            references,
        }))
    }

    /// Paths that refer to `path` (used by garbage collection to decide
    /// liveness; collection itself lives outside this crate).
    pub fn referrers(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT o.path FROM Refs r
            JOIN Objects o ON o.id = r.referrer
            JOIN Objects t ON t.id = r.reference
            WHERE t.path = ?1
            "#,
        )?;
        let referrers = stmt
            .query_map(params![path], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(referrers)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::connection::StoreDb;
    use crate::error::Error;
    use crate::types::RegisterObject;

    fn sample(path: &str, hash: &str) -> RegisterObject {
        RegisterObject {
            path: path.to_string(),
            nar_hash: format!("sha256:{hash}"),
            nar_size: 120,
            ca: None,
            deriver: None,
            references: BTreeSet::new(),
        }
    }

    #[test]
    fn register_and_query() {
        let mut db = StoreDb::open_memory().unwrap();
        let mut obj = sample("/opt/zb/store/aaaa-dep", "11");
        db.register_object(&obj).unwrap();

        obj = sample("/opt/zb/store/bbbb-thing", "22");
        obj.deriver = Some("/opt/zb/store/cccc-thing.drv".into());
        obj.references.insert("/opt/zb/store/aaaa-dep".into());
        obj.references.insert("/opt/zb/store/bbbb-thing".into());
        db.register_object(&obj).unwrap();

        assert!(db.object_exists("/opt/zb/store/bbbb-thing").unwrap());
        let info = db.query_object("/opt/zb/store/bbbb-thing").unwrap().unwrap();
        assert_eq!(info.nar_hash, "sha256:22");
        assert_eq!(info.nar_size, 120);
        assert_eq!(info.deriver.as_deref(), Some("/opt/zb/store/cccc-thing.drv"));
        assert_eq!(
            info.references,
            BTreeSet::from([
                "/opt/zb/store/aaaa-dep".to_string(),
                "/opt/zb/store/bbbb-thing".to_string(),
            ])
        );

        assert!(
            db.referrers("/opt/zb/store/aaaa-dep")
                .unwrap()
                .contains("/opt/zb/store/bbbb-thing")
        );
        assert!(db.query_object("/opt/zb/store/absent").unwrap().is_none());
    }

    #[test]
    fn registration_is_idempotent() {
        let mut db = StoreDb::open_memory().unwrap();
        let obj = sample("/opt/zb/store/aaaa-x", "11");
        db.register_object(&obj).unwrap();
        db.register_object(&obj).unwrap();

        let clash = sample("/opt/zb/store/aaaa-x", "99");
        let err = db.register_object(&clash).unwrap_err();
        assert!(matches!(err, Error::CaMismatch { .. }), "{err}");

        // Nothing changed.
        let info = db.query_object("/opt/zb/store/aaaa-x").unwrap().unwrap();
        assert_eq!(info.nar_hash, "sha256:11");
    }

    /// Outputs of one derivation may reference each other; a batch
    /// registration resolves those edges regardless of order.
    #[test]
    fn batch_allows_mutual_references() {
        let mut db = StoreDb::open_memory().unwrap();
        let mut a = sample("/opt/zb/store/aaaa-pkg", "11");
        a.references.insert("/opt/zb/store/bbbb-pkg-lib".into());
        let mut b = sample("/opt/zb/store/bbbb-pkg-lib", "22");
        b.references.insert("/opt/zb/store/aaaa-pkg".into());

        db.register_objects(&[a, b]).unwrap();

        let info = db.query_object("/opt/zb/store/aaaa-pkg").unwrap().unwrap();
        assert!(info.references.contains("/opt/zb/store/bbbb-pkg-lib"));
        let info = db.query_object("/opt/zb/store/bbbb-pkg-lib").unwrap().unwrap();
        assert!(info.references.contains("/opt/zb/store/aaaa-pkg"));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let mut db = StoreDb::open_memory().unwrap();
        let mut obj = sample("/opt/zb/store/aaaa-x", "11");
        obj.references.insert("/opt/zb/store/feed-never-registered".into());
        db.register_object(&obj).unwrap_err();
        // The transaction rolled back.
        assert!(!db.object_exists("/opt/zb/store/aaaa-x").unwrap());
    }
}
