// SPDX-License-Identifier: MIT

//! The realisation cache: build fingerprint → produced outputs.
//!
//! Entries are written only after the producing build's outputs are
//! registered, so a cache hit implies the paths are present.

use rusqlite::params;

use crate::connection::StoreDb;
use crate::error::Result;
use crate::types::Realisation;

impl StoreDb {
    /// Record that building `fingerprint` produced `output_path` for
    /// `output_name`.
    pub fn insert_realisation(&mut self, fingerprint: &str, realisation: &Realisation) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO Realisations (fingerprint, outputName, outputPath, ca)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (fingerprint, outputName)
            DO UPDATE SET outputPath = excluded.outputPath, ca = excluded.ca
            "#,
            params![
                fingerprint,
                realisation.output_name,
                realisation.output_path,
                realisation.ca,
            ],
        )?;
        Ok(())
    }

    /// All cached outputs of `fingerprint`, sorted by output name.
    pub fn lookup_realisations(&self, fingerprint: &str) -> Result<Vec<Realisation>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT outputName, outputPath, ca FROM Realisations
            WHERE fingerprint = ?1 ORDER BY outputName
            "#,
        )?;
        let rows = stmt
            .query_map(params![fingerprint], |row| {
                Ok(Realisation {
                    output_name: row.get(0)?,
                    output_path: row.get(1)?,
                    ca: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
