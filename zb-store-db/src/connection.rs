// SPDX-License-Identifier: MIT

//! Database connection management.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::SCHEMA_SQL;

/// Database open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access to an existing database.
    ReadOnly,
    /// Read-write access to an existing database.
    ReadWrite,
    /// Create the database (and schema) if it doesn't exist.
    Create,
}

/// The store catalogue.
pub struct StoreDb {
    pub(crate) conn: Connection,
}

impl StoreDb {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let flags = match mode {
            OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };

        let conn = Connection::open_with_flags(path, flags).map_err(|e| Error::Open {
            path: path.to_owned(),
            source: e,
        })?;
        let db = StoreDb { conn };

        if mode != OpenMode::ReadOnly {
            db.configure_pragmas()?;
        }
        if mode == OpenMode::Create {
            db.create_schema()?;
        }

        debug!("opened store database at {} ({mode:?})", path.display());
        Ok(db)
    }

    /// An in-memory database with the full schema, for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = StoreDb { conn };
        db.configure_pragmas()?;
        db.create_schema()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    pub fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}
