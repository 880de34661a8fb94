// SPDX-License-Identifier: MIT

//! SQLite catalogue for the store server.
//!
//! A single database file records which store paths are present and
//! what they reference, the scheduler's build records and their
//! captured logs, and the realisation cache that maps build
//! fingerprints to produced outputs.
//!
//! The connection is owned by the daemon process; everything here is
//! synchronous and intended to be called from `spawn_blocking`. All
//! mutations run in transactions.
//!
//! Paths cross this boundary as absolute strings: the database neither
//! knows nor cares about the store directory, it catalogues whatever
//! the daemon registered.

mod builds;
mod connection;
mod error;
mod objects;
mod realisations;
mod schema;
mod types;

pub use connection::{OpenMode, StoreDb};
pub use error::{Error, Result};
pub use types::*;
