//! SQLite-backed persistence for sessions, bindings, and display-ID counters

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod database;
pub mod error;
pub mod repository;
pub mod sequencer;

pub use database::{Database, SharedDatabase};
pub use error::{StorageError, StorageResult};
pub use repository::{
    BindingRepository, SessionRepository, SqliteBindingRepository, SqliteSessionRepository,
};
pub use sequencer::DisplayIdSequencer;
