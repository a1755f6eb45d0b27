//! Session lifecycle and persistence for Engram agent workspaces.
//!
//! Tracks agent work sessions from creation to termination: durable SQLite
//! rows with human-facing display ids, key-to-session bindings that survive
//! restarts, fire-and-forget token accounting, and a background sweeper
//! that times out idle sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use engram_sessions::{DEFAULT_BINDING_KEY, Database, SessionConfig, SessionRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("engram.db")?;
//!     let runtime = SessionRuntime::start(db, &SessionConfig::default());
//!
//!     let session = runtime
//!         .manager()
//!         .start_session(DEFAULT_BINDING_KEY, Some("proj-42"), "architect", None)
//!         .await?;
//!     runtime.accountant().record_activity(&session.id);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod runtime;
pub mod session;
pub mod storage;

pub use config::{ConfigError, SessionConfig};
pub use error::{Result, SessionError};
pub use runtime::SessionRuntime;
pub use session::{
    BindingCache, BindingTable, DEFAULT_BINDING_KEY, DescriptiveUpdate, EndReason, Session,
    SessionFilter, SessionManager, SessionSnapshot, SessionSort, SessionStatus, SweepReport,
    TimeoutSweeper, TokenLedger, TokenTally, UsageAccountant, estimate_token_units,
};
pub use storage::{Database, DisplayIdSequencer, SharedDatabase, StorageError};
