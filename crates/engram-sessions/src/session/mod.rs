//! Session domain: lifecycle state, bindings, token accounting, and the
//! manager that coordinates them over the durable store.

pub mod accounting;
pub mod bindings;
pub mod manager;
pub mod state;
pub mod sweeper;

pub use accounting::{TokenLedger, TokenTally, UsageAccountant, estimate_token_units};
pub use bindings::{BindingCache, BindingTable, DEFAULT_BINDING_KEY};
pub use manager::SessionManager;
pub use state::{
    DescriptiveUpdate, EndReason, Session, SessionFilter, SessionSnapshot, SessionSort,
    SessionStatus,
};
pub use sweeper::{SweepReport, TimeoutSweeper};
