//! Process-level wiring of the session subsystem
//!
//! [`SessionRuntime`] owns the manager plus its two background tasks, the
//! usage accountant and the timeout sweeper, and shuts them down in an
//! order that drains pending token counters first.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::session::accounting::UsageAccountant;
use crate::session::manager::SessionManager;
use crate::session::sweeper::TimeoutSweeper;
use crate::storage::database::Database;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The session manager together with its background tasks.
pub struct SessionRuntime {
    manager: Arc<SessionManager>,
    accountant: UsageAccountant,
    accountant_handle: Option<JoinHandle<()>>,
    sweeper: TimeoutSweeper,
}

impl SessionRuntime {
    /// Starts the runtime over an opened database.
    #[must_use]
    pub fn start(db: Database, config: &SessionConfig) -> Self {
        let db = db.into_shared();
        let manager = Arc::new(SessionManager::new(db));
        let (accountant, accountant_handle) =
            UsageAccountant::spawn(Arc::clone(&manager), config.flush_interval());
        let mut sweeper = TimeoutSweeper::new(Arc::clone(&manager), config);
        sweeper.start();
        info!("Session runtime started");
        Self {
            manager,
            accountant,
            accountant_handle: Some(accountant_handle),
            sweeper,
        }
    }

    /// The shared session manager.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// The handle collaborators use to report activity and token usage.
    pub fn accountant(&self) -> &UsageAccountant {
        &self.accountant
    }

    /// Whether both background tasks are alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sweeper.is_running()
            && self
                .accountant_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Drains the accountant, then stops both background tasks.
    pub async fn shutdown(mut self) {
        self.accountant.flush().await;
        self.accountant.shutdown();
        if let Some(handle) = self.accountant_handle.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Usage accountant task panicked"),
                Err(_) => warn!("Usage accountant did not drain in time"),
            }
        }
        self.sweeper.stop().await;
        info!("Session runtime stopped");
    }
}
