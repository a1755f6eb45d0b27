//! Session lifecycle manager
//!
//! The manager owns the durable store handle, an in-memory session cache,
//! the binding table, and the pending-token ledger. Lifecycle writes go
//! through conditional updates guarded on status, so concurrent callers
//! cannot resurrect an ended session; the loser of a race gets a typed
//! error instead of a partial write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::session::accounting::TokenLedger;
use crate::session::bindings::BindingTable;
use crate::session::state::{
    DescriptiveUpdate, EndReason, Session, SessionFilter, SessionSnapshot, SessionSort,
    SessionStatus,
};
use crate::storage::database::{Database, SharedDatabase};
use crate::storage::error::StorageError;
use crate::storage::repository::{
    BindingRepository, SessionRepository, SqliteBindingRepository, SqliteSessionRepository,
};
use crate::storage::sequencer::DisplayIdSequencer;

/// The error a write gets back when the session's status rejects it.
fn rejected_write(session: &Session) -> SessionError {
    match session.status {
        SessionStatus::Disconnected => SessionError::SessionDisconnected(session.id.clone()),
        status => SessionError::InvalidTransition {
            id: session.id.clone(),
            status,
        },
    }
}

fn validate_ident(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SessionError::InvalidInput(format!(
            "{what} must not be empty"
        )));
    }
    Ok(())
}

/// Coordinates session creation, status transitions, bindings, and token
/// accounting over the durable store.
pub struct SessionManager {
    db: SharedDatabase,
    /// Cache of durable rows; pending ledger counters are merged at read time
    sessions: RwLock<HashMap<String, Session>>,
    bindings: BindingTable,
    ledger: TokenLedger,
}

impl SessionManager {
    /// Creates a manager over the shared database.
    #[must_use]
    pub fn new(db: SharedDatabase) -> Self {
        let bindings = BindingTable::new(Arc::clone(&db));
        Self {
            db,
            sessions: RwLock::new(HashMap::new()),
            bindings,
            ledger: TokenLedger::new(),
        }
    }

    /// The binding table shared with this manager.
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Creates a new active session without binding it to a key.
    pub async fn create_session(
        &self,
        project_id: Option<&str>,
        agent_type: &str,
        title: Option<&str>,
    ) -> Result<Session> {
        self.create_inner(None, project_id, agent_type, title).await
    }

    /// Creates a new active session and binds it to the given key,
    /// replacing any previous binding for that key.
    pub async fn start_session(
        &self,
        binding_key: &str,
        project_id: Option<&str>,
        agent_type: &str,
        title: Option<&str>,
    ) -> Result<Session> {
        validate_ident(binding_key, "binding_key")?;
        self.create_inner(Some(binding_key), project_id, agent_type, title)
            .await
    }

    async fn create_inner(
        &self,
        binding_key: Option<&str>,
        project_id: Option<&str>,
        agent_type: &str,
        title: Option<&str>,
    ) -> Result<Session> {
        validate_ident(agent_type, "agent_type")?;
        if let Some(project_id) = project_id {
            validate_ident(project_id, "project_id")?;
        }

        let now = Utc::now();
        let session = {
            let mut db = Database::lock(&self.db)?;
            db.transaction(|tx| {
                let display_id = DisplayIdSequencer::next(tx, now.year())?;
                let mut session = Session::new(
                    Uuid::new_v4().to_string(),
                    display_id,
                    agent_type.trim().to_string(),
                );
                if let Some(project_id) = project_id {
                    session = session.with_project(project_id.to_string());
                }
                if let Some(title) = title {
                    session = session.with_title(title.to_string());
                }
                let mut repo = SqliteSessionRepository::new(tx);
                repo.create(&session)?;
                if let Some(binding_key) = binding_key {
                    let mut bindings = SqliteBindingRepository::new(tx);
                    bindings.upsert(binding_key, &session.id, now)?;
                }
                Ok(session)
            })?
        };

        if let Some(binding_key) = binding_key {
            self.bindings.note(binding_key, &session.id).await;
        }
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id.clone(), session.clone());
        }
        match binding_key {
            Some(binding_key) => info!(
                session_id = %session.id,
                display_id = %session.display_id,
                binding_key = %binding_key,
                "Started session"
            ),
            None => info!(
                session_id = %session.id,
                display_id = %session.display_id,
                "Created session"
            ),
        }
        Ok(session)
    }

    // ========================================================================
    // Resolution and Reads
    // ========================================================================

    /// Resolves the active session bound to a key.
    ///
    /// Returns `None` when the key is unbound or its session has left the
    /// active status; an ended session never resurfaces here, callers start
    /// a fresh one instead.
    pub async fn resolve_active_session(&self, binding_key: &str) -> Result<Option<Session>> {
        let Some(session_id) = self.bindings.resolve(binding_key).await? else {
            return Ok(None);
        };
        let mut session = match self.load_session(&session_id).await {
            Ok(session) => session,
            Err(SessionError::NotFound(_)) => {
                self.bindings.forget(binding_key).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if session.status != SessionStatus::Active {
            // Implicit unbind: the bound session has ended
            self.bindings.forget(binding_key).await;
            return Ok(None);
        }
        self.merge_pending(&mut session);
        Ok(Some(session))
    }

    /// Loads a session, merging pending token counters into the returned
    /// copy.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let mut session = self.load_session(session_id).await?;
        self.merge_pending(&mut session);
        Ok(session)
    }

    /// Builds the read-model snapshot for a session.
    pub async fn get_snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let session = self.get_session(session_id).await?;
        Ok(SessionSnapshot::from(&session))
    }

    /// Lists sessions matching the filter in the requested order.
    pub fn list_sessions(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
    ) -> Result<Vec<SessionSnapshot>> {
        let mut sessions = {
            let db = Database::lock(&self.db)?;
            let repo = SqliteSessionRepository::new(db.conn());
            repo.get_all()?
        };
        sessions.retain(|session| filter.matches(session));
        for session in &mut sessions {
            self.merge_pending(session);
        }
        match sort {
            SessionSort::Recency => {
                sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
            }
            SessionSort::TokenTotals => {
                sessions.sort_by(|a, b| b.total_tokens.cmp(&a.total_tokens));
            }
            SessionSort::StartedAt => {
                sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            }
        }
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions.iter().map(SessionSnapshot::from).collect())
    }

    // ========================================================================
    // Lifecycle Writes
    // ========================================================================

    /// Ends a session, folding its pending token counters into the durable
    /// row.
    ///
    /// Idempotent: ending a session that already ended (or was disconnected)
    /// is a no-op. Only an unknown id is an error.
    pub async fn end_session(&self, session_id: &str, reason: EndReason) -> Result<()> {
        if self
            .close_session(session_id, SessionStatus::Inactive, reason, None)
            .await?
        {
            info!(session_id = %session_id, reason = %reason, "Ended session");
            return Ok(());
        }
        let session = self.load_session(session_id).await?;
        debug!(session_id = %session_id, status = %session.status, "End was a no-op");
        Ok(())
    }

    /// Edits descriptive fields. Allowed for active and inactive sessions;
    /// a disconnected session rejects all writes.
    pub async fn update_descriptive(
        &self,
        session_id: &str,
        update: &DescriptiveUpdate,
    ) -> Result<Session> {
        let updated = {
            let db = Database::lock(&self.db)?;
            let mut repo = SqliteSessionRepository::new(db.conn());
            repo.update_descriptive(session_id, update)?
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id);
        }
        if !updated {
            let session = self.load_session(session_id).await?;
            return Err(rejected_write(&session));
        }
        self.get_session(session_id).await
    }

    /// Moves the session bound to a key onto another project and refreshes
    /// the binding.
    ///
    /// Distinguishes its failures: an unbound key is `NotFound`, a session
    /// that ended is `InvalidTransition`, and a disconnected one is
    /// `SessionDisconnected`.
    pub async fn switch_project(&self, binding_key: &str, project_id: &str) -> Result<Session> {
        validate_ident(project_id, "project_id")?;
        let Some(session_id) = self.bindings.resolve(binding_key).await? else {
            return Err(SessionError::NotFound(format!(
                "no session bound to key '{binding_key}'"
            )));
        };
        let reassigned = {
            let db = Database::lock(&self.db)?;
            let mut repo = SqliteSessionRepository::new(db.conn());
            repo.reassign_project(&session_id, project_id)?
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id);
        }
        if !reassigned {
            let session = self.load_session(&session_id).await?;
            return Err(rejected_write(&session));
        }
        self.bindings.bind(binding_key, &session_id).await?;
        info!(session_id = %session_id, project_id = %project_id, "Switched session project");
        self.get_session(&session_id).await
    }

    /// Transitions every active session under a project to disconnected.
    ///
    /// Returns how many sessions were disconnected. Pending token counters
    /// of each affected session are folded into its row as part of the
    /// transition. A failure closing one session is logged and skipped,
    /// never aborting the rest; the count covers the sessions actually
    /// transitioned. Safe to retry: already-disconnected sessions no
    /// longer match.
    pub async fn disconnect_project(&self, project_id: &str) -> Result<usize> {
        validate_ident(project_id, "project_id")?;
        let active_ids = {
            let db = Database::lock(&self.db)?;
            let repo = SqliteSessionRepository::new(db.conn());
            repo.active_ids_for_project(project_id)?
        };

        let mut disconnected = 0;
        for session_id in &active_ids {
            match self
                .close_session(
                    session_id,
                    SessionStatus::Disconnected,
                    EndReason::ProjectDisconnect,
                    None,
                )
                .await
            {
                Ok(true) => {
                    self.bindings.forget_session(session_id).await;
                    disconnected += 1;
                }
                Ok(false) => {
                    debug!(session_id = %session_id, "Session left active status before disconnect");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to disconnect session");
                }
            }
        }
        if disconnected > 0 {
            info!(project_id = %project_id, count = disconnected, "Disconnected project sessions");
        }
        Ok(disconnected)
    }

    /// Removes a session row entirely. Bindings pointing at it are nulled
    /// out by the store and dropped from the cache.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        {
            let db = Database::lock(&self.db)?;
            let mut repo = SqliteSessionRepository::new(db.conn());
            match repo.delete(session_id) {
                Ok(()) => {}
                Err(StorageError::NotFound(_)) => {
                    return Err(SessionError::NotFound(session_id.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.ledger.discard(session_id);
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id);
        }
        self.bindings.forget_session(session_id).await;
        info!(session_id = %session_id, "Deleted session");
        Ok(())
    }

    // ========================================================================
    // Accounting Intake (never errors)
    // ========================================================================

    /// Advances a session's last-activity timestamp if it is still active.
    ///
    /// Failures are logged, never raised.
    pub(crate) async fn apply_activity(&self, session_id: &str, at: DateTime<Utc>) {
        let touched = match Database::lock(&self.db) {
            Ok(db) => {
                let mut repo = SqliteSessionRepository::new(db.conn());
                repo.touch_activity(session_id, at)
            }
            Err(e) => Err(e),
        };
        match touched {
            Ok(true) => {
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.get_mut(session_id) {
                    if session.last_activity_at < at {
                        session.last_activity_at = at;
                    }
                }
            }
            Ok(false) => {
                debug!(session_id = %session_id, "Dropped stale or non-active activity tick");
            }
            Err(e) => {
                warn!(session_id = %session_id, timestamp = %at, error = %e, "Failed to record activity");
            }
        }
    }

    /// Accumulates token units for a session if it is still active.
    ///
    /// Failures are logged, never raised.
    pub(crate) async fn apply_token_usage(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        match self.load_session(session_id).await {
            Ok(session) if session.is_active() => {
                self.ledger.add(session_id, input_tokens, output_tokens);
            }
            Ok(session) => {
                debug!(
                    session_id = %session_id,
                    status = %session.status,
                    "Dropped token usage for non-active session"
                );
            }
            Err(SessionError::NotFound(_)) => {
                debug!(session_id = %session_id, "Dropped token usage for unknown session");
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    timestamp = %Utc::now(),
                    error = %e,
                    "Failed to record token usage"
                );
            }
        }
    }

    /// Writes every pending token tally to the durable store.
    ///
    /// Tallies for sessions that ended in the meantime are dropped; a tally
    /// that fails to land stays pending for the next flush.
    pub(crate) async fn flush_counters(&self) {
        for (session_id, tally) in self.ledger.drain() {
            if tally.is_empty() {
                continue;
            }
            // Guard spans the store write so the cached row advances in
            // step with the durable one
            let mut sessions = self.sessions.write().await;
            let applied = match Database::lock(&self.db) {
                Ok(db) => {
                    let mut repo = SqliteSessionRepository::new(db.conn());
                    repo.add_tokens(&session_id, tally.input_tokens, tally.output_tokens)
                }
                Err(e) => Err(e),
            };
            match applied {
                Ok(true) => {
                    if let Some(session) = sessions.get_mut(&session_id) {
                        session.input_tokens += tally.input_tokens;
                        session.output_tokens += tally.output_tokens;
                        session.total_tokens += tally.total();
                    }
                    debug!(
                        session_id = %session_id,
                        input_tokens = tally.input_tokens,
                        output_tokens = tally.output_tokens,
                        "Flushed token counters"
                    );
                }
                Ok(false) => {
                    debug!(session_id = %session_id, "Dropped pending counters for ended session");
                }
                Err(e) => {
                    self.ledger
                        .add(&session_id, tally.input_tokens, tally.output_tokens);
                    warn!(session_id = %session_id, error = %e, "Failed to flush token counters");
                }
            }
        }
    }

    // ========================================================================
    // Sweeper Support
    // ========================================================================

    /// Lists active sessions whose last activity predates the cutoff.
    pub(crate) fn stale_active_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let db = Database::lock(&self.db)?;
        let repo = SqliteSessionRepository::new(db.conn());
        Ok(repo.stale_active(cutoff)?)
    }

    /// Times out one idle session, recording the reason and observed idle
    /// hours.
    ///
    /// Returns false when the session already left the active status.
    pub(crate) async fn time_out_session(
        &self,
        session_id: &str,
        hours_inactive: f64,
    ) -> Result<bool> {
        self.close_session(
            session_id,
            SessionStatus::Inactive,
            EndReason::Timeout,
            Some(hours_inactive),
        )
        .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Conditionally transitions an active session to a terminal status,
    /// folding its pending token counters into the same statement.
    async fn close_session(
        &self,
        session_id: &str,
        next: SessionStatus,
        reason: EndReason,
        hours_inactive: Option<f64>,
    ) -> Result<bool> {
        let now = Utc::now();
        // Guard spans the ledger take and the store write so the cache and
        // the durable row move together
        let mut sessions = self.sessions.write().await;
        let pending = self.ledger.take(session_id);
        let closed = match Database::lock(&self.db) {
            Ok(db) => {
                let mut repo = SqliteSessionRepository::new(db.conn());
                repo.close_if_active(
                    session_id,
                    next,
                    reason,
                    now,
                    hours_inactive,
                    pending.input_tokens,
                    pending.output_tokens,
                )
            }
            Err(e) => Err(e),
        };
        match closed {
            Ok(true) => {
                sessions.remove(session_id);
                Ok(true)
            }
            Ok(false) => {
                if !pending.is_empty() {
                    debug!(session_id = %session_id, "Dropped pending counters for ended session");
                }
                Ok(false)
            }
            Err(e) => {
                if !pending.is_empty() {
                    self.ledger
                        .add(session_id, pending.input_tokens, pending.output_tokens);
                }
                Err(e.into())
            }
        }
    }

    /// Loads a session from the cache, falling back to the store and
    /// repopulating the cache.
    async fn load_session(&self, session_id: &str) -> Result<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return Ok(session.clone());
            }
        }
        let session = {
            let db = Database::lock(&self.db)?;
            let repo = SqliteSessionRepository::new(db.conn());
            repo.get_by_id(session_id)?
        };
        let Some(session) = session else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Folds pending ledger counters into an active session's counters.
    ///
    /// Terminal rows are already final; their counters were folded by the
    /// closing statement.
    fn merge_pending(&self, session: &mut Session) {
        if session.status != SessionStatus::Active {
            return;
        }
        let pending = self.ledger.peek(&session.id);
        if pending.is_empty() {
            return;
        }
        session.input_tokens += pending.input_tokens;
        session.output_tokens += pending.output_tokens;
        session.total_tokens += pending.total();
    }
}
