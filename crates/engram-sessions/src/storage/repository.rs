//! Repository implementations for session persistence
//!
//! Repositories borrow a live connection, so the same row-level SQL runs
//! against a plain connection or inside a transaction. Lifecycle writes are
//! conditional updates guarded on the current status; callers inspect the
//! returned bool instead of racing a read-then-write.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tracing::{debug, info};

use crate::session::state::{DescriptiveUpdate, EndReason, Session, SessionStatus};
use crate::storage::error::{StorageError, StorageResult};

// ============================================================================
// Row Parsing Helpers
// ============================================================================

/// Parses a JSON field from a database row.
fn parse_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: String = row.get(idx)?;
    serde_json::from_str(&json_str).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parses an RFC 3339 timestamp from a database row.
fn parse_timestamp(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let timestamp_str: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                idx,
                column_name.to_string(),
                rusqlite::types::Type::Text,
            )
        })
}

/// Parses a nullable RFC 3339 timestamp from a database row.
fn parse_optional_timestamp(
    row: &Row,
    idx: usize,
    column_name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let timestamp_str: Option<String> = row.get(idx)?;
    match timestamp_str {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    idx,
                    column_name.to_string(),
                    rusqlite::types::Type::Text,
                )
            }),
        None => Ok(None),
    }
}

fn parse_status(row: &Row, idx: usize) -> rusqlite::Result<SessionStatus> {
    let status: String = row.get(idx)?;
    SessionStatus::parse(&status).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, "status".to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_end_reason(row: &Row, idx: usize) -> rusqlite::Result<Option<EndReason>> {
    let reason: Option<String> = row.get(idx)?;
    match reason {
        Some(s) => EndReason::parse(&s).map(Some).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                idx,
                "end_reason".to_string(),
                rusqlite::types::Type::Text,
            )
        }),
        None => Ok(None),
    }
}

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        display_id: row.get(1)?,
        project_id: row.get(2)?,
        status: parse_status(row, 3)?,
        started_at: parse_timestamp(row, 4, "started_at")?,
        ended_at: parse_optional_timestamp(row, 5, "ended_at")?,
        last_activity_at: parse_timestamp(row, 6, "last_activity_at")?,
        input_tokens: row.get(7)?,
        output_tokens: row.get(8)?,
        total_tokens: row.get(9)?,
        end_reason: parse_end_reason(row, 10)?,
        hours_inactive: row.get(11)?,
        title: row.get(12)?,
        description: row.get(13)?,
        agent_type: row.get(14)?,
        metadata: parse_json_field(row, 15, "metadata")?,
    })
}

// ============================================================================
// Repository Traits
// ============================================================================

/// Repository operations over session rows.
pub trait SessionRepository {
    /// Inserts a new session row.
    fn create(&mut self, session: &Session) -> StorageResult<()>;

    /// Loads a session by id.
    fn get_by_id(&self, id: &str) -> StorageResult<Option<Session>>;

    /// Loads every session, most recently started first.
    fn get_all(&self) -> StorageResult<Vec<Session>>;

    /// Applies a descriptive-field patch unless the session is disconnected.
    ///
    /// Returns false when no writable row matched.
    fn update_descriptive(&mut self, id: &str, update: &DescriptiveUpdate) -> StorageResult<bool>;

    /// Moves an active session to another project.
    ///
    /// Returns false when the session is missing or not active.
    fn reassign_project(&mut self, id: &str, project_id: &str) -> StorageResult<bool>;

    /// Transitions an active session to a terminal status, folding pending
    /// token counters into the same statement.
    ///
    /// Returns false when the session is missing or already terminal.
    #[allow(clippy::too_many_arguments)]
    fn close_if_active(
        &mut self,
        id: &str,
        next: SessionStatus,
        reason: EndReason,
        at: DateTime<Utc>,
        hours_inactive: Option<f64>,
        pending_input: u64,
        pending_output: u64,
    ) -> StorageResult<bool>;

    /// Advances an active session's last-activity timestamp.
    ///
    /// The timestamp never moves backwards; returns false when the session
    /// is not active or the tick is stale.
    fn touch_activity(&mut self, id: &str, at: DateTime<Utc>) -> StorageResult<bool>;

    /// Adds token units to an active session's durable counters.
    ///
    /// Returns false when the session is not active.
    fn add_tokens(&mut self, id: &str, input_tokens: u64, output_tokens: u64)
    -> StorageResult<bool>;

    /// Lists active sessions whose last activity predates the cutoff.
    fn stale_active(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<(String, DateTime<Utc>)>>;

    /// Lists ids of active sessions assigned to a project.
    fn active_ids_for_project(&self, project_id: &str) -> StorageResult<Vec<String>>;

    /// Deletes a session row.
    fn delete(&mut self, id: &str) -> StorageResult<()>;
}

/// Repository operations over the binding table.
pub trait BindingRepository {
    /// Creates or replaces a key's binding (last writer wins).
    fn upsert(
        &mut self,
        binding_key: &str,
        session_id: &str,
        bound_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Looks up the session id bound to a key.
    ///
    /// Returns `None` for unknown keys and for bindings whose session row
    /// was deleted (the foreign key nulls them out).
    fn get(&self, binding_key: &str) -> StorageResult<Option<String>>;
}

// ============================================================================
// SQLite Session Repository
// ============================================================================

/// SQLite implementation of [`SessionRepository`].
pub struct SqliteSessionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSessionRepository<'a> {
    /// Creates a repository over a live connection or transaction.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SessionRepository for SqliteSessionRepository<'_> {
    fn create(&mut self, session: &Session) -> StorageResult<()> {
        let metadata_json = serde_json::to_string(&session.metadata)?;
        self.conn.execute(
            r#"
            INSERT INTO sessions (
                id, display_id, project_id, status, started_at, ended_at,
                last_activity_at, input_tokens, output_tokens, total_tokens,
                end_reason, hours_inactive, title, description, agent_type, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                session.id,
                session.display_id,
                session.project_id,
                session.status.as_str(),
                session.started_at.to_rfc3339(),
                session.ended_at.map(|at| at.to_rfc3339()),
                session.last_activity_at.to_rfc3339(),
                session.input_tokens,
                session.output_tokens,
                session.total_tokens,
                session.end_reason.map(|reason| reason.as_str()),
                session.hours_inactive,
                session.title,
                session.description,
                session.agent_type,
                metadata_json,
            ],
        )?;
        debug!(session_id = %session.id, display_id = %session.display_id, "Inserted session row");
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> StorageResult<Option<Session>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, display_id, project_id, status, started_at, ended_at,
                   last_activity_at, input_tokens, output_tokens, total_tokens,
                   end_reason, hours_inactive, title, description, agent_type, metadata
            FROM sessions WHERE id = ?1
            "#,
        )?;
        let mut rows = stmt.query_map(params![id], session_from_row)?;
        match rows.next() {
            Some(Ok(session)) => Ok(Some(session)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn get_all(&self) -> StorageResult<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, display_id, project_id, status, started_at, ended_at,
                   last_activity_at, input_tokens, output_tokens, total_tokens,
                   end_reason, hours_inactive, title, description, agent_type, metadata
            FROM sessions ORDER BY started_at DESC
            "#,
        )?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn update_descriptive(&mut self, id: &str, update: &DescriptiveUpdate) -> StorageResult<bool> {
        let metadata_json = match &update.metadata {
            Some(metadata) => Some(serde_json::to_string(metadata)?),
            None => None,
        };
        let rows_affected = self.conn.execute(
            r#"
            UPDATE sessions
            SET title = COALESCE(?2, title),
                description = COALESCE(?3, description),
                metadata = COALESCE(?4, metadata)
            WHERE id = ?1 AND status IN ('active', 'inactive')
            "#,
            params![id, update.title, update.description, metadata_json],
        )?;
        if rows_affected > 0 {
            debug!(session_id = %id, "Updated session descriptive fields");
        }
        Ok(rows_affected > 0)
    }

    fn reassign_project(&mut self, id: &str, project_id: &str) -> StorageResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE sessions SET project_id = ?2 WHERE id = ?1 AND status = 'active'",
            params![id, project_id],
        )?;
        Ok(rows_affected > 0)
    }

    fn close_if_active(
        &mut self,
        id: &str,
        next: SessionStatus,
        reason: EndReason,
        at: DateTime<Utc>,
        hours_inactive: Option<f64>,
        pending_input: u64,
        pending_output: u64,
    ) -> StorageResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE sessions
            SET status = ?2,
                ended_at = ?3,
                end_reason = ?4,
                hours_inactive = ?5,
                input_tokens = input_tokens + ?6,
                output_tokens = output_tokens + ?7,
                total_tokens = total_tokens + ?6 + ?7
            WHERE id = ?1 AND status = 'active'
            "#,
            params![
                id,
                next.as_str(),
                at.to_rfc3339(),
                reason.as_str(),
                hours_inactive,
                pending_input,
                pending_output,
            ],
        )?;
        if rows_affected > 0 {
            info!(session_id = %id, status = %next, reason = %reason, "Closed session row");
        }
        Ok(rows_affected > 0)
    }

    fn touch_activity(&mut self, id: &str, at: DateTime<Utc>) -> StorageResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE sessions SET last_activity_at = ?2
            WHERE id = ?1 AND status = 'active' AND last_activity_at <= ?2
            "#,
            params![id, at.to_rfc3339()],
        )?;
        Ok(rows_affected > 0)
    }

    fn add_tokens(
        &mut self,
        id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> StorageResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE sessions
            SET input_tokens = input_tokens + ?2,
                output_tokens = output_tokens + ?3,
                total_tokens = total_tokens + ?2 + ?3
            WHERE id = ?1 AND status = 'active'
            "#,
            params![id, input_tokens, output_tokens],
        )?;
        Ok(rows_affected > 0)
    }

    fn stale_active(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<(String, DateTime<Utc>)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, last_activity_at FROM sessions
            WHERE status = 'active' AND last_activity_at < ?1
            ORDER BY last_activity_at ASC
            "#,
        )?;
        let stale = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                let id: String = row.get(0)?;
                let last_activity_at = parse_timestamp(row, 1, "last_activity_at")?;
                Ok((id, last_activity_at))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stale)
    }

    fn active_ids_for_project(&self, project_id: &str) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM sessions
             WHERE project_id = ?1 AND status = 'active'
             ORDER BY started_at ASC",
        )?;
        let ids = stmt
            .query_map(params![project_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn delete(&mut self, id: &str) -> StorageResult<()> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if rows_affected == 0 {
            return Err(StorageError::NotFound(format!("session {id} not found")));
        }
        info!(session_id = %id, "Deleted session row");
        Ok(())
    }
}

// ============================================================================
// SQLite Binding Repository
// ============================================================================

/// SQLite implementation of [`BindingRepository`].
pub struct SqliteBindingRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteBindingRepository<'a> {
    /// Creates a repository over a live connection or transaction.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl BindingRepository for SqliteBindingRepository<'_> {
    fn upsert(
        &mut self,
        binding_key: &str,
        session_id: &str,
        bound_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO session_bindings (binding_key, session_id, bound_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(binding_key) DO UPDATE SET
                session_id = excluded.session_id,
                bound_at = excluded.bound_at
            "#,
            params![binding_key, session_id, bound_at.to_rfc3339()],
        )?;
        debug!(binding_key = %binding_key, session_id = %session_id, "Upserted binding");
        Ok(())
    }

    fn get(&self, binding_key: &str) -> StorageResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM session_bindings WHERE binding_key = ?1")?;
        let mut rows = stmt.query_map(params![binding_key], |row| {
            row.get::<_, Option<String>>(0)
        })?;
        match rows.next() {
            Some(Ok(session_id)) => Ok(session_id),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}
