//! Session state types and the status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::SessionError;

/// Status of a session.
///
/// `Active` is the only live status. Both terminal statuses are final: a
/// session never returns to `Active` once it has left it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is live and accepting work
    #[default]
    Active,
    /// Session ended normally (explicit end or inactivity timeout)
    Inactive,
    /// Session was severed by a project disconnect
    Disconnected,
}

impl SessionStatus {
    /// Returns the string form stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    /// Parses a status from its stored string form.
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "inactive" => Ok(SessionStatus::Inactive),
            "disconnected" => Ok(SessionStatus::Disconnected),
            _ => Err(SessionError::InvalidInput(format!(
                "unknown session status: {s}"
            ))),
        }
    }

    /// Returns true for statuses a session can never leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    /// Returns true when the status machine permits the transition.
    ///
    /// The only edges are active to inactive and active to disconnected;
    /// there is no path back to active.
    #[must_use]
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Inactive)
                | (SessionStatus::Active, SessionStatus::Disconnected)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a session left the active status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The work unit finished normally
    Completed,
    /// The owning process shut down cleanly
    Shutdown,
    /// The inactivity sweeper reclaimed the session
    Timeout,
    /// The session's project was disconnected
    ProjectDisconnect,
}

impl EndReason {
    /// Returns the string form stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::Shutdown => "shutdown",
            EndReason::Timeout => "timeout",
            EndReason::ProjectDisconnect => "project_disconnect",
        }
    }

    /// Parses a reason from its stored string form.
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        match s {
            "completed" => Ok(EndReason::Completed),
            "shutdown" => Ok(EndReason::Shutdown),
            "timeout" => Ok(EndReason::Timeout),
            "project_disconnect" => Ok(EndReason::ProjectDisconnect),
            _ => Err(SessionError::InvalidInput(format!(
                "unknown end reason: {s}"
            ))),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of agent work tracked by the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable unique identifier (UUID v4)
    pub id: String,
    /// Human-facing identifier, e.g. `SES-2025-0001`
    pub display_id: String,
    /// Owning project, if any
    pub project_id: Option<String>,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// When the session started
    pub started_at: DateTime<Utc>,
    /// When the session left the active status
    pub ended_at: Option<DateTime<Utc>>,
    /// Most recent recorded activity
    pub last_activity_at: DateTime<Utc>,
    /// Input token units consumed
    pub input_tokens: u64,
    /// Output token units produced
    pub output_tokens: u64,
    /// Sum of input and output token units
    pub total_tokens: u64,
    /// Why the session ended, for ended sessions
    pub end_reason: Option<EndReason>,
    /// Idle hours observed by the sweeper when it timed the session out
    pub hours_inactive: Option<f64>,
    /// Short human-readable title
    pub title: Option<String>,
    /// Longer free-form description
    pub description: Option<String>,
    /// Kind of agent driving the session
    pub agent_type: String,
    /// Free-form descriptive key/value pairs
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Creates a new active session with zeroed counters.
    #[must_use]
    pub fn new(id: String, display_id: String, agent_type: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_id,
            project_id: None,
            status: SessionStatus::Active,
            started_at: now,
            ended_at: None,
            last_activity_at: now,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            end_reason: None,
            hours_inactive: None,
            title: None,
            description: None,
            agent_type,
            metadata: HashMap::new(),
        }
    }

    /// Assigns the session to a project.
    #[must_use]
    pub fn with_project(mut self, project_id: String) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Sets the session title.
    #[must_use]
    pub fn with_title(mut self, title: String) -> Self {
        self.title = Some(title);
        self
    }

    /// Returns true while the session accepts work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Elapsed time between start and end, or until now for a live session.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Partial update of a session's descriptive fields.
///
/// Unset fields are left unchanged; `metadata` replaces the whole map.
#[derive(Debug, Clone, Default)]
pub struct DescriptiveUpdate {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// Replacement metadata map
    pub metadata: Option<HashMap<String, String>>,
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions with this status
    pub status: Option<SessionStatus>,
    /// Only sessions assigned to this project
    pub project_id: Option<String>,
    /// Only sessions of this agent type
    pub agent_type: Option<String>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Returns true when the session passes every set criterion.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(project_id) = &self.project_id {
            if session.project_id.as_deref() != Some(project_id.as_str()) {
                return false;
            }
        }
        if let Some(agent_type) = &self.agent_type {
            if &session.agent_type != agent_type {
                return false;
            }
        }
        true
    }
}

/// Sort order for session listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionSort {
    /// Most recent activity first
    #[default]
    Recency,
    /// Highest token totals first
    TokenTotals,
    /// Most recently started first
    StartedAt,
}

/// Read-model view of a session for the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Stable unique identifier
    pub id: String,
    /// Human-facing identifier
    pub display_id: String,
    /// Owning project, if any
    pub project_id: Option<String>,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// Kind of agent driving the session
    pub agent_type: String,
    /// Short human-readable title
    pub title: Option<String>,
    /// When the session started
    pub started_at: DateTime<Utc>,
    /// When the session ended, for ended sessions
    pub ended_at: Option<DateTime<Utc>>,
    /// Most recent recorded activity
    pub last_activity_at: DateTime<Utc>,
    /// Seconds between start and end (or now, for live sessions)
    pub duration_secs: i64,
    /// Input token units consumed
    pub input_tokens: u64,
    /// Output token units produced
    pub output_tokens: u64,
    /// Sum of input and output token units
    pub total_tokens: u64,
    /// Why the session ended, for ended sessions
    pub end_reason: Option<EndReason>,
    /// Idle hours observed when the sweeper timed the session out
    pub hours_inactive: Option<f64>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            display_id: session.display_id.clone(),
            project_id: session.project_id.clone(),
            status: session.status,
            agent_type: session.agent_type.clone(),
            title: session.title.clone(),
            started_at: session.started_at,
            ended_at: session.ended_at,
            last_activity_at: session.last_activity_at,
            duration_secs: session.duration().num_seconds(),
            input_tokens: session.input_tokens,
            output_tokens: session.output_tokens,
            total_tokens: session.total_tokens,
            end_reason: session.end_reason,
            hours_inactive: session.hours_inactive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new(
            "abc-123".to_string(),
            "SES-2025-0001".to_string(),
            "architect".to_string(),
        )
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Inactive,
            SessionStatus::Disconnected,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        let result = SessionStatus::parse("paused");
        assert!(matches!(result, Err(SessionError::InvalidInput(_))));
    }

    #[test]
    fn test_status_machine_edges() {
        use SessionStatus::{Active, Disconnected, Inactive};

        assert!(Active.can_transition_to(Inactive));
        assert!(Active.can_transition_to(Disconnected));

        // No resurrection, no hops between terminal statuses
        assert!(!Inactive.can_transition_to(Active));
        assert!(!Disconnected.can_transition_to(Active));
        assert!(!Inactive.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Inactive));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Inactive.is_terminal());
        assert!(SessionStatus::Disconnected.is_terminal());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
        let parsed: SessionStatus = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(parsed, SessionStatus::Active);
    }

    #[test]
    fn test_end_reason_round_trip() {
        for reason in [
            EndReason::Completed,
            EndReason::Shutdown,
            EndReason::Timeout,
            EndReason::ProjectDisconnect,
        ] {
            assert_eq!(EndReason::parse(reason.as_str()).unwrap(), reason);
        }
        assert_eq!(EndReason::ProjectDisconnect.as_str(), "project_disconnect");
    }

    #[test]
    fn test_new_session_invariants() {
        let session = test_session();
        assert!(session.is_active());
        assert_eq!(session.started_at, session.last_activity_at);
        assert_eq!(session.ended_at, None);
        assert_eq!(session.input_tokens, 0);
        assert_eq!(session.output_tokens, 0);
        assert_eq!(session.total_tokens, 0);
        assert_eq!(session.end_reason, None);
        assert!(session.metadata.is_empty());
    }

    #[test]
    fn test_builders() {
        let session = test_session()
            .with_project("proj-1".to_string())
            .with_title("Refactor".to_string());
        assert_eq!(session.project_id, Some("proj-1".to_string()));
        assert_eq!(session.title, Some("Refactor".to_string()));
    }

    #[test]
    fn test_duration_uses_ended_at_when_set() {
        let mut session = test_session();
        session.ended_at = Some(session.started_at + chrono::Duration::minutes(90));
        assert_eq!(session.duration(), chrono::Duration::minutes(90));
    }

    #[test]
    fn test_filter_matches() {
        let session = test_session().with_project("proj-1".to_string());

        let empty = SessionFilter::default();
        assert!(empty.matches(&session));

        let by_project = SessionFilter {
            project_id: Some("proj-1".to_string()),
            ..SessionFilter::default()
        };
        assert!(by_project.matches(&session));

        let wrong_agent = SessionFilter {
            agent_type: Some("reviewer".to_string()),
            ..SessionFilter::default()
        };
        assert!(!wrong_agent.matches(&session));

        let wrong_status = SessionFilter {
            status: Some(SessionStatus::Inactive),
            ..SessionFilter::default()
        };
        assert!(!wrong_status.matches(&session));
    }

    #[test]
    fn test_snapshot_carries_totals_and_duration() {
        let mut session = test_session();
        session.input_tokens = 120;
        session.output_tokens = 360;
        session.total_tokens = 480;
        session.ended_at = Some(session.started_at + chrono::Duration::seconds(42));

        let snapshot = SessionSnapshot::from(&session);
        assert_eq!(snapshot.duration_secs, 42);
        assert_eq!(snapshot.total_tokens, 480);
        assert_eq!(snapshot.status, SessionStatus::Active);
    }
}
