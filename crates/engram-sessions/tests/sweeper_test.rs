//! Timeout sweeper behavior over real idle sessions: threshold edges,
//! pending counter folding, and the periodic task lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engram_sessions::{
    Database, EndReason, SessionConfig, SessionManager, SessionStatus, SharedDatabase, SweepReport,
    TimeoutSweeper, UsageAccountant,
};
use rusqlite::params;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_setup() -> (Arc<SessionManager>, SharedDatabase) {
    let db = Database::open_in_memory()
        .expect("in-memory database")
        .into_shared();
    let manager = Arc::new(SessionManager::new(Arc::clone(&db)));
    (manager, db)
}

/// Rewrites a session's last activity to `minutes` ago, bypassing the
/// monotonic guard the public path enforces.
fn backdate_last_activity(db: &SharedDatabase, session_id: &str, minutes: i64) {
    let stamp = (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();
    let db = Database::lock(db).unwrap();
    db.conn()
        .execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![stamp, session_id],
        )
        .unwrap();
}

#[tokio::test]
async fn test_idle_sessions_past_the_threshold_time_out() {
    init_tracing();
    let (manager, db) = test_setup();
    let session = manager
        .create_session(Some("proj-1"), "builder", None)
        .await
        .unwrap();
    backdate_last_activity(&db, &session.id, 121);

    let sweeper = TimeoutSweeper::new(Arc::clone(&manager), &SessionConfig::default());
    let report = sweeper.sweep_once().await;
    assert_eq!(report.examined, 1);
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.failed, 0);

    let session = manager.get_session(&session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Inactive);
    assert_eq!(session.end_reason, Some(EndReason::Timeout));
    assert!(session.ended_at.is_some());
    let hours = session.hours_inactive.unwrap();
    assert!(hours > 2.0 && hours < 2.1, "observed {hours} idle hours");

    // A second sweep finds nothing left
    let report = sweeper.sweep_once().await;
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn test_sessions_under_the_threshold_survive() {
    let (manager, db) = test_setup();
    let session = manager.create_session(None, "builder", None).await.unwrap();
    backdate_last_activity(&db, &session.id, 119);

    let sweeper = TimeoutSweeper::new(Arc::clone(&manager), &SessionConfig::default());
    let report = sweeper.sweep_once().await;
    assert_eq!(report.examined, 0);
    assert!(manager.get_session(&session.id).await.unwrap().is_active());
}

#[tokio::test]
async fn test_sweep_times_out_every_idle_session() {
    let (manager, db) = test_setup();
    let mut idle_ids = Vec::new();
    for _ in 0..3 {
        let session = manager
            .create_session(Some("proj-1"), "builder", None)
            .await
            .unwrap();
        idle_ids.push(session.id);
    }
    let fresh = manager
        .create_session(Some("proj-1"), "builder", None)
        .await
        .unwrap();
    for id in &idle_ids {
        backdate_last_activity(&db, id, 200);
    }

    let sweeper = TimeoutSweeper::new(Arc::clone(&manager), &SessionConfig::default());
    let report = sweeper.sweep_once().await;
    assert_eq!(report.examined, 3);
    assert_eq!(report.timed_out, 3);

    for id in &idle_ids {
        let session = manager.get_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Inactive);
    }
    assert!(manager.get_session(&fresh.id).await.unwrap().is_active());
}

#[tokio::test]
async fn test_timeout_folds_pending_counters_into_the_row() {
    init_tracing();
    let (manager, db) = test_setup();
    let session = manager.create_session(None, "builder", None).await.unwrap();

    let (accountant, handle) = UsageAccountant::spawn(Arc::clone(&manager), None);
    accountant.record_token_usage(&session.id, 120, 360);
    // Wait for the consumer to land the usage in the pending ledger
    let mut merged = 0;
    for _ in 0..100 {
        merged = manager.get_session(&session.id).await.unwrap().total_tokens;
        if merged == 480 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(merged, 480);

    backdate_last_activity(&db, &session.id, 180);
    let sweeper = TimeoutSweeper::new(Arc::clone(&manager), &SessionConfig::default());
    let report = sweeper.sweep_once().await;
    assert_eq!(report.timed_out, 1);

    let session = manager.get_session(&session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Inactive);
    assert_eq!(session.input_tokens, 120);
    assert_eq!(session.output_tokens, 360);
    assert_eq!(session.total_tokens, 480);

    accountant.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_started_sweeper_fires_immediately() {
    init_tracing();
    let (manager, db) = test_setup();
    let session = manager.create_session(None, "builder", None).await.unwrap();
    backdate_last_activity(&db, &session.id, 130);

    // A long interval proves the first tick does the work
    let config = SessionConfig {
        sweep_interval_secs: 3600,
        ..SessionConfig::default()
    };
    let mut sweeper = TimeoutSweeper::new(Arc::clone(&manager), &config);
    sweeper.start();
    assert!(sweeper.is_running());

    let mut status = SessionStatus::Active;
    for _ in 0..100 {
        status = manager.get_session(&session.id).await.unwrap().status;
        if status != SessionStatus::Active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, SessionStatus::Inactive);

    sweeper.stop().await;
    assert!(!sweeper.is_running());
}

#[tokio::test]
async fn test_zero_interval_disables_the_sweeper() {
    let (manager, _db) = test_setup();
    let config = SessionConfig {
        sweep_interval_secs: 0,
        ..SessionConfig::default()
    };
    let mut sweeper = TimeoutSweeper::new(manager, &config);
    sweeper.start();
    assert!(!sweeper.is_running());
}

#[tokio::test]
async fn test_oversized_threshold_never_times_out() {
    init_tracing();
    let (manager, db) = test_setup();
    let session = manager
        .create_session(None, "builder", None)
        .await
        .unwrap();
    // Idle far past the default threshold, so only the oversized
    // threshold can spare it
    backdate_last_activity(&db, &session.id, 600);

    // Representable as a duration, but not once subtracted from now
    let config = SessionConfig {
        timeout_threshold_secs: 10_000_000_000_000,
        ..SessionConfig::default()
    };
    let sweeper = TimeoutSweeper::new(Arc::clone(&manager), &config);
    assert_eq!(sweeper.sweep_once().await, SweepReport::default());

    // Too large for chrono entirely
    let config = SessionConfig {
        timeout_threshold_secs: u64::MAX,
        ..SessionConfig::default()
    };
    let sweeper = TimeoutSweeper::new(Arc::clone(&manager), &config);
    assert_eq!(sweeper.sweep_once().await, SweepReport::default());

    let session = manager.get_session(&session.id).await.unwrap();
    assert!(session.is_active());
}
