//! Fire-and-forget activity and token-usage intake
//!
//! Collaborators report usage through [`UsageAccountant`], which enqueues
//! events on an unbounded channel consumed by a background task. Failures on
//! the consumer side are logged and dropped; no domain operation ever fails
//! because of bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::manager::SessionManager;

/// Estimates token units from a payload byte length.
///
/// Deterministic heuristic: one token per four bytes, rounded up.
/// Collaborators apply this to inbound and outbound payloads separately
/// before calling [`UsageAccountant::record_token_usage`].
#[must_use]
pub fn estimate_token_units(byte_len: usize) -> u64 {
    (byte_len as u64).div_ceil(4)
}

// ============================================================================
// Token Ledger
// ============================================================================

/// Pending token counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTally {
    /// Input token units not yet written to the store
    pub input_tokens: u64,
    /// Output token units not yet written to the store
    pub output_tokens: u64,
}

impl TokenTally {
    /// Sum of input and output units.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Returns true when no units are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// In-memory accumulator for token counters.
///
/// Counters for an active session are authoritative here between durable
/// flushes; session reads merge these pending values into the stored row.
#[derive(Debug, Default)]
pub struct TokenLedger {
    pending: Mutex<HashMap<String, TokenTally>>,
}

impl TokenLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds units to a session's pending tally.
    pub fn add(&self, session_id: &str, input_tokens: u64, output_tokens: u64) {
        let mut pending = self.pending.lock().unwrap();
        let tally = pending.entry(session_id.to_string()).or_default();
        tally.input_tokens += input_tokens;
        tally.output_tokens += output_tokens;
    }

    /// Returns a session's pending tally without clearing it.
    pub fn peek(&self, session_id: &str) -> TokenTally {
        self.pending
            .lock()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    /// Removes and returns a session's pending tally.
    pub fn take(&self, session_id: &str) -> TokenTally {
        self.pending
            .lock()
            .unwrap()
            .remove(session_id)
            .unwrap_or_default()
    }

    /// Drops a session's pending tally.
    pub fn discard(&self, session_id: &str) {
        self.pending.lock().unwrap().remove(session_id);
    }

    /// Removes and returns every pending tally.
    pub fn drain(&self) -> Vec<(String, TokenTally)> {
        self.pending.lock().unwrap().drain().collect()
    }
}

// ============================================================================
// Usage Accountant
// ============================================================================

/// Events consumed by the accounting task.
#[derive(Debug)]
enum AccountingEvent {
    Activity {
        session_id: String,
        at: DateTime<Utc>,
    },
    TokenUsage {
        session_id: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Intake handle for activity and token-usage events.
///
/// Cloning is cheap; every clone feeds the same consumer task. Recording is
/// fire-and-forget: the methods never block and never return an error.
#[derive(Debug, Clone)]
pub struct UsageAccountant {
    tx: mpsc::UnboundedSender<AccountingEvent>,
}

impl UsageAccountant {
    /// Spawns the consumer task and returns the intake handle.
    ///
    /// `flush_interval` adds a periodic durable counter flush on top of the
    /// flush-on-end baseline; `None` disables it.
    #[must_use]
    pub fn spawn(
        manager: Arc<SessionManager>,
        flush_interval: Option<Duration>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_consumer(manager, rx, flush_interval));
        (Self { tx }, handle)
    }

    /// Records an activity tick for a session.
    ///
    /// Dropped (and logged) if the session is no longer active or the
    /// consumer is gone.
    pub fn record_activity(&self, session_id: &str) {
        self.send(AccountingEvent::Activity {
            session_id: session_id.to_string(),
            at: Utc::now(),
        });
    }

    /// Records token units consumed by a session.
    pub fn record_token_usage(&self, session_id: &str, input_tokens: u64, output_tokens: u64) {
        if input_tokens == 0 && output_tokens == 0 {
            return;
        }
        self.send(AccountingEvent::TokenUsage {
            session_id: session_id.to_string(),
            input_tokens,
            output_tokens,
        });
    }

    /// Waits until every previously enqueued event has been applied and all
    /// pending counters are durably flushed.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(AccountingEvent::Flush { ack: ack_tx }).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Asks the consumer task to stop after a final flush.
    pub fn shutdown(&self) {
        let _ = self.tx.send(AccountingEvent::Shutdown);
    }

    fn send(&self, event: AccountingEvent) {
        if self.tx.send(event).is_err() {
            warn!("Accounting consumer is gone, dropping event");
        }
    }
}

async fn run_consumer(
    manager: Arc<SessionManager>,
    mut rx: mpsc::UnboundedReceiver<AccountingEvent>,
    flush_interval: Option<Duration>,
) {
    let mut ticker = flush_interval.map(tokio::time::interval);
    if let Some(ticker) = ticker.as_mut() {
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    }

    loop {
        let event = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                event = rx.recv() => event,
                _ = ticker.tick() => {
                    manager.flush_counters().await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        let Some(event) = event else { break };
        match event {
            AccountingEvent::Activity { session_id, at } => {
                manager.apply_activity(&session_id, at).await;
            }
            AccountingEvent::TokenUsage {
                session_id,
                input_tokens,
                output_tokens,
            } => {
                manager
                    .apply_token_usage(&session_id, input_tokens, output_tokens)
                    .await;
            }
            AccountingEvent::Flush { ack } => {
                manager.flush_counters().await;
                let _ = ack.send(());
            }
            AccountingEvent::Shutdown => break,
        }
    }

    // Final flush before exit
    manager.flush_counters().await;
    debug!("Accounting consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_token_units_rounds_up() {
        assert_eq!(estimate_token_units(0), 0);
        assert_eq!(estimate_token_units(1), 1);
        assert_eq!(estimate_token_units(4), 1);
        assert_eq!(estimate_token_units(5), 2);
        assert_eq!(estimate_token_units(160), 40);
        assert_eq!(estimate_token_units(481), 121);
    }

    #[test]
    fn test_tally_total_and_empty() {
        let tally = TokenTally::default();
        assert!(tally.is_empty());
        assert_eq!(tally.total(), 0);

        let tally = TokenTally {
            input_tokens: 40,
            output_tokens: 120,
        };
        assert!(!tally.is_empty());
        assert_eq!(tally.total(), 160);
    }

    #[test]
    fn test_ledger_add_accumulates() {
        let ledger = TokenLedger::new();
        ledger.add("s1", 40, 120);
        ledger.add("s1", 40, 120);
        ledger.add("s2", 1, 2);

        let tally = ledger.peek("s1");
        assert_eq!(tally.input_tokens, 80);
        assert_eq!(tally.output_tokens, 240);
        assert_eq!(ledger.peek("s2").total(), 3);
    }

    #[test]
    fn test_ledger_peek_does_not_clear() {
        let ledger = TokenLedger::new();
        ledger.add("s1", 10, 20);
        assert_eq!(ledger.peek("s1").total(), 30);
        assert_eq!(ledger.peek("s1").total(), 30);
    }

    #[test]
    fn test_ledger_take_clears() {
        let ledger = TokenLedger::new();
        ledger.add("s1", 10, 20);
        assert_eq!(ledger.take("s1").total(), 30);
        assert!(ledger.take("s1").is_empty());
    }

    #[test]
    fn test_ledger_unknown_session_is_empty() {
        let ledger = TokenLedger::new();
        assert!(ledger.peek("missing").is_empty());
        assert!(ledger.take("missing").is_empty());
    }

    #[test]
    fn test_ledger_drain_empties_everything() {
        let ledger = TokenLedger::new();
        ledger.add("s1", 1, 2);
        ledger.add("s2", 3, 4);

        let mut drained = ledger.drain();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "s1");
        assert_eq!(drained[1].1.total(), 7);
        assert!(ledger.drain().is_empty());
    }

    #[test]
    fn test_ledger_discard() {
        let ledger = TokenLedger::new();
        ledger.add("s1", 1, 2);
        ledger.discard("s1");
        assert!(ledger.peek("s1").is_empty());
    }
}
