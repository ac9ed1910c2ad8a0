//! Per-conversation locking.
//!
//! At most one live lock exists per conversation. Contenders are queued,
//! never dropped. A second independent chain claiming a held conversation is
//! a fork: the claim still queues, but a `conversation:fork_detected` event
//! is published so observers can reconcile divergent branches. Locks expire
//! after a ttl; expiry does not cancel in-flight work, it only permits a new
//! holder, and the stale holder's eventual result is still delivered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::event::event_bus::{Event, EventBus, EventContext};
use crate::event::names;

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationLock {
    pub conversation_id: String,
    pub holder_request_id: String,
    pub holder_chain_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl ConversationLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO) > self.ttl
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Acquired(ConversationLock),
    /// A live lock is held by the same chain; the claim waits behind it.
    Queued { position: usize },
    /// A live lock is held by an unrelated chain; the claim is queued and a
    /// fork notification has been published.
    ForkDetected { holder_request_id: String },
}

/// One recorded fork attempt, kept for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkRecord {
    pub conversation_id: String,
    pub claimant_request_id: String,
    pub claimant_chain_id: String,
    pub holder_request_id: String,
    pub detected_at: DateTime<Utc>,
    /// True when the fork was observed while reclaiming an expired lock.
    pub reclaimed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LockStatus {
    pub holder: Option<ConversationLock>,
    pub waiters: Vec<String>,
    pub forks: Vec<ForkRecord>,
}

#[derive(Default)]
struct LockState {
    lock: Option<ConversationLock>,
    waiters: VecDeque<String>,
    forks: Vec<ForkRecord>,
}

/// Owns the lock table; each DashMap entry is the single authority for its
/// conversation. Fork notifications are published on the bus the manager
/// holds, after the table entry has been released.
pub struct ConversationLockManager {
    locks: DashMap<String, LockState>,
    event_bus: Arc<EventBus>,
    default_ttl: Duration,
}

impl ConversationLockManager {
    pub fn new(event_bus: Arc<EventBus>, default_ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            event_bus,
            default_ttl,
        }
    }

    /// Attempts to claim `conversation_id` for `request_id`.
    ///
    /// Granted immediately when no live lock exists (an expired lock counts
    /// as absent and is reclaimed, logged as a potential fork). Otherwise the
    /// claim queues; if the claimant belongs to a different chain than the
    /// holder, a fork is recorded and published.
    pub async fn acquire(
        &self,
        conversation_id: &str,
        request_id: &str,
        chain_id: &str,
        ttl: Option<Duration>,
    ) -> LockOutcome {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();

        // Decide under the entry lock; publish after releasing it.
        let (outcome, fork_event) = {
            let mut state = self.locks.entry(conversation_id.to_string()).or_default();

            let current = state.lock.clone();
            match current {
                Some(held) if !held.is_expired(now) => {
                    // Re-claims by a request already waiting are idempotent:
                    // no duplicate waiter entry, no duplicate fork record.
                    let already_waiting = state.waiters.iter().any(|w| w == request_id);
                    if !already_waiting {
                        state.waiters.push_back(request_id.to_string());
                    }
                    let position = state
                        .waiters
                        .iter()
                        .position(|w| w == request_id)
                        .map(|i| i + 1)
                        .unwrap_or_else(|| state.waiters.len());
                    if held.holder_chain_id == chain_id {
                        debug!(
                            conversation_id,
                            request_id, position, "lock held by same chain, queued"
                        );
                        (LockOutcome::Queued { position }, None)
                    } else if already_waiting {
                        (
                            LockOutcome::ForkDetected {
                                holder_request_id: held.holder_request_id.clone(),
                            },
                            None,
                        )
                    } else {
                        let record = ForkRecord {
                            conversation_id: conversation_id.to_string(),
                            claimant_request_id: request_id.to_string(),
                            claimant_chain_id: chain_id.to_string(),
                            holder_request_id: held.holder_request_id.clone(),
                            detected_at: now,
                            reclaimed: false,
                        };
                        warn!(
                            conversation_id,
                            claimant = request_id,
                            holder = %held.holder_request_id,
                            "fork detected: independent chain claimed a locked conversation"
                        );
                        state.forks.push(record.clone());
                        (
                            LockOutcome::ForkDetected {
                                holder_request_id: held.holder_request_id.clone(),
                            },
                            Some(Self::fork_event(&record)),
                        )
                    }
                }
                maybe_stale => {
                    let mut fork_event = None;
                    if let Some(stale) = &maybe_stale {
                        // Expired lock treated as absent; reclamation is a
                        // potential fork because the stale holder may still
                        // deliver a late result.
                        let record = ForkRecord {
                            conversation_id: conversation_id.to_string(),
                            claimant_request_id: request_id.to_string(),
                            claimant_chain_id: chain_id.to_string(),
                            holder_request_id: stale.holder_request_id.clone(),
                            detected_at: now,
                            reclaimed: true,
                        };
                        warn!(
                            conversation_id,
                            stale_holder = %stale.holder_request_id,
                            "expired lock reclaimed; potential fork"
                        );
                        state.forks.push(record.clone());
                        fork_event = Some(Self::fork_event(&record));
                    }
                    let lock = ConversationLock {
                        conversation_id: conversation_id.to_string(),
                        holder_request_id: request_id.to_string(),
                        holder_chain_id: chain_id.to_string(),
                        acquired_at: now,
                        ttl,
                    };
                    state.lock = Some(lock.clone());
                    state.waiters.retain(|w| w != request_id);
                    debug!(conversation_id, request_id, "lock acquired");
                    (LockOutcome::Acquired(lock), fork_event)
                }
            }
        };

        if let Some(event) = fork_event {
            self.event_bus.emit(event).await;
        }
        outcome
    }

    /// Releases the lock held by `request_id`. Releasing a lock that has
    /// already been reclaimed (or was never held) is a no-op; late releases
    /// from stale holders must not disturb the new holder.
    pub fn release(&self, conversation_id: &str, request_id: &str) -> bool {
        if let Some(mut state) = self.locks.get_mut(conversation_id) {
            match &state.lock {
                Some(held) if held.holder_request_id == request_id => {
                    state.lock = None;
                    debug!(conversation_id, request_id, "lock released");
                    return true;
                }
                Some(_) => {
                    debug!(
                        conversation_id,
                        request_id, "late release ignored, lock re-acquired by another holder"
                    );
                }
                None => {}
            }
            state.waiters.retain(|w| w != request_id);
        }
        false
    }

    pub fn status(&self, conversation_id: &str) -> LockStatus {
        self.locks
            .get(conversation_id)
            .map(|state| LockStatus {
                holder: state.lock.clone(),
                waiters: state.waiters.iter().cloned().collect(),
                forks: state.forks.clone(),
            })
            .unwrap_or_default()
    }

    /// Conversations currently holding a live lock.
    pub fn locked_conversations(&self) -> Vec<String> {
        let now = Utc::now();
        self.locks
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock
                    .as_ref()
                    .map(|l| !l.is_expired(now))
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn fork_event(record: &ForkRecord) -> Event {
        Event::new(names::CONVERSATION_FORK_DETECTED)
            .with("conversation_id", record.conversation_id.as_str())
            .with("claimant_request_id", record.claimant_request_id.as_str())
            .with("holder_request_id", record.holder_request_id.as_str())
            .with("reclaimed", record.reclaimed)
            .with_context(EventContext {
                request_id: record.claimant_request_id.clone(),
                chain_id: record.claimant_chain_id.clone(),
                conversation_id: record.conversation_id.clone(),
                ..Default::default()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> ConversationLockManager {
        ConversationLockManager::new(Arc::new(EventBus::new()), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = manager();
        let outcome = locks.acquire("c1", "r1", "chain-1", None).await;
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert_eq!(locks.locked_conversations(), vec!["c1".to_string()]);

        assert!(locks.release("c1", "r1"));
        assert!(locks.locked_conversations().is_empty());
    }

    #[tokio::test]
    async fn test_same_chain_contender_queues_without_fork() {
        let locks = manager();
        locks.acquire("c1", "r1", "chain-1", None).await;
        let outcome = locks.acquire("c1", "r2", "chain-1", None).await;
        assert_eq!(outcome, LockOutcome::Queued { position: 1 });
        assert!(locks.status("c1").forks.is_empty());
        assert_eq!(locks.status("c1").waiters, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_independent_chain_is_fork() {
        let bus = Arc::new(EventBus::new());
        let fork_count = Arc::new(AtomicUsize::new(0));
        let fork_count_clone = fork_count.clone();
        bus.register(
            names::CONVERSATION_FORK_DETECTED,
            crate::event::event_bus::HandlerPriority::Normal,
            None,
            Arc::new(move |_event| {
                let count = fork_count_clone.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(crate::event::event_bus::Value::Null)
                })
            }),
        );
        let locks = ConversationLockManager::new(bus, Duration::from_secs(300));

        locks.acquire("c1", "r1", "chain-1", None).await;
        let outcome = locks.acquire("c1", "r2", "chain-2", None).await;
        assert_eq!(
            outcome,
            LockOutcome::ForkDetected {
                holder_request_id: "r1".to_string()
            }
        );
        assert_eq!(fork_count.load(Ordering::SeqCst), 1);

        let status = locks.status("c1");
        assert_eq!(status.forks.len(), 1);
        assert!(!status.forks[0].reclaimed);
        // The fork claim is still queued, never dropped.
        assert_eq!(status.waiters, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_claim_by_same_waiter_is_idempotent() {
        let locks = manager();
        locks.acquire("c1", "r1", "chain-1", None).await;
        locks.acquire("c1", "r2", "chain-2", None).await;
        locks.acquire("c1", "r2", "chain-2", None).await;

        let status = locks.status("c1");
        assert_eq!(status.forks.len(), 1);
        assert_eq!(status.waiters, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed_as_fork() {
        let locks = manager();
        locks
            .acquire("c1", "r1", "chain-1", Some(Duration::ZERO))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = locks.acquire("c1", "r2", "chain-2", None).await;
        match outcome {
            LockOutcome::Acquired(lock) => assert_eq!(lock.holder_request_id, "r2"),
            other => panic!("expected reclamation, got {:?}", other),
        }
        let status = locks.status("c1");
        assert_eq!(status.forks.len(), 1);
        assert!(status.forks[0].reclaimed);
    }

    #[tokio::test]
    async fn test_no_fork_after_clean_release() {
        let locks = manager();
        locks.acquire("c1", "r1", "chain-1", None).await;
        locks.release("c1", "r1");

        // Prior holder finished; the new claim is a plain acquisition.
        let outcome = locks.acquire("c1", "r2", "chain-2", None).await;
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert!(locks.status("c1").forks.is_empty());
    }

    #[tokio::test]
    async fn test_late_release_does_not_disturb_new_holder() {
        let locks = manager();
        locks
            .acquire("c1", "r1", "chain-1", Some(Duration::ZERO))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.acquire("c1", "r2", "chain-2", None).await;

        // Stale holder releases after reclamation.
        assert!(!locks.release("c1", "r1"));
        let status = locks.status("c1");
        assert_eq!(status.holder.unwrap().holder_request_id, "r2");
    }
}
