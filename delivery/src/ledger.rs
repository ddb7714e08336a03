//! Acknowledgments reported by recipients.

use crate::types::{MessageId, NodeId};
use futures::{channel::oneshot, FutureExt};
use std::{
    collections::{hash_map::Entry as MapEntry, HashMap},
    future::Future,
    mem,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default time an acknowledgment is retained before it can be evicted.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// An acknowledgment of `message` by `recipient`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckRecord {
    pub message: MessageId,
    pub recipient: NodeId,
    pub acknowledged_at: Instant,
}

/// State of a single (message, recipient) pair.
enum Entry {
    /// Acknowledged (write-once).
    Acked(Instant),
    /// Not yet acknowledged, with the waiters to resolve once it is.
    Pending(Vec<oneshot::Sender<()>>),
}

/// Records acknowledgments keyed by (message, recipient).
///
/// Writes are idempotent: only the first acknowledgment of a pair is recorded. Instead of polling,
/// readers can [AckLedger::wait] on a pair and are resolved directly by [AckLedger::record_ack].
///
/// Records older than the configured TTL are evicted by [AckLedger::prune], which also discards
/// waiters that were abandoned.
pub struct AckLedger {
    ttl: Duration,

    // Map from Message => Recipient => Entry
    entries: Mutex<HashMap<MessageId, HashMap<NodeId, Entry>>>,
}

impl Default for AckLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl AckLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `recipient` acknowledged `message`.
    ///
    /// Returns `true` if the acknowledgment is new, `false` if the pair was already acknowledged.
    pub fn record_ack(&self, message: MessageId, recipient: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let recipients = entries.entry(message).or_default();
        let waiters = match recipients.entry(recipient.to_string()) {
            MapEntry::Vacant(entry) => {
                entry.insert(Entry::Acked(Instant::now()));
                Vec::new()
            }
            MapEntry::Occupied(mut entry) => match entry.get_mut() {
                Entry::Acked(_) => {
                    trace!(%message, recipient, "duplicate ack");
                    return false;
                }
                Entry::Pending(waiters) => {
                    let waiters = mem::take(waiters);
                    entry.insert(Entry::Acked(Instant::now()));
                    waiters
                }
            },
        };
        drop(entries);

        // Resolve waiters (ignoring any that went away)
        trace!(%message, recipient, waiters = waiters.len(), "ack recorded");
        for waiter in waiters {
            let _ = waiter.send(());
        }
        true
    }

    /// Returns whether `recipient` acknowledged `message`.
    pub fn has_ack(&self, message: MessageId, recipient: &str) -> bool {
        self.get(message, recipient).is_some()
    }

    /// Returns the acknowledgment of `message` by `recipient`, if recorded.
    pub fn get(&self, message: MessageId, recipient: &str) -> Option<AckRecord> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&message)?.get(recipient)? {
            Entry::Acked(at) => Some(AckRecord {
                message,
                recipient: recipient.to_string(),
                acknowledged_at: *at,
            }),
            Entry::Pending(_) => None,
        }
    }

    /// Wait for `recipient` to acknowledge `message`.
    ///
    /// Resolves immediately if the acknowledgment is already recorded. The check and the
    /// registration happen under the same lock, so an acknowledgment can never be missed.
    pub fn wait(&self, message: MessageId, recipient: &str) -> AckWaiter {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(message)
            .or_default()
            .entry(recipient.to_string())
            .or_insert_with(|| Entry::Pending(Vec::new()));
        match entry {
            Entry::Acked(_) => AckWaiter { receiver: None },
            Entry::Pending(waiters) => {
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                AckWaiter {
                    receiver: Some(receiver),
                }
            }
        }
    }

    /// Evict acknowledgments recorded before `now - ttl` and discard abandoned waiters.
    ///
    /// Returns the number of evicted acknowledgments.
    pub fn prune(&self, now: Instant) -> usize {
        let mut evicted = 0;
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, recipients| {
            recipients.retain(|_, entry| match entry {
                Entry::Acked(at) => {
                    let keep = now.saturating_duration_since(*at) < self.ttl;
                    if !keep {
                        evicted += 1;
                    }
                    keep
                }
                Entry::Pending(waiters) => {
                    waiters.retain(|waiter| !waiter.is_canceled());
                    !waiters.is_empty()
                }
            });
            !recipients.is_empty()
        });
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "pruned ack ledger");
        }
        evicted
    }

    /// Number of recorded acknowledgments.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .flat_map(|recipients| recipients.values())
            .filter(|entry| matches!(entry, Entry::Acked(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves once an acknowledgment is recorded.
///
/// Yields `true` when acknowledged, or `false` if the ledger dropped the waiter first.
#[must_use = "futures do nothing unless polled"]
pub struct AckWaiter {
    receiver: Option<oneshot::Receiver<()>>,
}

impl Future for AckWaiter {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.as_mut() {
            None => Poll::Ready(true),
            Some(receiver) => receiver.poll_unpin(cx).map(|result| result.is_ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    #[test]
    fn test_record_is_idempotent() {
        let ledger = AckLedger::default();
        let message = MessageId::random();
        assert!(!ledger.has_ack(message, "A"));

        assert!(ledger.record_ack(message, "A"));
        let first = ledger.get(message, "A").unwrap();
        assert!(!ledger.record_ack(message, "A"));
        assert_eq!(ledger.get(message, "A").unwrap(), first);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_pairs_are_independent() {
        let ledger = AckLedger::default();
        let first = MessageId::random();
        let second = MessageId::random();
        ledger.record_ack(first, "A");

        assert!(ledger.has_ack(first, "A"));
        assert!(!ledger.has_ack(first, "B"));
        assert!(!ledger.has_ack(second, "A"));
    }

    #[test]
    fn test_wait_already_acked() {
        let ledger = AckLedger::default();
        let message = MessageId::random();
        ledger.record_ack(message, "A");
        assert_eq!(ledger.wait(message, "A").now_or_never(), Some(true));
    }

    #[test]
    fn test_wait_resolved_by_record() {
        let ledger = AckLedger::default();
        let message = MessageId::random();
        let mut first = ledger.wait(message, "A");
        let second = ledger.wait(message, "A");
        let other = ledger.wait(message, "B");
        assert!((&mut first).now_or_never().is_none());

        assert!(ledger.record_ack(message, "A"));
        assert_eq!(first.now_or_never(), Some(true));
        assert_eq!(second.now_or_never(), Some(true));
        assert!(other.now_or_never().is_none());
    }

    #[test]
    fn test_pending_not_reported_as_ack() {
        let ledger = AckLedger::default();
        let message = MessageId::random();
        let _waiter = ledger.wait(message, "A");
        assert!(!ledger.has_ack(message, "A"));
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_evicts_expired() {
        let ledger = AckLedger::new(Duration::from_secs(10));
        let old = MessageId::random();
        ledger.record_ack(old, "A");

        tokio::time::advance(Duration::from_secs(6)).await;
        let recent = MessageId::random();
        ledger.record_ack(recent, "A");
        assert_eq!(ledger.prune(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ledger.prune(Instant::now()), 1);
        assert!(!ledger.has_ack(old, "A"));
        assert!(ledger.has_ack(recent, "A"));
    }

    #[test]
    fn test_prune_discards_abandoned_waiters() {
        let ledger = AckLedger::default();
        let message = MessageId::random();
        let abandoned = ledger.wait(message, "A");
        let live = ledger.wait(message, "B");
        drop(abandoned);

        ledger.prune(Instant::now());
        assert!(ledger.record_ack(message, "B"));
        assert_eq!(live.now_or_never(), Some(true));
        assert!(ledger.entries.lock().unwrap()[&message].get("A").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let ledger = Arc::new(AckLedger::default());
        let message = MessageId::random();
        let waiter = ledger.wait(message, "A");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.record_ack(message, "A") }));
        }
        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert!(waiter.await);
    }
}
