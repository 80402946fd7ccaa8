//! Bounded retry queue for critical host messages.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dwell_core::{Envelope, MessageClass, MessageType};

use crate::channel::ChannelError;

const BASE_BACKOFF_SECS: i64 = 1;
const MAX_BACKOFF_SECS: i64 = 300;
const UNAVAILABLE_MULTIPLIER: i32 = 4;

/// Delay before retry number `attempt` (1-based).
///
/// `1s * 2^(attempt - 1)` capped at 300s; an unavailable host waits four
/// times as long.
pub fn backoff(attempt: u32, error: &ChannelError) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = Duration::seconds((BASE_BACKOFF_SECS << exponent).min(MAX_BACKOFF_SECS));
    match error {
        ChannelError::Unavailable(_) => base * UNAVAILABLE_MULTIPLIER,
        ChannelError::Timeout | ChannelError::Failed(_) => base,
    }
}

/// A queued delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueItem {
    pub operation: MessageType,
    pub payload: Envelope,
    pub priority: MessageClass,
    /// Failed deliveries so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

impl SyncQueueItem {
    fn coalesce_key(&self) -> String {
        self.payload.coalesce_key()
    }
}

#[derive(Debug, Clone)]
pub struct RetryQueue {
    items: VecDeque<SyncQueueItem>,
    capacity: usize,
    evicted: u64,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items dropped to stay within capacity.
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Queues an envelope that has not been attempted, eligible at `now`.
    pub fn enqueue(&mut self, envelope: Envelope, now: DateTime<Utc>) {
        self.insert(SyncQueueItem {
            operation: envelope.kind(),
            priority: envelope.class(),
            payload: envelope,
            attempt: 0,
            created_at: now,
            next_attempt_at: now,
        });
    }

    /// Queues an envelope after a failed delivery, with backoff.
    pub fn enqueue_failed(&mut self, envelope: Envelope, now: DateTime<Utc>, error: &ChannelError) {
        self.insert(SyncQueueItem {
            operation: envelope.kind(),
            priority: envelope.class(),
            payload: envelope,
            attempt: 1,
            created_at: now,
            next_attempt_at: now + backoff(1, error),
        });
    }

    /// Puts a retried item back after another failure.
    pub fn requeue(&mut self, mut item: SyncQueueItem, now: DateTime<Utc>, error: &ChannelError) {
        item.attempt = item.attempt.saturating_add(1);
        item.next_attempt_at = now + backoff(item.attempt, error);
        tracing::debug!(
            operation = %item.operation,
            attempt = item.attempt,
            retry_at = %item.next_attempt_at,
            "delivery retry scheduled"
        );
        self.insert(item);
    }

    /// The earliest moment an item becomes due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|item| item.next_attempt_at).min()
    }

    pub fn has_due(&self, now: DateTime<Utc>) -> bool {
        self.items.iter().any(|item| item.next_attempt_at <= now)
    }

    /// Removes the due item with the earliest retry time.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<SyncQueueItem> {
        let index = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.next_attempt_at <= now)
            .min_by_key(|(_, item)| (item.next_attempt_at, item.created_at))
            .map(|(index, _)| index)?;
        self.items.remove(index)
    }

    fn insert(&mut self, item: SyncQueueItem) {
        let key = item.coalesce_key();
        if let Some(index) = self.items.iter().position(|queued| queued.coalesce_key() == key) {
            tracing::debug!(coalesce_key = %key, "replacing queued delivery");
            self.items.remove(index);
        }
        while self.items.len() >= self.capacity {
            if let Some(oldest) = self.oldest_index().and_then(|index| self.items.remove(index)) {
                self.evicted += 1;
                tracing::warn!(
                    operation = %oldest.operation,
                    created_at = %oldest.created_at,
                    "retry queue full, evicting oldest delivery"
                );
            }
        }
        self.items.push_back(item);
    }

    fn oldest_index(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| item.created_at)
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwell_core::{ActivityKey, ActivitySession, Message, TimezoneContext};

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(seconds)
    }

    fn finalized(key: &str) -> Envelope {
        let session = ActivitySession::open(ActivityKey::new(key).unwrap(), t(0), TimezoneContext::utc());
        Envelope::new(Message::SessionFinalized(session))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let failed = ChannelError::Failed("boom".into());
        let secs: Vec<_> = [1, 2, 3, 4, 9, 10, 30]
            .into_iter()
            .map(|attempt| backoff(attempt, &failed).num_seconds())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 256, 300, 300]);
        assert_eq!(
            backoff(2, &ChannelError::Unavailable("down".into())).num_seconds(),
            8
        );
    }

    #[test]
    fn same_coalesce_key_replaces_queued_item() {
        let mut queue = RetryQueue::new(8);
        queue.enqueue(Envelope::new(Message::Enable), t(0));
        queue.enqueue(Envelope::new(Message::Disable), t(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(t(1)).unwrap().operation, MessageType::Disable);
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut queue = RetryQueue::new(2);
        queue.enqueue(finalized("a.com"), t(0));
        queue.enqueue(finalized("b.com"), t(1));
        queue.enqueue(finalized("c.com"), t(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.evicted(), 1);
        let remaining: Vec<_> = std::iter::from_fn(|| queue.pop_due(t(10)))
            .map(|item| item.created_at)
            .collect();
        assert_eq!(remaining, vec![t(1), t(2)]);
    }

    #[test]
    fn items_wait_out_their_backoff() {
        let mut queue = RetryQueue::new(8);
        let error = ChannelError::Timeout;
        queue.enqueue_failed(finalized("a.com"), t(0), &error);
        assert!(queue.pop_due(t(0)).is_none());
        assert_eq!(queue.next_due(), Some(t(1)));

        let item = queue.pop_due(t(1)).unwrap();
        queue.requeue(item, t(1), &error);
        assert_eq!(queue.next_due(), Some(t(3)));
        assert_eq!(queue.pop_due(t(3)).unwrap().attempt, 2);
    }
}
