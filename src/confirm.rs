// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirmation Tracking
//!
//! Correlates outbound publishes with the broker's asynchronous ack/nack
//! signals. Each publish registers a pending entry keyed by its correlation id
//! and receives a [`ConfirmHandle`]. The first of `resolve` or `expire` to reach
//! a pending entry decides its outcome; everything after that is a logged
//! no-op, so duplicate or late confirms from an at-least-once transport never
//! reach the caller twice.
//!
//! Resolved entries are kept as tombstones until `deadline + grace` so that a
//! late confirm is recognised as such, then evicted by [`ConfirmationTracker::sweep`].

use crate::{
    errors::DeliveryError,
    events::{DeliveryEvent, EventKind, EventSink},
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, warn};

/// Lifecycle of a tracked publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Pending,
    Acked,
    Nacked,
    TimedOut,
}

/// Terminal outcome delivered to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    Rejected(Option<String>),
    TimedOut,
}

impl ConfirmOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmOutcome::Confirmed)
    }

    fn state(&self) -> ConfirmState {
        match self {
            ConfirmOutcome::Confirmed => ConfirmState::Acked,
            ConfirmOutcome::Rejected(_) => ConfirmState::Nacked,
            ConfirmOutcome::TimedOut => ConfirmState::TimedOut,
        }
    }

    fn event(&self, correlation_id: &str) -> DeliveryEvent {
        match self {
            ConfirmOutcome::Confirmed => DeliveryEvent::new(EventKind::Confirmed, correlation_id, None),
            ConfirmOutcome::Rejected(reason) => {
                DeliveryEvent::new(EventKind::Rejected, correlation_id, reason.clone())
            }
            ConfirmOutcome::TimedOut => DeliveryEvent::new(EventKind::TimedOut, correlation_id, None),
        }
    }
}

struct PendingConfirmation {
    state: ConfirmState,
    notify: Option<oneshot::Sender<ConfirmOutcome>>,
    deadline: Instant,
}

/// Concurrent map of publishes awaiting a broker confirm.
pub struct ConfirmationTracker {
    entries: DashMap<String, PendingConfirmation>,
    grace: Duration,
    events: Arc<dyn EventSink>,
}

impl ConfirmationTracker {
    /// Creates a tracker keeping resolved entries for `grace` past their deadline.
    pub fn new(grace: Duration, events: Arc<dyn EventSink>) -> Arc<ConfirmationTracker> {
        Arc::new(ConfirmationTracker {
            entries: DashMap::default(),
            grace,
            events,
        })
    }

    /// Registers a pending confirmation that times out after `timeout`.
    ///
    /// # Parameters
    /// * `correlation_id` - Id the broker confirm will be matched against
    /// * `timeout` - How long the returned handle waits before expiring the entry
    ///
    /// # Returns
    /// A handle resolving to the entry's single outcome, or
    /// `DuplicateCorrelationError` when the id is still pending. An id whose
    /// previous publish already resolved may be tracked again.
    pub fn track(
        self: &Arc<Self>,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ConfirmHandle, DeliveryError> {
        let deadline = Instant::now() + timeout;
        let (notify, receiver) = oneshot::channel();
        let pending = PendingConfirmation {
            state: ConfirmState::Pending,
            notify: Some(notify),
            deadline,
        };

        match self.entries.entry(correlation_id.to_owned()) {
            Entry::Occupied(entry) if entry.get().state == ConfirmState::Pending => {
                warn!(correlation_id, "correlation id is already being tracked");
                return Err(DeliveryError::DuplicateCorrelationError(
                    correlation_id.to_owned(),
                ));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(pending);
            }
            Entry::Vacant(entry) => {
                entry.insert(pending);
            }
        }

        debug!(correlation_id, "tracking confirmation");

        Ok(ConfirmHandle {
            correlation_id: correlation_id.to_owned(),
            deadline,
            receiver: Some(receiver),
            outcome: None,
            tracker: self.clone(),
        })
    }

    /// Records the broker's ack or nack for `correlation_id`.
    ///
    /// Returns `true` when this call decided the outcome.
    pub fn resolve(&self, correlation_id: &str, ack: bool, reason: Option<String>) -> bool {
        let outcome = if ack {
            ConfirmOutcome::Confirmed
        } else {
            ConfirmOutcome::Rejected(reason)
        };

        self.settle(correlation_id, outcome)
    }

    /// Times out a confirmation that is still pending.
    ///
    /// Returns `true` when this call decided the outcome.
    pub fn expire(&self, correlation_id: &str) -> bool {
        self.settle(correlation_id, ConfirmOutcome::TimedOut)
    }

    /// Current state of `correlation_id`, `None` once evicted or never tracked.
    pub fn state(&self, correlation_id: &str) -> Option<ConfirmState> {
        self.entries.get(correlation_id).map(|entry| entry.state)
    }

    /// Number of entries, resolved tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Times out every pending entry whose deadline has passed.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.state == ConfirmState::Pending && entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        overdue.iter().filter(|id| self.expire(id)).count()
    }

    /// Expires overdue entries, then evicts resolved ones past their grace period.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        self.expire_overdue();

        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.state == ConfirmState::Pending || entry.deadline + self.grace > now
        });

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "evicted resolved confirmations");
        }

        evicted
    }

    /// Runs [`sweep`](Self::sweep) every `every` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    debug!("tracker dropped, stopping sweeper");
                    return;
                };
                tracker.sweep();
            }
        })
    }

    /// Forgets an entry whose message never reached the broker.
    pub(crate) fn discard(&self, correlation_id: &str) {
        self.entries
            .remove_if(correlation_id, |_, entry| entry.state == ConfirmState::Pending);
    }

    fn settle(&self, correlation_id: &str, outcome: ConfirmOutcome) -> bool {
        let Some(mut entry) = self.entries.get_mut(correlation_id) else {
            warn!(correlation_id, outcome = ?outcome, "confirmation for an unknown correlation id");
            return false;
        };

        if entry.state != ConfirmState::Pending {
            debug!(
                correlation_id,
                state = ?entry.state,
                "ignoring confirmation for an already resolved publish"
            );
            return false;
        }

        entry.state = outcome.state();
        let notify = entry.notify.take();
        drop(entry);

        if let Some(notify) = notify {
            if notify.send(outcome.clone()).is_err() {
                debug!(correlation_id, "publish handle was cancelled");
            }
        }

        self.events.emit(outcome.event(correlation_id));
        true
    }
}

/// Caller's view of a tracked publish.
///
/// Resolves to exactly one [`ConfirmOutcome`].
pub struct ConfirmHandle {
    correlation_id: String,
    deadline: Instant,
    receiver: Option<oneshot::Receiver<ConfirmOutcome>>,
    outcome: Option<ConfirmOutcome>,
    tracker: Arc<ConfirmationTracker>,
}

impl ConfirmHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the broker confirm, expiring the entry once the deadline passes.
    pub async fn wait(mut self) -> ConfirmOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }

        let Some(mut receiver) = self.receiver.take() else {
            return ConfirmOutcome::TimedOut;
        };

        match time::timeout_at(self.deadline, &mut receiver).await {
            Ok(received) => received.unwrap_or(ConfirmOutcome::TimedOut),
            Err(_) => {
                self.tracker.expire(&self.correlation_id);
                // a confirm that raced the deadline may have won
                receiver.await.unwrap_or(ConfirmOutcome::TimedOut)
            }
        }
    }

    /// Returns the outcome if it is already known, without waiting.
    pub fn try_outcome(&mut self) -> Option<ConfirmOutcome> {
        if self.outcome.is_none() {
            if let Some(receiver) = self.receiver.as_mut() {
                match receiver.try_recv() {
                    Ok(outcome) => {
                        self.outcome = Some(outcome);
                        self.receiver = None;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.outcome = Some(ConfirmOutcome::TimedOut);
                        self.receiver = None;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
            }
        }

        self.outcome.clone()
    }

    /// Stops listening for the outcome. The message may already have been sent.
    pub fn cancel(self) {
        debug!(correlation_id = self.correlation_id, "confirmation handle cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tracker() -> (Arc<ConfirmationTracker>, mpsc::UnboundedReceiver<DeliveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConfirmationTracker::new(Duration::from_secs(30), Arc::new(tx)), rx)
    }

    #[tokio::test]
    async fn ack_resolves_handle() {
        let (tracker, mut events) = tracker();
        let handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        assert_eq!(tracker.state("id-1"), Some(ConfirmState::Pending));
        assert!(tracker.resolve("id-1", true, None));

        assert_eq!(handle.wait().await, ConfirmOutcome::Confirmed);
        assert_eq!(tracker.state("id-1"), Some(ConfirmState::Acked));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Confirmed);
    }

    #[tokio::test]
    async fn nack_carries_reason() {
        let (tracker, _events) = tracker();
        let handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        tracker.resolve("id-1", false, Some("queue full".to_owned()));

        assert_eq!(
            handle.wait().await,
            ConfirmOutcome::Rejected(Some("queue full".to_owned()))
        );
    }

    #[tokio::test]
    async fn tracking_pending_id_twice_fails() {
        let (tracker, _events) = tracker();
        let _handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        let err = tracker.track("id-1", Duration::from_secs(5)).err().unwrap();
        assert_eq!(err, DeliveryError::DuplicateCorrelationError("id-1".to_owned()));
    }

    #[tokio::test]
    async fn resolved_id_can_be_tracked_again() {
        let (tracker, _events) = tracker();
        let _first = tracker.track("id-1", Duration::from_secs(5)).unwrap();
        tracker.resolve("id-1", true, None);

        let second = tracker.track("id-1", Duration::from_secs(5));
        assert!(second.is_ok());
        assert_eq!(tracker.state("id-1"), Some(ConfirmState::Pending));
    }

    #[tokio::test]
    async fn duplicate_confirms_resolve_once() {
        let (tracker, mut events) = tracker();
        let handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        let mut tasks = vec![];
        for i in 0..32 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                tracker.resolve("id-1", i % 2 == 0, None)
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let outcome = handle.wait().await;
        assert!(matches!(
            outcome,
            ConfirmOutcome::Confirmed | ConfirmOutcome::Rejected(None)
        ));

        assert!(events.recv().await.is_some());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_confirm_is_ignored() {
        let (tracker, mut events) = tracker();

        assert!(!tracker.resolve("missing", true, None));
        assert!(tracker.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_confirm() {
        let (tracker, mut events) = tracker();
        let handle = tracker.track("id-1", Duration::from_millis(200)).unwrap();

        assert_eq!(handle.wait().await, ConfirmOutcome::TimedOut);
        assert_eq!(tracker.state("id-1"), Some(ConfirmState::TimedOut));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_after_expire_is_ignored() {
        let (tracker, _events) = tracker();
        let handle = tracker.track("id-1", Duration::from_millis(200)).unwrap();

        assert!(tracker.expire("id-1"));
        assert!(!tracker.resolve("id-1", true, None));

        assert_eq!(handle.wait().await, ConfirmOutcome::TimedOut);
    }

    #[tokio::test]
    async fn try_outcome_polls_without_blocking() {
        let (tracker, _events) = tracker();
        let mut handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        assert_eq!(handle.try_outcome(), None);
        tracker.resolve("id-1", true, None);
        assert_eq!(handle.try_outcome(), Some(ConfirmOutcome::Confirmed));
        assert_eq!(handle.wait().await, ConfirmOutcome::Confirmed);
    }

    #[tokio::test]
    async fn cancelled_handle_still_resolves_entry() {
        let (tracker, mut events) = tracker();
        let handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        handle.cancel();

        assert!(tracker.resolve("id-1", true, None));
        assert_eq!(tracker.state("id-1"), Some(ConfirmState::Acked));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_then_evicts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = ConfirmationTracker::new(Duration::from_secs(1), Arc::new(tx));
        let mut lost = tracker.track("lost", Duration::from_millis(100)).unwrap();
        let _acked = tracker.track("acked", Duration::from_millis(100)).unwrap();
        tracker.resolve("acked", true, None);

        time::advance(Duration::from_millis(150)).await;
        assert_eq!(tracker.sweep(), 0);
        assert_eq!(tracker.state("lost"), Some(ConfirmState::TimedOut));
        assert_eq!(lost.try_outcome(), Some(ConfirmOutcome::TimedOut));

        time::advance(Duration::from_secs(1)).await;
        assert_eq!(tracker.sweep(), 2);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_in_background() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = ConfirmationTracker::new(Duration::from_millis(10), Arc::new(tx));
        let _handle = tracker.track("lost", Duration::from_millis(50)).unwrap();

        let sweeper = tracker.spawn_sweeper(Duration::from_millis(20));
        time::sleep(Duration::from_millis(200)).await;

        assert!(tracker.is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn discard_drops_pending_entry() {
        let (tracker, _events) = tracker();
        let _handle = tracker.track("id-1", Duration::from_secs(5)).unwrap();

        tracker.discard("id-1");

        assert!(tracker.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_ack_and_expiry_settle_once() {
        for round in 0..64 {
            let (tracker, mut events) = tracker();
            let id = format!("race-{round}");
            let handle = tracker.track(&id, Duration::from_secs(5)).unwrap();
            let start = Arc::new(tokio::sync::Barrier::new(2));

            let acker = {
                let (tracker, id, start) = (tracker.clone(), id.clone(), start.clone());
                tokio::spawn(async move {
                    start.wait().await;
                    tracker.resolve(&id, true, None)
                })
            };
            let expirer = {
                let (tracker, id, start) = (tracker.clone(), id.clone(), start.clone());
                tokio::spawn(async move {
                    start.wait().await;
                    tracker.expire(&id)
                })
            };

            let acked = acker.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(acked ^ expired, "exactly one of ack and expiry must win");

            let (outcome, state, kind) = if acked {
                (ConfirmOutcome::Confirmed, ConfirmState::Acked, EventKind::Confirmed)
            } else {
                (ConfirmOutcome::TimedOut, ConfirmState::TimedOut, EventKind::TimedOut)
            };

            assert_eq!(handle.wait().await, outcome);
            assert_eq!(tracker.state(&id), Some(state));
            assert_eq!(events.try_recv().unwrap().kind, kind);
            assert!(events.try_recv().is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tracking_keeps_every_entry() {
        let (tracker, _events) = tracker();

        let mut tasks = vec![];
        for worker in 0..8 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                (0..100)
                    .map(|n| tracker.track(&format!("w{worker}-{n}"), Duration::from_secs(5)).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut handles = vec![];
        for task in tasks {
            handles.extend(task.await.unwrap());
        }

        assert_eq!(tracker.len(), 800);
        assert!(handles
            .iter()
            .all(|handle| tracker.state(handle.correlation_id()) == Some(ConfirmState::Pending)));

        for handle in &handles {
            assert!(tracker.resolve(handle.correlation_id(), true, None));
        }
        for handle in handles {
            assert_eq!(handle.wait().await, ConfirmOutcome::Confirmed);
        }
    }
}
