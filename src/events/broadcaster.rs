//! # Event Broadcaster
//!
//! Turns producer calls into persisted events, fans them out to live
//! subscribers of the task's topic, reconciles (re)subscribing clients from
//! the event log and redelivers buffered events.
//!
//! Everything that sends a task's events to a client (live emission,
//! reconciliation, buffered redelivery) runs under that task's async lock, so
//! per-task delivery order matches storage order. While a client has a
//! buffered entry pending for a task, new live events for that pair are
//! queued behind it instead of pushed.

use crate::error::{RelayError, RelayResult};
use crate::events::event_log::EventLog;
use crate::events::types::{Event, EventId, EventType, NewEvent};
use crate::logging::{log_delivery_operation, log_error};
use crate::messaging::errors::TransportError;
use crate::messaging::message::{CompletedData, ErrorData, ProgressData, ServerMessage};
use crate::messaging::transport::ClientTransport;
use crate::registry::ConnectionRegistry;
use crate::resilience::{BufferedEvent, RecoveryBuffer, RetryOutcome};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome counts of one redelivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub delivered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub discarded: usize,
}

impl RetrySummary {
    pub fn merge(&mut self, other: RetrySummary) {
        self.delivered += other.delivered;
        self.rescheduled += other.rescheduled;
        self.exhausted += other.exhausted;
        self.discarded += other.discarded;
    }

    pub fn is_empty(&self) -> bool {
        *self == RetrySummary::default()
    }
}

pub struct EventBroadcaster {
    event_log: Arc<EventLog>,
    connections: Arc<ConnectionRegistry>,
    recovery: Arc<RecoveryBuffer>,
    task_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("event_log", &self.event_log)
            .field("connections", &self.connections)
            .field("recovery", &self.recovery)
            .field("task_locks", &self.task_locks.len())
            .finish()
    }
}

impl EventBroadcaster {
    pub fn new(
        event_log: Arc<EventLog>,
        connections: Arc<ConnectionRegistry>,
        recovery: Arc<RecoveryBuffer>,
    ) -> Self {
        Self {
            event_log,
            connections,
            recovery,
            task_locks: DashMap::new(),
        }
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn recovery(&self) -> &Arc<RecoveryBuffer> {
        &self.recovery
    }

    fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.task_locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop delivery locks nobody holds; returns how many were removed
    pub fn prune_task_locks(&self) -> usize {
        let before = self.task_locks.len();
        self.task_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.task_locks.len())
    }

    pub async fn emit_progress(&self, task_id: &str, data: ProgressData) -> RelayResult<Event> {
        self.emit(EventType::Progress, task_id, serde_json::to_value(data)?)
            .await
    }

    pub async fn emit_completed(&self, task_id: &str, data: CompletedData) -> RelayResult<Event> {
        self.emit(EventType::Completed, task_id, serde_json::to_value(data)?)
            .await
    }

    pub async fn emit_error(&self, task_id: &str, data: ErrorData) -> RelayResult<Event> {
        self.emit(EventType::Error, task_id, serde_json::to_value(data)?)
            .await
    }

    /// Persist, then push to every connected subscriber.
    ///
    /// Only a log write failure reaches the caller; failed pushes are buffered.
    async fn emit(&self, event_type: EventType, task_id: &str, data: Value) -> RelayResult<Event> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let event = self
            .event_log
            .store_event(NewEvent::new(event_type, task_id, data))
            .await?;
        let message = ServerMessage::from_event(&event)?;

        let subscribers = self.connections.subscribers_for(task_id);
        let pushes = subscribers.into_iter().map(|(client_id, transport)| {
            let event = &event;
            let message = &message;
            async move {
                if self.recovery.has_pending(&client_id, &event.task_id) {
                    self.recovery.buffer_event(&client_id, event.clone());
                    log_delivery_operation("emit", &client_id, task_id, event.id.sequence(), "queued");
                    return false;
                }
                match transport.send(message).await {
                    Ok(()) => {
                        log_delivery_operation("emit", &client_id, task_id, event.id.sequence(), "delivered");
                        true
                    }
                    Err(e) => {
                        self.buffer_failed_push(&client_id, event, &e);
                        false
                    }
                }
            }
        });
        let delivered = join_all(pushes).await.into_iter().filter(|ok| *ok).count();

        debug!(
            task_id = %task_id,
            event_id = event.id.sequence(),
            event_type = %event.event_type,
            delivered = delivered,
            "Event broadcast"
        );
        Ok(event)
    }

    fn buffer_failed_push(&self, client_id: &str, event: &Event, error: &TransportError) {
        let transient = RelayError::TransientDeliveryError {
            client_id: client_id.to_string(),
            reason: error.to_string(),
        };
        warn!(
            client_id = %client_id,
            task_id = %event.task_id,
            event_id = event.id.sequence(),
            error = %transient,
            "Push failed; buffering event for retry"
        );
        self.recovery.buffer_event(client_id, event.clone());
    }

    /// Subscribe a connected client, optionally reconciling from `last_event_id`.
    ///
    /// With a cursor, the missed events for the task are sent as one
    /// `missed_events` batch. Buffered entries the batch already covers are
    /// dropped and the remaining ones are flushed before live delivery resumes.
    /// Buffered entries of the client's other tasks are flushed too, or dropped
    /// if the client is not subscribed to them (see `flush_client`).
    /// Returns `Ok(false)` when the client is not connected.
    pub async fn handle_subscribe(
        &self,
        client_id: &str,
        task_id: &str,
        last_event_id: Option<&str>,
    ) -> RelayResult<bool> {
        {
            let lock = self.task_lock(task_id);
            let _guard = lock.lock().await;

            let Some(transport) = self.connections.transport_for(client_id) else {
                warn!(client_id = %client_id, task_id = %task_id, "Subscribe from client that is not connected");
                return Ok(false);
            };
            self.connections.subscribe(client_id, task_id);

            if let Some(cursor) = last_event_id {
                self.reconcile(client_id, task_id, cursor, transport.as_ref())
                    .await?;
            }

            let pending = self.recovery.take_for_task(client_id, task_id);
            self.deliver_buffered(client_id, Some(transport.as_ref()), pending)
                .await;
        }

        self.flush_client(client_id, Some(task_id)).await;
        Ok(true)
    }

    async fn reconcile(
        &self,
        client_id: &str,
        task_id: &str,
        cursor: &str,
        transport: &dyn ClientTransport,
    ) -> RelayResult<()> {
        let parsed = EventId::parse_cursor(cursor);
        let events = self.event_log.get_task_events_since(task_id, parsed).await?;
        let data_unavailable = match (parsed, self.event_log.bounds().await?) {
            (Some(cursor), Some((oldest, _))) => cursor.sequence() + 1 < oldest.sequence(),
            _ => false,
        };
        let covered: HashSet<EventId> = events.iter().map(|event| event.id).collect();
        let count = events.len();

        let batch = ServerMessage::MissedEvents {
            task_id: task_id.to_string(),
            events: events.clone(),
            data_unavailable,
        };
        // Entries the batch replays must not be delivered a second time.
        self.recovery.discard_events(client_id, task_id, &covered);

        match transport.send(&batch).await {
            Ok(()) => {
                info!(
                    client_id = %client_id,
                    task_id = %task_id,
                    cursor = %cursor,
                    events = count,
                    data_unavailable = data_unavailable,
                    "🔄 Reconciled subscriber"
                );
            }
            Err(e) => {
                for event in &events {
                    self.buffer_failed_push(client_id, event, &e);
                }
            }
        }
        Ok(())
    }

    /// Flush buffered entries of the client's other tasks.
    ///
    /// Delivery checks the subscription at send time, so entries of a task the
    /// client is not subscribed to right now are dropped, not kept. After a
    /// reconnect the subscription set starts empty: subscribing to one task
    /// drops what is buffered for tasks not yet resubscribed, and those are
    /// recovered through a cursor on their own subscribe.
    async fn flush_client(&self, client_id: &str, skip_task: Option<&str>) {
        let mut tasks: Vec<String> = Vec::new();
        for entry in self.recovery.get_buffered_events_for_client(client_id) {
            let task_id = entry.task_id();
            if Some(task_id) != skip_task && !tasks.iter().any(|t| t == task_id) {
                tasks.push(task_id.to_string());
            }
        }

        for task_id in tasks {
            let lock = self.task_lock(&task_id);
            let _guard = lock.lock().await;
            let transport = self.connections.transport_for(client_id);
            let pending = self.recovery.take_for_task(client_id, &task_id);
            self.deliver_buffered(client_id, transport.as_deref(), pending)
                .await;
        }
    }

    /// Remove the subscription and drop anything still buffered for it
    pub async fn handle_unsubscribe(&self, client_id: &str, task_id: &str) -> bool {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        if !self.connections.unsubscribe(client_id, task_id) {
            return false;
        }
        self.recovery.discard_for_task(client_id, task_id);
        true
    }

    /// One retry-driver step: redeliver every due buffered run.
    ///
    /// Runs are claimed only once the task's lock is held, so a flush or
    /// reconciliation that got the lock first sees them unclaimed.
    pub async fn process_due_retries(&self) -> RetrySummary {
        let now = Instant::now();
        let mut summary = RetrySummary::default();
        for run in self.recovery.due_runs(now) {
            let lock = self.task_lock(&run.task_id);
            let _guard = lock.lock().await;
            let entries = self.recovery.claim_due(&run, now);
            if entries.is_empty() {
                continue;
            }
            let transport = self.connections.transport_for(&run.client_id);
            summary.merge(
                self.deliver_buffered(&run.client_id, transport.as_deref(), entries)
                    .await,
            );
        }
        summary
    }

    /// Deliver claimed entries in order; the first failure stops the run and
    /// hands the remaining entries back to the schedule behind it.
    async fn deliver_buffered(
        &self,
        client_id: &str,
        transport: Option<&dyn ClientTransport>,
        entries: Vec<BufferedEvent>,
    ) -> RetrySummary {
        let mut summary = RetrySummary::default();
        let mut pending = entries.into_iter();

        while let Some(entry) = pending.next() {
            if !self.connections.is_subscribed(client_id, entry.task_id()) {
                self.recovery.record_success(&entry.id);
                summary.discarded += 1;
                log_delivery_operation("retry", client_id, entry.task_id(), entry.event_id().sequence(), "unsubscribed");
                continue;
            }

            let message = match ServerMessage::from_event(&entry.event) {
                Ok(message) => message,
                Err(e) => {
                    log_error(
                        "EventBroadcaster",
                        "deliver_buffered",
                        &e.to_string(),
                        Some(&format!("client_id={client_id} event_id={}", entry.event_id())),
                    );
                    self.recovery.record_success(&entry.id);
                    summary.discarded += 1;
                    continue;
                }
            };

            let sent = match transport {
                Some(transport) => transport.send(&message).await,
                None => Err(TransportError::Closed),
            };

            match sent {
                Ok(()) => {
                    self.recovery.record_success(&entry.id);
                    summary.delivered += 1;
                    log_delivery_operation("retry", client_id, entry.task_id(), entry.event_id().sequence(), "delivered");
                }
                Err(e) => {
                    let not_before = match self.recovery.record_failure(&entry.id, &e.to_string()) {
                        Some(RetryOutcome::Rescheduled { next_retry_at, .. }) => {
                            summary.rescheduled += 1;
                            next_retry_at
                        }
                        Some(RetryOutcome::Exhausted { .. }) => {
                            summary.exhausted += 1;
                            Instant::now()
                        }
                        None => Instant::now(),
                    };
                    for rest in pending.by_ref() {
                        self.recovery.release(&rest.id, not_before);
                    }
                    break;
                }
            }
        }

        summary
    }

    /// Drive buffered redelivery until `shutdown` flips to `true` or its sender is dropped
    pub async fn run_retry_driver(
        self: Arc<Self>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(poll_interval_ms = poll_interval.as_millis() as u64, "🔁 Retry driver started");
        loop {
            let poll_at = Instant::now() + poll_interval;
            let wake_at = self
                .recovery
                .next_deadline()
                .map_or(poll_at, |deadline| deadline.min(poll_at));

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {
                    let summary = self.process_due_retries().await;
                    if !summary.is_empty() {
                        debug!(
                            delivered = summary.delivered,
                            rescheduled = summary.rescheduled,
                            exhausted = summary.exhausted,
                            discarded = summary.discarded,
                            "Retry pass complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🔁 Retry driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TaskStatus;
    use crate::messaging::transport::ChannelTransport;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn broadcaster() -> EventBroadcaster {
        EventBroadcaster::new(
            Arc::new(EventLog::in_memory(1000).await.unwrap()),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RecoveryBuffer::default()),
        )
    }

    fn connect(
        broadcaster: &EventBroadcaster,
        client_id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<ServerMessage> {
        let (transport, receiver) = ChannelTransport::new(capacity);
        assert!(broadcaster
            .connections()
            .register_connection(client_id, Arc::new(transport), Value::Null));
        receiver
    }

    fn progress(value: u8) -> ProgressData {
        ProgressData::new(value, TaskStatus::Processing, format!("{value}%"))
    }

    fn drain(receiver: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_emit_reaches_only_subscribers_of_the_task() {
        let broadcaster = broadcaster().await;
        let mut a = connect(&broadcaster, "a", 16);
        let mut b = connect(&broadcaster, "b", 16);
        broadcaster.handle_subscribe("a", "task-a", None).await.unwrap();
        broadcaster.handle_subscribe("b", "task-b", None).await.unwrap();

        let event = broadcaster.emit_progress("task-a", progress(10)).await.unwrap();
        broadcaster
            .emit_completed("task-a", CompletedData { result: json!({"text": "done"}) })
            .await
            .unwrap();

        let received = drain(&mut a);
        assert_eq!(received.len(), 2);
        assert!(matches!(
            &received[0],
            ServerMessage::ProgressEvent { event_id, progress: 10, .. } if *event_id == event.id
        ));
        assert!(matches!(&received[1], ServerMessage::CompletedEvent { .. }));
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_is_buffered_not_raised() {
        let broadcaster = broadcaster().await;
        let receiver = connect(&broadcaster, "c1", 16);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        drop(receiver);

        let event = broadcaster
            .emit_error(
                "task1",
                ErrorData {
                    message: "unreadable".to_string(),
                    code: "OCR_FAILED".to_string(),
                    recoverable: true,
                },
            )
            .await
            .unwrap();

        let buffered = broadcaster.recovery().get_buffered_events_for_client("c1");
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].event_id(), event.id);
        assert_eq!(buffered[0].event_type(), EventType::Error);
    }

    #[tokio::test]
    async fn test_live_events_queue_behind_pending_buffered_entry() {
        let broadcaster = broadcaster().await;
        let mut receiver = connect(&broadcaster, "c1", 1);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();

        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        // Channel is full now: the second push fails and is buffered.
        broadcaster.emit_progress("task1", progress(20)).await.unwrap();
        drain(&mut receiver);
        // Room again, but the third event must wait behind the second.
        broadcaster.emit_progress("task1", progress(30)).await.unwrap();

        assert!(drain(&mut receiver).is_empty());
        let ids: Vec<i64> = broadcaster
            .recovery()
            .get_buffered_events_for_client("c1")
            .iter()
            .map(|entry| entry.event_id().sequence())
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_reconcile_with_empty_cursor_replays_all_task_events() {
        let broadcaster = broadcaster().await;
        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.emit_progress("task2", progress(50)).await.unwrap();
        broadcaster.emit_progress("task1", progress(20)).await.unwrap();

        let mut receiver = connect(&broadcaster, "c1", 16);
        assert!(broadcaster.handle_subscribe("c1", "task1", Some("")).await.unwrap());

        match drain(&mut receiver).as_slice() {
            [ServerMessage::MissedEvents { task_id, events, data_unavailable }] => {
                assert_eq!(task_id, "task1");
                assert!(!data_unavailable);
                let ids: Vec<i64> = events.iter().map(|e| e.id.sequence()).collect();
                assert_eq!(ids, vec![1, 3]);
            }
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconcile_flags_evicted_history() {
        let broadcaster = EventBroadcaster::new(
            Arc::new(EventLog::in_memory(2).await.unwrap()),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RecoveryBuffer::default()),
        );
        for value in [10, 20, 30, 40] {
            broadcaster.emit_progress("task1", progress(value)).await.unwrap();
        }

        let mut receiver = connect(&broadcaster, "c1", 16);
        broadcaster.handle_subscribe("c1", "task1", Some("1")).await.unwrap();
        match drain(&mut receiver).as_slice() {
            [ServerMessage::MissedEvents { events, data_unavailable, .. }] => {
                assert!(*data_unavailable);
                assert_eq!(events.len(), 2);
            }
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_requires_connected_client() {
        let broadcaster = broadcaster().await;
        assert!(!broadcaster.handle_subscribe("ghost", "task1", None).await.unwrap());

        let _receiver = connect(&broadcaster, "c1", 4);
        broadcaster.connections().handle_disconnection("c1", "transport_closed");
        assert!(!broadcaster.handle_subscribe("c1", "task1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_drops_buffered() {
        let broadcaster = broadcaster().await;
        let mut receiver = connect(&broadcaster, "c1", 1);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.emit_progress("task1", progress(20)).await.unwrap();
        assert!(broadcaster.recovery().has_pending("c1", "task1"));

        assert!(broadcaster.handle_unsubscribe("c1", "task1").await);
        assert!(!broadcaster.recovery().has_pending("c1", "task1"));
        drain(&mut receiver);

        broadcaster.emit_progress("task1", progress(30)).await.unwrap();
        assert!(drain(&mut receiver).is_empty());
        assert!(!broadcaster.handle_unsubscribe("ghost", "task1").await);
    }

    #[tokio::test]
    async fn test_due_retries_redeliver_in_order() {
        let broadcaster = broadcaster().await;
        let mut receiver = connect(&broadcaster, "c1", 1);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.emit_progress("task1", progress(20)).await.unwrap();
        broadcaster.emit_progress("task1", progress(30)).await.unwrap();
        drain(&mut receiver);

        // The log is not touched from here on, so the clock can be frozen.
        tokio::time::pause();

        tokio::time::advance(Duration::from_secs(1)).await;
        let summary = broadcaster.process_due_retries().await;
        // Capacity 1: the first redelivery fits, the second fails and backs off.
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.rescheduled, 1);
        let first = drain(&mut receiver);
        assert!(matches!(first.as_slice(), [ServerMessage::ProgressEvent { progress: 20, .. }]));

        tokio::time::advance(Duration::from_secs(2)).await;
        let summary = broadcaster.process_due_retries().await;
        assert_eq!(summary.delivered, 1);
        let second = drain(&mut receiver);
        assert!(matches!(second.as_slice(), [ServerMessage::ProgressEvent { progress: 30, .. }]));
        assert!(broadcaster.recovery().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_during_retry_pass_keeps_task_order() {
        let broadcaster = broadcaster().await;
        let mut receiver = connect(&broadcaster, "c1", 1);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.emit_progress("task1", progress(20)).await.unwrap();

        // The retry driver has seen the run but not yet taken the task lock.
        let later = Instant::now() + Duration::from_secs(2);
        let runs = broadcaster.recovery().due_runs(later);
        assert_eq!(runs.len(), 1);

        broadcaster.emit_progress("task1", progress(30)).await.unwrap();
        drain(&mut receiver);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();

        // 20 goes out first; 30 no longer fits and is buffered again on its own.
        let flushed = drain(&mut receiver);
        assert!(matches!(flushed.as_slice(), [ServerMessage::ProgressEvent { progress: 20, .. }]));
        let pending: Vec<i64> = broadcaster
            .recovery()
            .get_buffered_events_for_client("c1")
            .iter()
            .map(|entry| entry.event_id().sequence())
            .collect();
        assert_eq!(pending, vec![3]);
        assert_eq!(broadcaster.recovery().stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_reconcile_drops_claimed_entries_it_covers() {
        let broadcaster = broadcaster().await;
        let mut receiver = connect(&broadcaster, "c1", 1);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        let first = broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.emit_progress("task1", progress(20)).await.unwrap();
        let runs = broadcaster
            .recovery()
            .due_runs(Instant::now() + Duration::from_secs(2));
        assert_eq!(runs.len(), 1);
        drain(&mut receiver);

        let cursor = first.id.to_string();
        broadcaster
            .handle_subscribe("c1", "task1", Some(&cursor))
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut receiver).as_slice(),
            [ServerMessage::MissedEvents { events, .. }] if events.len() == 1
        ));
        assert!(broadcaster.recovery().is_empty());

        // The pending retry pass finds nothing left to resend.
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(broadcaster.process_due_retries().await.is_empty());
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_after_reconnect_drops_entries_of_unsubscribed_tasks() {
        let broadcaster = broadcaster().await;
        let _first = connect(&broadcaster, "c1", 1);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        broadcaster.handle_subscribe("c1", "task2", None).await.unwrap();
        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.emit_progress("task2", progress(10)).await.unwrap();
        assert!(broadcaster.recovery().has_pending("c1", "task2"));

        broadcaster.connections().handle_disconnection("c1", "transport_closed");
        let mut receiver = connect(&broadcaster, "c1", 16);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();

        assert!(drain(&mut receiver).is_empty());
        assert!(!broadcaster.recovery().has_pending("c1", "task2"));
    }

    #[tokio::test]
    async fn test_retries_for_disconnected_client_exhaust() {
        let broadcaster = broadcaster().await;
        let receiver = connect(&broadcaster, "c1", 4);
        broadcaster.handle_subscribe("c1", "task1", None).await.unwrap();
        drop(receiver);
        broadcaster.emit_progress("task1", progress(10)).await.unwrap();
        broadcaster.connections().handle_disconnection("c1", "transport_closed");
        tokio::time::pause();

        let mut exhausted = 0;
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(16)).await;
            exhausted += broadcaster.process_due_retries().await.exhausted;
        }
        assert_eq!(exhausted, 1);
        assert!(broadcaster.recovery().is_empty());
    }
}
