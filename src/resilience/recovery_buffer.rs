//! # Recovery Buffer
//!
//! Per-client queues of events whose live push failed, retried with
//! exponential backoff until delivered or exhausted.
//!
//! Entries for one (client, task) pair are handed out head-first: a due entry
//! that sits behind an earlier entry of the same task waits for it, so retries
//! never reorder a task's events. The buffer owns its queues exclusively and
//! never touches connection or task state; the broadcaster decides what a
//! delivery attempt means.

use crate::config::RetryConfig;
use crate::error::RelayError;
use crate::events::types::{Event, EventId, EventType};
use crate::resilience::backoff::BackoffPolicy;
use crate::resilience::delay_queue::DelayQueue;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    pub id: Uuid,
    pub client_id: String,
    pub event: Event,
    /// Failed redelivery attempts so far
    pub attempts: u32,
    pub next_retry_at: Instant,
    pub buffered_at: DateTime<Utc>,
    pub last_error: Option<String>,
    in_flight: bool,
}

impl BufferedEvent {
    pub fn event_type(&self) -> EventType {
        self.event.event_type
    }

    pub fn data(&self) -> &Value {
        &self.event.data
    }

    pub fn task_id(&self) -> &str {
        &self.event.task_id
    }

    pub fn event_id(&self) -> EventId {
        self.event.id
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// A (client, task) pair whose head entry is due for redelivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DueRun {
    pub client_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled { attempts: u32, next_retry_at: Instant },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub clients: usize,
    pub buffered: usize,
    pub in_flight: usize,
    pub scheduled: usize,
}

#[derive(Debug, Default)]
struct BufferState {
    clients: HashMap<String, VecDeque<BufferedEvent>>,
    schedule: DelayQueue<Uuid>,
    /// Owning client of every live entry
    owners: HashMap<Uuid, String>,
}

impl BufferState {
    /// Oldest entry of one (client, task) pair
    fn head_of(&self, client_id: &str, task_id: &str) -> Option<&BufferedEvent> {
        self.clients
            .get(client_id)?
            .iter()
            .find(|entry| entry.task_id() == task_id)
    }

    fn entry_mut(&mut self, id: &Uuid) -> Option<&mut BufferedEvent> {
        let client_id = self.owners.get(id)?;
        self.clients
            .get_mut(client_id)?
            .iter_mut()
            .find(|entry| entry.id == *id)
    }

    fn remove_entry(&mut self, id: &Uuid) -> Option<BufferedEvent> {
        let client_id = self.owners.remove(id)?;
        self.schedule.cancel(id);
        let queue = self.clients.get_mut(&client_id)?;
        let position = queue.iter().position(|entry| entry.id == *id)?;
        let removed = queue.remove(position);
        if queue.is_empty() {
            self.clients.remove(&client_id);
        }
        removed
    }

    fn remove_where<F>(&mut self, client_id: &str, mut predicate: F) -> usize
    where
        F: FnMut(&BufferedEvent) -> bool,
    {
        let Some(queue) = self.clients.get_mut(client_id) else {
            return 0;
        };
        let before = queue.len();
        let mut dropped = Vec::new();
        queue.retain(|entry| {
            let drop_it = predicate(entry);
            if drop_it {
                dropped.push(entry.id);
            }
            !drop_it
        });
        let removed = before - queue.len();
        if queue.is_empty() {
            self.clients.remove(client_id);
        }
        for id in dropped {
            self.schedule.cancel(&id);
            self.owners.remove(&id);
        }
        removed
    }
}

pub struct RecoveryBuffer {
    policy: BackoffPolicy,
    max_per_client: usize,
    state: Mutex<BufferState>,
}

impl std::fmt::Debug for RecoveryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryBuffer")
            .field("policy", &self.policy)
            .field("max_per_client", &self.max_per_client)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for RecoveryBuffer {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RecoveryBuffer {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            policy: BackoffPolicy::from(config),
            max_per_client: config.max_buffered_per_client.max(1),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Queue an event for redelivery to `client_id`; first retry after `backoff(0)`
    pub fn buffer_event(&self, client_id: &str, event: Event) -> Uuid {
        let id = Uuid::new_v4();
        let next_retry_at = Instant::now() + self.policy.delay_for(0);
        let entry = BufferedEvent {
            id,
            client_id: client_id.to_string(),
            event,
            attempts: 0,
            next_retry_at,
            buffered_at: Utc::now(),
            last_error: None,
            in_flight: false,
        };

        let mut state = self.state.lock();
        debug!(
            client_id = %client_id,
            task_id = %entry.task_id(),
            event_id = entry.event_id().sequence(),
            "Buffering event for retry"
        );
        state
            .clients
            .entry(client_id.to_string())
            .or_default()
            .push_back(entry);
        state.owners.insert(id, client_id.to_string());
        state.schedule.schedule(id, next_retry_at);

        let overflow = state
            .clients
            .get(client_id)
            .map_or(0, |queue| queue.len().saturating_sub(self.max_per_client));
        if overflow > 0 {
            let oldest: Vec<Uuid> = state
                .clients
                .get(client_id)
                .map(|queue| {
                    queue
                        .iter()
                        .filter(|entry| !entry.in_flight)
                        .take(overflow)
                        .map(|entry| entry.id)
                        .collect()
                })
                .unwrap_or_default();
            for dropped in &oldest {
                state.remove_entry(dropped);
            }
            warn!(
                client_id = %client_id,
                dropped = oldest.len(),
                cap = self.max_per_client,
                "Recovery buffer full; dropped oldest buffered events"
            );
        }

        id
    }

    /// Buffered entries for a client in insertion order
    pub fn get_buffered_events_for_client(&self, client_id: &str) -> Vec<BufferedEvent> {
        self.state
            .lock()
            .clients
            .get(client_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self, client_id: &str, task_id: &str) -> bool {
        self.state
            .lock()
            .clients
            .get(client_id)
            .is_some_and(|queue| queue.iter().any(|entry| entry.task_id() == task_id))
    }

    /// Every (client, task) pair whose head entry is due at `now`.
    ///
    /// Nothing is claimed here: the caller takes the task's delivery lock and
    /// then calls [`claim_due`](Self::claim_due). Due entries stuck behind a
    /// head that is not due yet are pushed back to the head's deadline.
    pub fn due_runs(&self, now: Instant) -> Vec<DueRun> {
        let mut state = self.state.lock();
        let mut runs = Vec::new();
        let mut seen: HashSet<DueRun> = HashSet::new();

        for id in state.schedule.due(now) {
            let Some(client_id) = state.owners.get(&id).cloned() else {
                state.schedule.cancel(&id);
                continue;
            };
            let Some(task_id) = state
                .clients
                .get(&client_id)
                .and_then(|queue| queue.iter().find(|entry| entry.id == id))
                .map(|entry| entry.task_id().to_string())
            else {
                continue;
            };
            let run = DueRun { client_id, task_id };
            if seen.contains(&run) {
                continue;
            }

            let head = state
                .head_of(&run.client_id, &run.task_id)
                .map(|entry| (entry.id, entry.in_flight, entry.next_retry_at));
            match head {
                Some((head_id, false, head_at)) if head_id == id || head_at <= now => {
                    seen.insert(run.clone());
                    runs.push(run);
                }
                Some((_, in_flight, head_at)) => {
                    let retry_at = if in_flight {
                        now + self.policy.delay_for(0)
                    } else {
                        head_at
                    };
                    state.schedule.schedule(id, retry_at);
                }
                None => {}
            }
        }

        runs
    }

    /// Claim the whole run of a due pair, head first.
    ///
    /// Returns nothing if the head is no longer due, e.g. because a flush
    /// delivered it after [`due_runs`](Self::due_runs) reported the pair.
    pub fn claim_due(&self, run: &DueRun, now: Instant) -> Vec<BufferedEvent> {
        let mut state = self.state.lock();
        let head_due = state
            .head_of(&run.client_id, &run.task_id)
            .is_some_and(|head| head.next_retry_at <= now);
        if !head_due {
            return Vec::new();
        }
        Self::claim_run(&mut state, &run.client_id, &run.task_id)
    }

    /// Claim all entries of one (client, task) pair, e.g. to flush on resubscribe
    pub fn take_for_task(&self, client_id: &str, task_id: &str) -> Vec<BufferedEvent> {
        let mut state = self.state.lock();
        Self::claim_run(&mut state, client_id, task_id)
    }

    /// Nothing is claimed while any entry of the pair is still in flight, so a
    /// later entry can never overtake an earlier one.
    fn claim_run(state: &mut BufferState, client_id: &str, task_id: &str) -> Vec<BufferedEvent> {
        let Some(queue) = state.clients.get_mut(client_id) else {
            return Vec::new();
        };
        if queue
            .iter()
            .any(|entry| entry.task_id() == task_id && entry.in_flight)
        {
            return Vec::new();
        }
        let mut run = Vec::new();
        for entry in queue.iter_mut().filter(|entry| entry.task_id() == task_id) {
            entry.in_flight = true;
            run.push(entry.clone());
        }
        for entry in &run {
            state.schedule.cancel(&entry.id);
        }
        run
    }

    /// Delivered: forget the entry
    pub fn record_success(&self, id: &Uuid) -> bool {
        let removed = self.state.lock().remove_entry(id);
        if let Some(entry) = &removed {
            debug!(
                client_id = %entry.client_id,
                task_id = %entry.task_id(),
                event_id = entry.event_id().sequence(),
                attempts = entry.attempts,
                "Buffered event redelivered"
            );
        }
        removed.is_some()
    }

    /// Delivery failed: back off, or drop the entry once attempts are exhausted
    pub fn record_failure(&self, id: &Uuid, reason: &str) -> Option<RetryOutcome> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(id)?;
        entry.attempts += 1;
        entry.last_error = Some(reason.to_string());
        let attempts = entry.attempts;

        if self.policy.is_exhausted(attempts) {
            let removed = state.remove_entry(id)?;
            let exhausted = RelayError::RetryExhaustedError {
                event_id: removed.event_id().sequence(),
                client_id: removed.client_id.clone(),
                attempts,
            };
            error!(
                client_id = %removed.client_id,
                task_id = %removed.task_id(),
                event_id = removed.event_id().sequence(),
                attempts,
                error = %exhausted,
                "Dropping buffered event; client must reconcile"
            );
            return Some(RetryOutcome::Exhausted { attempts });
        }

        let next_retry_at = Instant::now() + self.policy.delay_for(attempts);
        entry.next_retry_at = next_retry_at;
        entry.in_flight = false;
        state.schedule.schedule(*id, next_retry_at);
        debug!(attempts, reason = %reason, "Rescheduled buffered event");
        Some(RetryOutcome::Rescheduled {
            attempts,
            next_retry_at,
        })
    }

    /// Return a claimed but unattempted entry to the schedule, no earlier than `not_before`
    pub fn release(&self, id: &Uuid, not_before: Instant) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entry_mut(id) else {
            return false;
        };
        entry.in_flight = false;
        entry.next_retry_at = entry.next_retry_at.max(not_before);
        let at = entry.next_retry_at;
        state.schedule.schedule(*id, at);
        true
    }

    /// Drop everything buffered for one (client, task) pair
    pub fn discard_for_task(&self, client_id: &str, task_id: &str) -> usize {
        let removed = self
            .state
            .lock()
            .remove_where(client_id, |entry| entry.task_id() == task_id);
        if removed > 0 {
            debug!(client_id = %client_id, task_id = %task_id, removed, "Discarded buffered events");
        }
        removed
    }

    /// Drop entries whose events were already delivered by other means, claimed or not
    pub fn discard_events(&self, client_id: &str, task_id: &str, delivered: &HashSet<EventId>) -> usize {
        if delivered.is_empty() {
            return 0;
        }
        self.state.lock().remove_where(client_id, |entry| {
            entry.task_id() == task_id && delivered.contains(&entry.event_id())
        })
    }

    /// Drop everything buffered for a client that is gone for good
    pub fn cleanup_client(&self, client_id: &str) -> usize {
        let removed = self.state.lock().remove_where(client_id, |_| true);
        if removed > 0 {
            debug!(client_id = %client_id, removed, "Cleared recovery buffer for client");
        }
        removed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().schedule.next_deadline()
    }

    pub fn len(&self) -> usize {
        self.state.lock().owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RecoveryStats {
        let state = self.state.lock();
        RecoveryStats {
            clients: state.clients.len(),
            buffered: state.owners.len(),
            in_flight: state
                .clients
                .values()
                .flat_map(|queue| queue.iter())
                .filter(|entry| entry.in_flight)
                .count(),
            scheduled: state.schedule.len(),
        }
    }
}
