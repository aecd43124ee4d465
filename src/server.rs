//! # Progress Server
//!
//! Owns one instance of every component (event log, registries, recovery
//! buffer, broadcaster) and the background workers that drive them. There is
//! no process-wide state: two servers in one process are fully independent.
//!
//! ## Lifecycle
//!
//! ```text
//! new(config) -> start() -> ... -> shutdown()
//!                  │                  │
//!                  ├─ retry driver    ├─ signal workers, join them
//!                  └─ task sweeper    └─ disconnect clients, close the log
//! ```

use crate::config::{RelayConfig, TaskConfig};
use crate::constants::{disconnect_reasons, error_codes};
use crate::error::RelayResult;
use crate::events::{Event, EventBroadcaster, EventLog};
use crate::logging::log_error;
use crate::messaging::{
    ChannelTransport, ClientMessage, ClientTransport, CompletedData, ErrorData, ProgressData,
    ServerMessage,
};
use crate::registry::{ConnectionRegistry, Task, TaskOptions, TaskRegistry, TaskUpdate};
use crate::resilience::RecoveryBuffer;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one sweeper pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub expired_tasks: Vec<String>,
    pub purged_tasks: usize,
    pub removed_connections: Vec<String>,
    pub pruned_locks: usize,
}

pub struct ProgressServer {
    config: RelayConfig,
    tasks: Arc<TaskRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProgressServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressServer")
            .field("config", &self.config)
            .field("tasks", &self.tasks.len())
            .field("broadcaster", &self.broadcaster)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl ProgressServer {
    /// Validate the configuration, open the event log and build all components
    pub async fn new(config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;

        let event_log = Arc::new(EventLog::open(&config.event_log).await?);
        let connections = Arc::new(ConnectionRegistry::new());
        let recovery = Arc::new(RecoveryBuffer::new(&config.retry));
        let broadcaster = Arc::new(EventBroadcaster::new(event_log, connections, recovery));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            database_url = %config.event_log.database_url,
            max_events = config.event_log.max_events,
            max_retry_attempts = config.retry.max_attempts,
            "🚀 Progress server initialized"
        );

        Ok(Self {
            config,
            tasks: Arc::new(TaskRegistry::new()),
            broadcaster,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the retry driver and the task sweeper. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Progress server already started");
            return;
        }

        workers.push(tokio::spawn(Arc::clone(&self.broadcaster).run_retry_driver(
            self.config.retry.poll_interval(),
            self.shutdown_tx.subscribe(),
        )));
        workers.push(tokio::spawn(run_task_sweeper(
            Arc::clone(&self.tasks),
            Arc::clone(&self.broadcaster),
            self.config.tasks.clone(),
            self.shutdown_tx.subscribe(),
        )));

        info!(workers = workers.len(), "✅ Progress server started");
    }

    /// Stop the workers, disconnect every client and close the event log
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                log_error("ProgressServer", "shutdown", &e.to_string(), None);
            }
        }

        for connection in self.connections().active_connections() {
            self.connections()
                .handle_disconnection(&connection.client_id, disconnect_reasons::SERVER_TERMINATED);
        }
        self.event_log().close().await;
        info!("🛑 Progress server shut down");
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        self.broadcaster.event_log()
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        self.broadcaster.connections()
    }

    pub fn recovery(&self) -> &Arc<RecoveryBuffer> {
        self.broadcaster.recovery()
    }

    // Client surface

    pub fn connect(
        &self,
        client_id: &str,
        transport: Arc<dyn ClientTransport>,
        metadata: Value,
    ) -> bool {
        self.connections()
            .register_connection(client_id, transport, metadata)
    }

    /// Connect over an in-process channel sized by `transport.channel_capacity`
    pub fn connect_channel(
        &self,
        client_id: &str,
        metadata: Value,
    ) -> Option<mpsc::Receiver<ServerMessage>> {
        let (transport, receiver) = ChannelTransport::new(self.config.transport.channel_capacity);
        self.connect(client_id, Arc::new(transport), metadata)
            .then_some(receiver)
    }

    /// Mark the client disconnected. A deliberate `client_terminated` also
    /// drops its buffered events; any other reason keeps them for retry.
    pub fn disconnect(&self, client_id: &str, reason: &str) -> bool {
        if !self.connections().handle_disconnection(client_id, reason) {
            return false;
        }
        if reason == disconnect_reasons::CLIENT_TERMINATED {
            let dropped = self.recovery().cleanup_client(client_id);
            debug!(client_id = %client_id, dropped = dropped, "Dropped buffered events of terminated client");
        }
        true
    }

    /// Dispatch one client request.
    ///
    /// A reconciliation that cannot read the log is reported to the client as a
    /// `FETCH_EVENTS_ERROR` message and returned to the caller.
    pub async fn handle_client_message(
        &self,
        client_id: &str,
        message: ClientMessage,
    ) -> RelayResult<bool> {
        self.connections().update_activity(client_id);
        match message {
            ClientMessage::Subscribe {
                task_id,
                last_event_id,
            } => {
                match self
                    .broadcaster
                    .handle_subscribe(client_id, &task_id, last_event_id.as_deref())
                    .await
                {
                    Ok(subscribed) => Ok(subscribed),
                    Err(e) => {
                        log_error(
                            "ProgressServer",
                            "handle_subscribe",
                            &e.to_string(),
                            Some(&format!("client_id={client_id} task_id={task_id}")),
                        );
                        if let Some(transport) = self.connections().transport_for(client_id) {
                            let notice = ServerMessage::Error {
                                message: "Failed to fetch missed events".to_string(),
                                code: error_codes::FETCH_EVENTS_ERROR.to_string(),
                            };
                            if let Err(send_error) = transport.send(&notice).await {
                                warn!(client_id = %client_id, error = %send_error, "Could not report reconciliation failure");
                            }
                        }
                        Err(e)
                    }
                }
            }
            ClientMessage::Unsubscribe { task_id } => Ok(self
                .broadcaster
                .handle_unsubscribe(client_id, &task_id)
                .await),
        }
    }

    // Producer surface

    pub fn initialize_task(&self, options: TaskOptions) -> String {
        self.tasks.initialize_task(options)
    }

    pub fn update_task_progress(&self, task_id: &str, update: TaskUpdate) -> bool {
        self.tasks.update_task_progress(task_id, update)
    }

    pub fn task_status(&self, task_id: &str) -> Option<Task> {
        self.tasks.get_task_status(task_id)
    }

    pub async fn emit_progress(&self, task_id: &str, data: ProgressData) -> RelayResult<Event> {
        self.broadcaster.emit_progress(task_id, data).await
    }

    pub async fn emit_completed(&self, task_id: &str, data: CompletedData) -> RelayResult<Event> {
        self.broadcaster.emit_completed(task_id, data).await
    }

    pub async fn emit_error(&self, task_id: &str, data: ErrorData) -> RelayResult<Event> {
        self.broadcaster.emit_error(task_id, data).await
    }

    /// Apply a progress update and broadcast the task's new state.
    /// `Ok(false)` for an unknown task; nothing is emitted then.
    pub async fn report_progress(&self, task_id: &str, update: TaskUpdate) -> RelayResult<bool> {
        let message = update.message.clone();
        if !self.tasks.update_task_progress(task_id, update) {
            return Ok(false);
        }
        let Some(task) = self.tasks.get_task_status(task_id) else {
            return Ok(false);
        };
        self.broadcaster
            .emit_progress(
                task_id,
                ProgressData {
                    progress: task.progress,
                    status: task.status,
                    message,
                },
            )
            .await?;
        Ok(true)
    }

    /// Mark the task completed and broadcast its result
    pub async fn complete_task(&self, task_id: &str, result: Value) -> RelayResult<bool> {
        if !self.tasks.complete_task(task_id, result.clone()) {
            return Ok(false);
        }
        self.broadcaster
            .emit_completed(task_id, CompletedData { result })
            .await?;
        Ok(true)
    }

    /// Mark the task failed and broadcast the error; an empty code becomes `UNKNOWN_ERROR`
    pub async fn fail_task(
        &self,
        task_id: &str,
        message: &str,
        code: &str,
        recoverable: bool,
    ) -> RelayResult<bool> {
        let code = if code.is_empty() {
            error_codes::UNKNOWN_ERROR
        } else {
            code
        };
        if !self.tasks.fail_task(task_id, message, code) {
            return Ok(false);
        }
        self.broadcaster
            .emit_error(
                task_id,
                ErrorData {
                    message: message.to_string(),
                    code: code.to_string(),
                    recoverable,
                },
            )
            .await?;
        Ok(true)
    }

    /// Run one sweeper pass now
    pub async fn sweep(&self) -> SweepSummary {
        sweep_once(&self.tasks, &self.broadcaster, &self.config.tasks).await
    }
}

async fn sweep_once(
    tasks: &TaskRegistry,
    broadcaster: &EventBroadcaster,
    config: &TaskConfig,
) -> SweepSummary {
    let expired_tasks = tasks.expire_stale(config.timeout());
    for task_id in &expired_tasks {
        let message = tasks
            .get_task_status(task_id)
            .and_then(|task| task.errors.last().map(|e| e.message.clone()))
            .unwrap_or_default();
        let data = ErrorData {
            message,
            code: error_codes::TASK_TIMEOUT.to_string(),
            recoverable: false,
        };
        if let Err(e) = broadcaster.emit_error(task_id, data).await {
            log_error(
                "ProgressServer",
                "sweep",
                &e.to_string(),
                Some(&format!("task_id={task_id}")),
            );
        }
    }

    let purged_tasks = tasks.purge_finished(config.retention());
    let removed_connections = broadcaster.connections().cleanup_inactive(config.retention());
    for client_id in &removed_connections {
        broadcaster.recovery().cleanup_client(client_id);
    }
    let pruned_locks = broadcaster.prune_task_locks();

    SweepSummary {
        expired_tasks,
        purged_tasks,
        removed_connections,
        pruned_locks,
    }
}

async fn run_task_sweeper(
    tasks: Arc<TaskRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    config: TaskConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = sweep_once(&tasks, &broadcaster, &config).await;
                if summary != SweepSummary::default() {
                    debug!(
                        expired = summary.expired_tasks.len(),
                        purged = summary.purged_tasks,
                        removed_connections = summary.removed_connections.len(),
                        pruned_locks = summary.pruned_locks,
                        "Sweep complete"
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
    info!("🧹 Task sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventLogConfig;
    use crate::constants::TaskStatus;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> RelayConfig {
        RelayConfig {
            event_log: EventLogConfig::in_memory(),
            ..RelayConfig::default()
        }
    }

    fn drain(receiver: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_report_progress_updates_and_broadcasts() {
        let server = ProgressServer::new(test_config()).await.unwrap();
        let task_id = server.initialize_task(TaskOptions::new().with_filename("card.jpg"));
        let mut receiver = server.connect_channel("c1", Value::Null).unwrap();
        assert!(server
            .handle_client_message(
                "c1",
                ClientMessage::Subscribe {
                    task_id: task_id.clone(),
                    last_event_id: None
                }
            )
            .await
            .unwrap());

        let update = TaskUpdate::new(50, TaskStatus::Processing, "Processing image...");
        assert!(server.report_progress(&task_id, update).await.unwrap());
        assert!(!server
            .report_progress("missing", TaskUpdate::default())
            .await
            .unwrap());

        let task = server.task_status(&task_id).unwrap();
        assert_eq!(task.progress, 50);
        assert_eq!(task.steps.len(), 1);
        assert!(matches!(
            drain(&mut receiver).as_slice(),
            [ServerMessage::ProgressEvent { progress: 50, status: TaskStatus::Processing, message: Some(m), .. }]
                if m == "Processing image..."
        ));
    }

    #[tokio::test]
    async fn test_complete_and_fail_emit_terminal_events() {
        let server = ProgressServer::new(test_config()).await.unwrap();
        let done = server.initialize_task(TaskOptions::new());
        let broken = server.initialize_task(TaskOptions::new());

        assert!(server.complete_task(&done, json!({"text": "A+"})).await.unwrap());
        assert!(server.fail_task(&broken, "unreadable", "", true).await.unwrap());
        assert!(!server.complete_task("missing", Value::Null).await.unwrap());

        let events = server.event_log().get_events_since(None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data["code"], error_codes::UNKNOWN_ERROR);
        assert_eq!(server.task_status(&broken).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_client_terminated_drops_buffered_events() {
        let server = ProgressServer::new(test_config()).await.unwrap();
        let receiver = server.connect_channel("c1", Value::Null).unwrap();
        server
            .broadcaster()
            .handle_subscribe("c1", "task1", None)
            .await
            .unwrap();
        drop(receiver);
        server
            .emit_progress("task1", ProgressData::new(10, TaskStatus::Processing, "10%"))
            .await
            .unwrap();
        assert!(server.recovery().has_pending("c1", "task1"));

        assert!(server.disconnect("c1", disconnect_reasons::CLIENT_TERMINATED));
        assert!(server.recovery().is_empty());
        assert!(!server.disconnect("ghost", disconnect_reasons::TRANSPORT_CLOSED));
    }

    #[tokio::test]
    async fn test_sweep_times_out_stale_tasks() {
        let mut config = test_config();
        config.tasks.timeout_secs = 0;
        let server = ProgressServer::new(config).await.unwrap();
        let task_id = server.initialize_task(TaskOptions::new());
        let mut receiver = server.connect_channel("c1", Value::Null).unwrap();
        server
            .broadcaster()
            .handle_subscribe("c1", &task_id, None)
            .await
            .unwrap();

        let summary = server.sweep().await;
        assert_eq!(summary.expired_tasks, vec![task_id.clone()]);
        assert!(matches!(
            drain(&mut receiver).as_slice(),
            [ServerMessage::ErrorEvent { code, recoverable: false, .. }] if code == error_codes::TASK_TIMEOUT
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let server = ProgressServer::new(test_config()).await.unwrap();
        let _receiver = server.connect_channel("c1", Value::Null).unwrap();
        server.start();
        server.start();

        tokio::time::timeout(Duration::from_secs(5), server.shutdown())
            .await
            .unwrap();
        assert!(server.event_log().is_closed());
        assert_eq!(
            server.connections().connection("c1").unwrap().disconnect_reason.as_deref(),
            Some(disconnect_reasons::SERVER_TERMINATED)
        );
        assert!(server
            .emit_progress("task1", ProgressData::new(1, TaskStatus::Processing, "x"))
            .await
            .is_err());
    }
}
