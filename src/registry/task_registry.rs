//! # Task Registry
//!
//! In-memory record of every OCR task the relay is reporting on: current
//! status and progress, an append-only step history, and recorded errors.
//!
//! Each task lives in its own `DashMap` entry, so updates to one task are
//! serialized by the entry lock without blocking unrelated tasks. Status
//! transitions and progress monotonicity are caller-asserted and not
//! validated.

use crate::constants::{error_codes, TaskStatus};
use crate::logging::log_task_operation;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Caller-supplied metadata attached to a task at creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Anything else the producer wants to carry along
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patient_id(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub timestamp: DateTime<Utc>,
    pub progress: u8,
    pub status: TaskStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub steps: Vec<TaskStep>,
    pub errors: Vec<TaskErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: TaskOptions,
    /// Shallow-merged `data` from progress updates
    pub data: Map<String, Value>,
    pub result: Option<Value>,
}

impl Task {
    fn new(id: String, metadata: TaskOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Initialized,
            progress: 0,
            steps: Vec::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata,
            data: Map::new(),
            result: None,
        }
    }

    /// Wall time from creation to completion, for finished tasks
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    fn push_step(&mut self, message: Option<String>) {
        let now = Utc::now();
        self.steps.push(TaskStep {
            timestamp: now,
            progress: self.progress,
            status: self.status,
            message,
        });
        self.updated_at = now;
    }
}

/// Fields a producer may change in one progress update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub progress: Option<u8>,
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl TaskUpdate {
    pub fn new(progress: u8, status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            status: Some(status),
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// `now - age`, or `None` when the age is too large to represent
fn cutoff_for(age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new task and return its generated id
    pub fn initialize_task(&self, options: TaskOptions) -> String {
        let task_id = Uuid::new_v4().to_string();
        let details = serde_json::to_string(&options).ok();
        self.tasks
            .insert(task_id.clone(), Task::new(task_id.clone(), options));

        log_task_operation(
            "initialize_task",
            &task_id,
            TaskStatus::Initialized.as_str(),
            details.as_deref(),
        );
        task_id
    }

    /// Merge an update into a task and append one step; `false` for unknown ids
    pub fn update_task_progress(&self, task_id: &str, update: TaskUpdate) -> bool {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Attempted to update unknown task");
            return false;
        };

        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(progress) = update.progress {
            task.progress = progress.min(100);
        }
        match update.data {
            Some(Value::Object(fields)) => task.data.extend(fields),
            Some(other) => {
                task.data.insert("value".to_string(), other);
            }
            None => {}
        }
        task.push_step(update.message);

        debug!(
            task_id = %task_id,
            status = %task.status,
            progress = task.progress,
            steps = task.steps.len(),
            "Task progress updated"
        );
        true
    }

    /// Mark a task completed with its result
    pub fn complete_task(&self, task_id: &str, result: Value) -> bool {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Attempted to complete unknown task");
            return false;
        };

        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        task.push_step(Some("OCR processing completed successfully".to_string()));

        let processing_ms = task.processing_time().map(|d| d.num_milliseconds());
        drop(task);
        log_task_operation(
            "complete_task",
            task_id,
            TaskStatus::Completed.as_str(),
            processing_ms.map(|ms| format!("processing_ms={ms}")).as_deref(),
        );
        true
    }

    /// Mark a task failed and record the error
    pub fn fail_task(&self, task_id: &str, message: &str, code: &str) -> bool {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Attempted to fail unknown task");
            return false;
        };

        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.errors.push(TaskErrorRecord {
            timestamp: now,
            message: message.to_string(),
            code: code.to_string(),
        });
        task.push_step(Some(format!("OCR processing failed: {message}")));
        drop(task);

        log_task_operation(
            "fail_task",
            task_id,
            TaskStatus::Failed.as_str(),
            Some(&format!("{code}: {message}")),
        );
        true
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|task| task.value().clone())
    }

    /// Tasks that have not reached a terminal status, oldest first
    pub fn active_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Fail every active task with no update for `timeout`; returns their ids
    pub fn expire_stale(&self, timeout: Duration) -> Vec<String> {
        let Some(cutoff) = cutoff_for(timeout) else {
            return Vec::new();
        };
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| !entry.status.is_terminal() && entry.updated_at <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|task_id| {
                warn!(task_id = %task_id, "OCR task timed out");
                self.fail_task(task_id, "OCR processing timed out", error_codes::TASK_TIMEOUT)
            })
            .collect()
    }

    /// Drop finished tasks whose completion is older than `retention`
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = cutoff_for(retention) else {
            return 0;
        };
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.is_some_and(|done| done <= cutoff))
        });
        let purged = before.saturating_sub(self.tasks.len());
        if purged > 0 {
            debug!(purged = purged, "Purged finished tasks");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
