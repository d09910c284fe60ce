/*
* Job progress store
* ------------------
* One record per background job, written by the job's own task and its worker
* pool, read by pollers. Every mutation holds the record's DashMap entry guard.
*
* Records expire `retention` after their last update, not after creation.
*/

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Provision,
    Save,
    Push,
    Reimage,
    Revert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub kind: Option<JobKind>,
    pub class_id: Option<String>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_item: Option<String>,
    pub status: JobStatus,
    pub errors: Vec<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    fn new(job_id: &str, kind: Option<JobKind>, class_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            kind,
            class_id,
            total: 0,
            completed: 0,
            failed: 0,
            current_item: None,
            status: JobStatus::Pending,
            errors: Vec::new(),
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Set(usize),
    Add(usize),
}

impl Counter {
    fn apply(self, value: &mut usize) {
        match self {
            Counter::Set(n) => *value = n,
            Counter::Add(n) => *value = value.saturating_add(n),
        }
    }
}

/// A partial update; unset fields are left alone. `error` is appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub total: Option<usize>,
    pub completed: Option<Counter>,
    pub failed: Option<Counter>,
    pub current_item: Option<String>,
    pub status: Option<JobStatus>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn completed(mut self, counter: Counter) -> Self {
        self.completed = Some(counter);
        self
    }

    pub fn failed(mut self, counter: Counter) -> Self {
        self.failed = Some(counter);
        self
    }

    pub fn current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

struct Entry {
    progress: JobProgress,
    touched: Instant,
}

pub struct ProgressTracker {
    jobs: DashMap<String, Entry>,
    retention: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention,
        }
    }

    /// Registers a job that has been accepted but not started yet.
    pub fn enqueue(&self, job_id: &str, kind: JobKind, class_id: &str) {
        self.jobs.insert(
            job_id.to_string(),
            Entry {
                progress: JobProgress::new(job_id, Some(kind), Some(class_id.to_string())),
                touched: Instant::now(),
            },
        );
    }

    /// Marks a job running with `total` steps, creating the record if needed.
    pub fn start(&self, job_id: &str, total: usize) {
        let mut entry = self.jobs.entry(job_id.to_string()).or_insert_with(|| Entry {
            progress: JobProgress::new(job_id, None, None),
            touched: Instant::now(),
        });
        entry.progress.total = total;
        entry.progress.status = JobStatus::Running;
        entry.progress.updated_at = Utc::now();
        entry.touched = Instant::now();
    }

    /// Applies `update` atomically. Returns false for unknown or expired jobs.
    pub fn update(&self, job_id: &str, update: ProgressUpdate) -> bool {
        let Some(mut entry) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if self.expired(&entry) {
            return false;
        }
        let progress = &mut entry.progress;
        if let Some(total) = update.total {
            progress.total = total;
        }
        if let Some(counter) = update.completed {
            counter.apply(&mut progress.completed);
        }
        if let Some(counter) = update.failed {
            counter.apply(&mut progress.failed);
        }
        if update.current_item.is_some() {
            progress.current_item = update.current_item;
        }
        if let Some(status) = update.status {
            progress.status = status;
        }
        if let Some(message) = update.message {
            progress.message = message;
        }
        if let Some(error) = update.error {
            progress.errors.push(error);
        }
        progress.updated_at = Utc::now();
        entry.touched = Instant::now();
        true
    }

    pub fn set_current(&self, job_id: &str, item: impl Into<String>) {
        self.update(job_id, ProgressUpdate::new().current_item(item));
    }

    pub fn complete_step(&self, job_id: &str, item: &str) {
        self.update(
            job_id,
            ProgressUpdate::new()
                .completed(Counter::Add(1))
                .current_item(item),
        );
    }

    pub fn fail_step(&self, job_id: &str, item: &str, error: &str) {
        self.update(
            job_id,
            ProgressUpdate::new()
                .failed(Counter::Add(1))
                .current_item(item)
                .error(format!("{}: {}", item, error)),
        );
    }

    pub fn finish(&self, job_id: &str, message: impl Into<String>) {
        self.update(
            job_id,
            ProgressUpdate::new()
                .status(JobStatus::Completed)
                .message(message),
        );
    }

    pub fn fail(&self, job_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(
            job_id,
            ProgressUpdate::new()
                .status(JobStatus::Failed)
                .message(format!("Job failed: {}", error))
                .error(error),
        );
    }

    /// Snapshot of a job, or `None` if it is unknown or expired. Expired
    /// records read as gone even before a sweep reclaims them.
    pub fn get(&self, job_id: &str) -> Option<JobProgress> {
        self.jobs
            .get(job_id)
            .filter(|entry| !self.expired(entry))
            .map(|entry| entry.progress.clone())
    }

    fn expired(&self, entry: &Entry) -> bool {
        entry.touched.elapsed() >= self.retention
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drops records not updated within the retention window.
    pub fn sweep(&self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| !self.expired(entry));
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            debug!(removed, "Expired job progress purged");
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        info!(interval_secs = every.as_secs(), "Starting progress sweeper");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                tracker.sweep();
            }
        })
    }
}
