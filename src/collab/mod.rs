//! Narrow interfaces to the services the engines report to or hand work to.
//!
//! Every call returns a [`SideResult`]. A failure here never fails a backup,
//! restore or reset; call sites inspect the result and log it with
//! [`SideChannelExt::log_failure`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::warn;

use crate::export::Scope;

mod job_queue;
mod local_store;
mod tracing_sinks;

pub use job_queue::{remove_tenant_files, JobReport, LifecycleJob, SqliteJobQueue, FILE_CLEANUP_JOB};
pub use local_store::LocalDirStore;
pub use tracing_sinks::{TracingAudit, TracingMetrics};

#[derive(Debug, Error)]
pub enum SideChannelError {
    #[error("object storage: {0}")]
    Storage(String),
    #[error("metrics: {0}")]
    Metrics(String),
    #[error("job queue: {0}")]
    Queue(String),
    #[error("audit: {0}")]
    Audit(String),
}

pub type SideResult<T> = Result<T, SideChannelError>;

pub trait SideChannelExt<T> {
    /// Discard a side-channel failure after logging it.
    fn log_failure(self, operation: &str) -> Option<T>;
}

impl<T> SideChannelExt<T> for SideResult<T> {
    fn log_failure(self, operation: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target: "tenant_lifecycle",
                    event = "side_channel_failed",
                    operation,
                    error = %err
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub url: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], destination_id: &str) -> SideResult<String>;
    async fn download(&self, destination_id: &str) -> SideResult<Vec<u8>>;
    async fn list(&self, prefix: &str) -> SideResult<Vec<RemoteObject>>;
}

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct TimingHandle {
    pub name: String,
    pub tags: Tags,
    started: Instant,
}

impl TimingHandle {
    pub fn start(name: &str, tags: &Tags) -> Self {
        TimingHandle {
            name: name.to_string(),
            tags: tags.clone(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

pub trait MetricsSink: Send + Sync {
    fn start_timing(&self, name: &str, tags: &Tags) -> SideResult<TimingHandle>;
    /// Returns the measured duration in milliseconds.
    fn stop_timing(&self, handle: TimingHandle) -> SideResult<u64>;
    fn emit(&self, name: &str, tags: &Tags, fields: &serde_json::Value) -> SideResult<()>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_type: &str, payload: serde_json::Value) -> SideResult<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub scope: Scope,
    pub operation: String,
    pub success: bool,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> SideResult<()>;
}

/// The collaborators one engine invocation talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Option<Arc<dyn ObjectStore>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub jobs: Arc<dyn JobQueue>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Tracing-backed metrics and audit with the table-backed job queue, no
    /// object store.
    pub fn local(pool: &SqlitePool) -> Self {
        Collaborators {
            store: None,
            metrics: Arc::new(TracingMetrics),
            jobs: Arc::new(SqliteJobQueue::new(pool.clone())),
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }
}
