use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobQueue, SideChannelError, SideResult};
use crate::export::Scope;
use crate::time::now_ms;

pub const FILE_CLEANUP_JOB: &str = "file_cleanup";
const MAX_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleJob {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Job queue persisted in `lifecycle_jobs`. Jobs are picked up by whoever
/// calls [`SqliteJobQueue::process_pending`].
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteJobQueue { pool }
    }

    pub async fn pending(&self, job_type: &str, limit: i64) -> Result<Vec<LifecycleJob>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, job_type, payload, status, attempts, last_error, created_at, processed_at \
             FROM lifecycle_jobs WHERE job_type = ? AND status = 'pending' \
             ORDER BY created_at, id LIMIT ?",
        )
        .bind(job_type)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                let payload = serde_json::from_str(&payload).map_err(|err| sqlx::Error::ColumnDecode {
                    index: "payload".into(),
                    source: Box::new(err),
                })?;
                Ok(LifecycleJob {
                    id: row.try_get("id")?,
                    job_type: row.try_get("job_type")?,
                    payload,
                    status: row.try_get("status")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                    created_at: row.try_get("created_at")?,
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }

    /// Run `handler` over up to `limit` pending jobs of `job_type`. A failing
    /// job stays pending until it has failed `MAX_ATTEMPTS` times.
    pub async fn process_pending<F>(
        &self,
        job_type: &str,
        limit: i64,
        mut handler: F,
    ) -> Result<JobReport, sqlx::Error>
    where
        F: FnMut(&LifecycleJob) -> anyhow::Result<()>,
    {
        let mut report = JobReport::default();
        for job in self.pending(job_type, limit).await? {
            report.processed += 1;
            let attempts = job.attempts + 1;
            match handler(&job) {
                Ok(()) => {
                    sqlx::query(
                        "UPDATE lifecycle_jobs SET status = 'done', attempts = ?, last_error = NULL, processed_at = ? WHERE id = ?",
                    )
                    .bind(attempts)
                    .bind(now_ms())
                    .bind(&job.id)
                    .execute(&self.pool)
                    .await?;
                    report.succeeded += 1;
                    info!(target: "tenant_lifecycle", event = "job_done", job_id = %job.id, job_type);
                }
                Err(err) => {
                    let status = if attempts >= MAX_ATTEMPTS { "failed" } else { "pending" };
                    sqlx::query(
                        "UPDATE lifecycle_jobs SET status = ?, attempts = ?, last_error = ?, processed_at = ? WHERE id = ?",
                    )
                    .bind(status)
                    .bind(attempts)
                    .bind(format!("{err:#}"))
                    .bind(now_ms())
                    .bind(&job.id)
                    .execute(&self.pool)
                    .await?;
                    report.failed += 1;
                    warn!(
                        target: "tenant_lifecycle",
                        event = "job_failed",
                        job_id = %job.id,
                        job_type,
                        attempts,
                        error = %err
                    );
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job_type: &str, payload: serde_json::Value) -> SideResult<String> {
        let id = Uuid::now_v7().to_string();
        sqlx::query(
            "INSERT INTO lifecycle_jobs (id, job_type, payload, status, attempts, created_at) \
             VALUES (?, ?, ?, 'pending', 0, ?)",
        )
        .bind(&id)
        .bind(job_type)
        .bind(payload.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|err| SideChannelError::Queue(err.to_string()))?;
        info!(target: "tenant_lifecycle", event = "job_enqueued", job_id = %id, job_type);
        Ok(id)
    }
}

/// `file_cleanup` handler: removes the per-company upload directories
/// (`company_<id>`) under `files_root` for the scope named in the payload.
pub fn remove_tenant_files(files_root: &Path, job: &LifecycleJob) -> anyhow::Result<()> {
    let scope: Scope = serde_json::from_value(job.payload["scope"].clone())
        .context("file_cleanup payload has no scope")?;
    if !files_root.exists() {
        return Ok(());
    }
    let targets = match scope {
        Scope::Company(id) => vec![files_root.join(format!("company_{id}"))],
        Scope::System => fs::read_dir(files_root)
            .with_context(|| format!("list {}", files_root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("company_"))
            .map(|entry| entry.path())
            .collect(),
    };
    for dir in targets.into_iter().filter(|d| d.is_dir()) {
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        info!(target: "tenant_lifecycle", event = "tenant_files_removed", path = %dir.display());
    }
    Ok(())
}
