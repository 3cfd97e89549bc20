//! Ordered deletion of a company's data, or of every company's data.
//!
//! A live reset runs every step of its plan inside one transaction with
//! foreign-key enforcement relaxed, and only after a recent backup of the
//! same scope is on record. A dry run counts what each step would touch.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::catalog;
use crate::collab::{AuditEvent, Collaborators, SideChannelExt, Tags, FILE_CLEANUP_JOB};
use crate::config::LifecycleConfig;
use crate::db::{IntegrityMode, TxHandle};
use crate::error::{LifecycleError, LifecycleResult, Phase};
use crate::export::Scope;
use crate::schema::SchemaCapabilities;

pub mod auth;
pub mod plan;

pub use auth::{authorize, Caller, Role};
pub use plan::{
    system_plan, tenant_plan, PlanOptions, ResetStep, StepAction, StepFilter, StepOperation,
    Unresolved,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    pub dry_run: bool,
    pub keep_catalog: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub scope: Scope,
    /// Rows deleted or updated per table; projected counts for a dry run.
    pub per_table_row_counts: BTreeMap<String, u64>,
    /// Steps a dry run could not count. A live run fails instead.
    pub errors: Vec<String>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl ResetOutcome {
    pub fn total_rows(&self) -> u64 {
        self.per_table_row_counts.values().sum()
    }
}

/// Everything a reset needs besides its scope.
pub struct ResetContext<'a> {
    pub pool: &'a SqlitePool,
    pub caps: &'a SchemaCapabilities,
    pub config: &'a LifecycleConfig,
    pub collab: &'a Collaborators,
}

pub async fn reset_tenant(
    ctx: &ResetContext<'_>,
    caller: &Caller,
    company_id: i64,
    options: ResetOptions,
) -> LifecycleResult<ResetOutcome> {
    let steps = tenant_plan(PlanOptions {
        keep_catalog: options.keep_catalog,
    });
    reset(ctx, caller, Scope::Company(company_id), &steps, options).await
}

pub async fn reset_system(
    ctx: &ResetContext<'_>,
    caller: &Caller,
    options: ResetOptions,
) -> LifecycleResult<ResetOutcome> {
    let steps = system_plan(PlanOptions {
        keep_catalog: options.keep_catalog,
    });
    reset(ctx, caller, Scope::System, &steps, options).await
}

/// Run an arbitrary step list for `scope`. The built-in plans go through
/// [`reset_tenant`] and [`reset_system`].
pub async fn reset(
    ctx: &ResetContext<'_>,
    caller: &Caller,
    scope: Scope,
    steps: &[ResetStep],
    options: ResetOptions,
) -> LifecycleResult<ResetOutcome> {
    let metrics = &ctx.collab.metrics;
    let tags: Tags = [
        ("scope".to_string(), scope.to_string()),
        ("caller_id".to_string(), caller.user_id.to_string()),
        ("dry_run".to_string(), options.dry_run.to_string()),
    ]
    .into_iter()
    .collect();
    let timing = metrics.start_timing("reset.duration", &tags).log_failure("reset_timing_start");
    metrics
        .emit("reset.started", &tags, &json!({ "steps": steps.len() }))
        .log_failure("reset_metric_started");

    let started = Instant::now();
    let result = run(ctx, caller, scope, steps, options, started).await;
    if let Some(handle) = timing {
        metrics.stop_timing(handle).log_failure("reset_timing_stop");
    }

    match &result {
        Ok(outcome) => {
            let name = if outcome.dry_run {
                "reset.dry_run_completed"
            } else {
                "reset.completed"
            };
            metrics
                .emit(
                    name,
                    &tags,
                    &json!({
                        "per_table_row_counts": outcome.per_table_row_counts,
                        "errors": outcome.errors,
                        "duration_ms": outcome.duration_ms,
                    }),
                )
                .log_failure("reset_metric_completed");
        }
        Err(err) => {
            metrics
                .emit(
                    "reset.failed",
                    &tags,
                    &json!({ "code": err.code(), "error": err.to_string() }),
                )
                .log_failure("reset_metric_failed");
        }
    }

    let details = match &result {
        Ok(outcome) => json!({
            "caller_id": caller.user_id,
            "dry_run": outcome.dry_run,
            "per_table_row_counts": outcome.per_table_row_counts,
            "errors": outcome.errors,
        }),
        Err(err) => json!({
            "caller_id": caller.user_id,
            "dry_run": options.dry_run,
            "code": err.code(),
            "error": err.to_string(),
        }),
    };
    let event = AuditEvent {
        scope,
        operation: "reset".into(),
        success: result.is_ok(),
        details,
    };
    ctx.collab.audit.record(&event).await.log_failure("audit_reset");
    result
}

async fn run(
    ctx: &ResetContext<'_>,
    caller: &Caller,
    scope: Scope,
    steps: &[ResetStep],
    options: ResetOptions,
    started: Instant,
) -> LifecycleResult<ResetOutcome> {
    authorize(caller, scope)?;
    let mut outcome = ResetOutcome {
        scope,
        per_table_row_counts: BTreeMap::new(),
        errors: Vec::new(),
        dry_run: options.dry_run,
        duration_ms: 0,
    };

    if options.dry_run {
        dry_run(ctx, scope, steps, &mut outcome).await?;
    } else {
        check_safety_gate(ctx, scope).await?;
        live_run(ctx, scope, steps, &mut outcome).await?;
        ctx.collab
            .jobs
            .enqueue(FILE_CLEANUP_JOB, json!({ "scope": scope }))
            .await
            .log_failure("enqueue_file_cleanup");
    }

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        target: "tenant_lifecycle",
        event = "reset_complete",
        scope = %scope,
        dry_run = options.dry_run,
        rows = outcome.total_rows(),
        errors = outcome.errors.len(),
        duration_ms = outcome.duration_ms
    );
    Ok(outcome)
}

async fn check_safety_gate(ctx: &ResetContext<'_>, scope: Scope) -> LifecycleResult<()> {
    let since = Utc::now() - ctx.config.safety_window();
    match catalog::latest_completed(ctx.pool, scope, since).await? {
        Some(record) => {
            info!(target: "tenant_lifecycle", event = "reset_safety_gate_passed", scope = %scope, backup_id = %record.id);
            Ok(())
        }
        None => Err(LifecycleError::SafetyGate {
            scope: scope.to_string(),
            window_hours: ctx.config.safety_window_hours,
        }),
    }
}

/// Counts only. A step that cannot be counted is noted and projected as zero.
async fn dry_run(
    ctx: &ResetContext<'_>,
    scope: Scope,
    steps: &[ResetStep],
    outcome: &mut ResetOutcome,
) -> LifecycleResult<()> {
    let mut tx = TxHandle::begin_read(ctx.pool).await?;
    for step in steps {
        let count = match step.resolve(ctx.caps, &ctx.config.tenant_column, scope) {
            Ok(resolved) => match resolved.count.fetch_count(tx.conn()).await {
                Ok(count) => count.max(0) as u64,
                Err(err) if step.optional && is_missing_table(&err) => 0,
                Err(err) => {
                    outcome.errors.push(step_error(step, &err.to_string()));
                    0
                }
            },
            Err(Unresolved::MissingTable) => {
                if !step.optional {
                    outcome
                        .errors
                        .push(step_error(step, "required table does not exist"));
                }
                0
            }
            Err(Unresolved::Incompatible(reason)) => {
                outcome.errors.push(step_error(step, &reason));
                0
            }
        };
        *outcome
            .per_table_row_counts
            .entry(step.target_table.clone())
            .or_default() += count;
    }
    tx.commit().await?;
    Ok(())
}

async fn live_run(
    ctx: &ResetContext<'_>,
    scope: Scope,
    steps: &[ResetStep],
    outcome: &mut ResetOutcome,
) -> LifecycleResult<()> {
    let mut tx = TxHandle::begin(ctx.pool, IntegrityMode::Relaxed).await?;
    for step in steps {
        let affected = match step.resolve(ctx.caps, &ctx.config.tenant_column, scope) {
            Ok(resolved) => match resolved.mutate.execute(tx.conn()).await {
                Ok(rows) => Ok(rows),
                Err(err) if step.optional && is_missing_table(&err) => {
                    info!(target: "tenant_lifecycle", event = "reset_step_table_missing", order = step.order, table = %step.target_table, error = %err);
                    Ok(0)
                }
                Err(err) => Err(err.to_string()),
            },
            Err(Unresolved::MissingTable) if step.optional => {
                info!(target: "tenant_lifecycle", event = "reset_step_table_missing", order = step.order, table = %step.target_table);
                Ok(0)
            }
            Err(Unresolved::MissingTable) => Err("required table does not exist".to_string()),
            Err(Unresolved::Incompatible(reason)) => Err(reason),
        };

        match affected {
            Ok(rows) => {
                *outcome
                    .per_table_row_counts
                    .entry(step.target_table.clone())
                    .or_default() += rows;
            }
            Err(reason) => {
                error!(
                    target: "tenant_lifecycle",
                    event = "reset_step_failed",
                    order = step.order,
                    table = %step.target_table,
                    optional = step.optional,
                    error = %reason
                );
                if let Err(rb) = tx.rollback().await {
                    error!(target: "tenant_lifecycle", event = "reset_rollback_failed", error = %rb);
                }
                return Err(LifecycleError::structural(
                    step.target_table.as_str(),
                    Phase::Reset,
                    format!("step {}: {reason}", step.order),
                ));
            }
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Optional steps only tolerate the absence of a table their SQL names.
fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().starts_with("no such table"))
}

fn step_error(step: &ResetStep, reason: &str) -> String {
    format!("step {} ({}): {reason}", step.order, step.target_table)
}
