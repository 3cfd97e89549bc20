#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tempfile::tempdir;

use tenant_lifecycle::collab::{Collaborators, SqliteJobQueue, FILE_CLEANUP_JOB};
use tenant_lifecycle::config::LifecycleConfig;
use tenant_lifecycle::reset::{
    self, Caller, ResetContext, ResetOptions, ResetStep, Role, StepAction, StepFilter,
    StepOperation,
};
use tenant_lifecycle::{LifecycleError, Phase, SchemaCapabilities, Scope};

#[path = "util.rs"]
mod util;

struct Fixture {
    pool: SqlitePool,
    caps: SchemaCapabilities,
    config: LifecycleConfig,
    recorder: Arc<util::Recorder>,
    collab: Collaborators,
    _dir: tempfile::TempDir,
}

impl Fixture {
    async fn new() -> Fixture {
        let pool = util::pos_pool().await;
        util::seed_tenant(&pool, 42, 0).await;
        util::seed_tenant(&pool, 7, 100).await;
        let dir = tempdir().unwrap();
        let config = util::config(dir.path());
        let caps = util::caps(&pool).await;
        let recorder = Arc::new(util::Recorder::default());
        let collab = util::recording(&recorder);
        Fixture {
            pool,
            caps,
            config,
            recorder,
            collab,
            _dir: dir,
        }
    }

    fn ctx(&self) -> ResetContext<'_> {
        ResetContext {
            pool: &self.pool,
            caps: &self.caps,
            config: &self.config,
            collab: &self.collab,
        }
    }
}

fn owner_of(company_id: i64) -> Caller {
    Caller {
        user_id: 1,
        role: Role::Owner,
        company_id: Some(company_id),
    }
}

fn super_admin() -> Caller {
    Caller {
        user_id: 900,
        role: Role::SuperAdmin,
        company_id: None,
    }
}

const LIVE: ResetOptions = ResetOptions {
    dry_run: false,
    keep_catalog: false,
};
const DRY: ResetOptions = ResetOptions {
    dry_run: true,
    keep_catalog: false,
};

#[tokio::test]
async fn dry_run_counts_without_mutating_and_is_repeatable() -> Result<()> {
    let fx = Fixture::new().await;
    let before = util::tenant_rows(&fx.pool, 42).await;

    let first = reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, DRY).await?;
    let second = reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, DRY).await?;
    assert!(first.dry_run);
    assert_eq!(first.per_table_row_counts, second.per_table_row_counts);
    assert_eq!(first.per_table_row_counts["sale_items"], 2);
    assert_eq!(first.per_table_row_counts["products"], 2);
    assert_eq!(first.per_table_row_counts["companies"], 1);
    assert_eq!(first.per_table_row_counts["repairs"], 0);
    assert!(first.errors.is_empty(), "{:?}", first.errors);
    assert_eq!(util::tenant_rows(&fx.pool, 42).await, before);

    assert_eq!(
        fx.recorder.metric_names(),
        vec![
            "reset.started",
            "reset.dry_run_completed",
            "reset.started",
            "reset.dry_run_completed"
        ]
    );
    assert!(fx.recorder.jobs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn live_reset_without_backup_hits_the_safety_gate() -> Result<()> {
    let fx = Fixture::new().await;
    let before_42 = util::tenant_rows(&fx.pool, 42).await;

    let err = reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, LIVE)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::SafetyGate { window_hours: 24, .. }));
    assert_eq!(util::tenant_rows(&fx.pool, 42).await, before_42);

    // A stale backup, or one of a different scope, does not count either.
    let stale = (Utc::now() - Duration::hours(30)).timestamp_millis();
    util::record_completed_backup(&fx.pool, Scope::Company(42), Some(stale)).await;
    util::record_completed_backup(&fx.pool, Scope::Company(7), None).await;
    let err = reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, LIVE)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::SafetyGate { .. }));
    assert_eq!(util::tenant_rows(&fx.pool, 42).await, before_42);

    let names = fx.recorder.metric_names();
    assert_eq!(names.last().map(String::as_str), Some("reset.failed"));
    let audits = fx.recorder.audits.lock().unwrap();
    assert!(audits.iter().all(|a| !a.success));
    Ok(())
}

#[tokio::test]
async fn live_reset_leaves_other_tenants_untouched() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    let other_before = util::tenant_rows(&fx.pool, 7).await;
    let projected = reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, DRY).await?;

    let outcome = reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, LIVE).await?;
    assert!(!outcome.dry_run);
    assert_eq!(outcome.per_table_row_counts, projected.per_table_row_counts);
    assert!(util::tenant_rows(&fx.pool, 42)
        .await
        .iter()
        .all(|(_, rows)| rows.is_empty()));
    assert_eq!(util::tenant_rows(&fx.pool, 7).await, other_before);

    let invoice: i64 = sqlx::query_scalar("SELECT next_invoice_number FROM companies WHERE id = ?")
        .bind(42_i64)
        .fetch_one(&fx.pool)
        .await?;
    assert_eq!(invoice, 1);
    let untouched: i64 = sqlx::query_scalar("SELECT next_invoice_number FROM companies WHERE id = 7")
        .fetch_one(&fx.pool)
        .await?;
    assert_eq!(untouched, 50);

    let fk_on: i64 = sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(&fx.pool).await?;
    assert_eq!(fk_on, 1);

    let jobs = fx.recorder.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].0, FILE_CLEANUP_JOB);
    assert_eq!(jobs[0].1["scope"]["company_id"], 42);
    assert!(fx.recorder.metric_names().contains(&"reset.completed".to_string()));
    Ok(())
}

#[tokio::test]
async fn keep_catalog_zeroes_stock_instead_of_deleting() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    let options = ResetOptions {
        dry_run: false,
        keep_catalog: true,
    };

    reset::reset_tenant(&fx.ctx(), &owner_of(42), 42, options).await?;
    let stock: Vec<i64> =
        sqlx::query_scalar("SELECT quantity FROM products WHERE company_id = 42 ORDER BY id")
            .fetch_all(&fx.pool)
            .await?;
    assert_eq!(stock, vec![0, 0]);
    assert_eq!(util::count(&fx.pool, "SELECT COUNT(*) FROM categories WHERE company_id = 42").await, 1);
    assert_eq!(util::count(&fx.pool, "SELECT COUNT(*) FROM sales WHERE company_id = 42").await, 0);
    Ok(())
}

#[tokio::test]
async fn optional_missing_table_counts_zero_and_continues() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    let steps = vec![
        ResetStep {
            order: 1,
            operation: StepOperation::Delete,
            target_table: "warranty_claims".into(),
            action: StepAction::Delete(StepFilter::Tenant),
            params: Vec::new(),
            optional: true,
        },
        ResetStep {
            order: 2,
            operation: StepOperation::Delete,
            target_table: "payments".into(),
            action: StepAction::Delete(StepFilter::Tenant),
            params: Vec::new(),
            optional: false,
        },
    ];

    let outcome = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, LIVE).await?;
    assert_eq!(outcome.per_table_row_counts["warranty_claims"], 0);
    assert_eq!(outcome.per_table_row_counts["payments"], 1);
    assert!(outcome.errors.is_empty());
    Ok(())
}

#[tokio::test]
async fn required_missing_table_aborts_without_partial_mutation() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    let before = util::tenant_rows(&fx.pool, 42).await;
    let steps = vec![
        ResetStep {
            order: 1,
            operation: StepOperation::Delete,
            target_table: "payments".into(),
            action: StepAction::Delete(StepFilter::Tenant),
            params: Vec::new(),
            optional: false,
        },
        ResetStep {
            order: 2,
            operation: StepOperation::Delete,
            target_table: "warranty_claims".into(),
            action: StepAction::Delete(StepFilter::Tenant),
            params: Vec::new(),
            optional: false,
        },
    ];

    let dry = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, DRY).await?;
    assert_eq!(dry.errors.len(), 1);

    let err = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, LIVE)
        .await
        .unwrap_err();
    match err {
        LifecycleError::Structural { table, phase, .. } => {
            assert_eq!(table, "warranty_claims");
            assert_eq!(phase, Phase::Reset);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(util::tenant_rows(&fx.pool, 42).await, before);
    assert!(fx.recorder.jobs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn optional_step_failure_rolls_back_the_reset() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    let before = util::tenant_rows(&fx.pool, 42).await;
    let steps = vec![
        ResetStep {
            order: 1,
            operation: StepOperation::Delete,
            target_table: "sale_items".into(),
            action: StepAction::Delete(StepFilter::ViaParent {
                column: "sale_id".into(),
                parent_table: "sales".into(),
                parent_column: "id".into(),
            }),
            params: Vec::new(),
            optional: false,
        },
        ResetStep {
            order: 2,
            operation: StepOperation::RawSql,
            target_table: "payments".into(),
            action: StepAction::Raw {
                sql: "DELETE FROM payments WHERE no_such_column = ?".into(),
                count_sql: "SELECT COUNT(*) FROM payments WHERE no_such_column = ?".into(),
            },
            params: vec![42_i64.into()],
            optional: true,
        },
    ];

    let dry = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, DRY).await?;
    assert_eq!(dry.errors.len(), 1);
    assert_eq!(dry.per_table_row_counts["sale_items"], 2);

    let err = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, LIVE)
        .await
        .unwrap_err();
    match err {
        LifecycleError::Structural { table, phase, reason } => {
            assert_eq!(table, "payments");
            assert_eq!(phase, Phase::Reset);
            assert!(reason.contains("no_such_column"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(util::tenant_rows(&fx.pool, 42).await, before);
    assert_eq!(util::count(&fx.pool, "SELECT COUNT(*) FROM sale_items").await, 4);
    assert!(fx.recorder.jobs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn optional_raw_step_on_a_missing_table_counts_zero() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    let steps = vec![
        ResetStep {
            order: 1,
            operation: StepOperation::RawSql,
            target_table: "payments".into(),
            action: StepAction::Raw {
                sql: "DELETE FROM payments_archive WHERE company_id = ?".into(),
                count_sql: "SELECT COUNT(*) FROM payments_archive WHERE company_id = ?".into(),
            },
            params: vec![42_i64.into()],
            optional: true,
        },
        ResetStep {
            order: 2,
            operation: StepOperation::Delete,
            target_table: "payments".into(),
            action: StepAction::Delete(StepFilter::Tenant),
            params: Vec::new(),
            optional: false,
        },
    ];

    let dry = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, DRY).await?;
    assert!(dry.errors.is_empty(), "{:?}", dry.errors);

    let outcome = reset::reset(&fx.ctx(), &owner_of(42), Scope::Company(42), &steps, LIVE).await?;
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.per_table_row_counts["payments"], 1);
    assert_eq!(util::count(&fx.pool, "SELECT COUNT(*) FROM payments WHERE company_id = 42").await, 0);
    Ok(())
}

#[tokio::test]
async fn unauthorized_callers_are_refused_before_any_step() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::Company(42), None).await;
    util::record_completed_backup(&fx.pool, Scope::System, None).await;
    let before = util::tenant_rows(&fx.pool, 42).await;

    let staff = Caller {
        user_id: 3,
        role: Role::Staff,
        company_id: Some(42),
    };
    for (caller, scope) in [
        (staff, Scope::Company(42)),
        (owner_of(7), Scope::Company(42)),
        (owner_of(42), Scope::System),
    ] {
        let result = match scope {
            Scope::Company(id) => reset::reset_tenant(&fx.ctx(), &caller, id, LIVE).await,
            Scope::System => reset::reset_system(&fx.ctx(), &caller, LIVE).await,
        };
        assert!(matches!(result, Err(LifecycleError::Authorization { .. })));
    }
    assert_eq!(util::tenant_rows(&fx.pool, 42).await, before);
    Ok(())
}

#[tokio::test]
async fn system_reset_clears_every_tenant_and_sequences() -> Result<()> {
    let fx = Fixture::new().await;
    util::record_completed_backup(&fx.pool, Scope::System, None).await;

    let outcome = reset::reset_system(&fx.ctx(), &super_admin(), LIVE).await?;
    for table in util::TENANT_TABLES {
        let rows = util::count(&fx.pool, &format!("SELECT COUNT(*) FROM {table}")).await;
        assert_eq!(rows, 0, "{table} not cleared");
    }
    assert!(outcome.per_table_row_counts["sqlite_sequence"] > 0);
    assert_eq!(
        util::count(&fx.pool, "SELECT COUNT(*) FROM sqlite_sequence WHERE name = 'products'").await,
        0
    );
    assert_eq!(util::count(&fx.pool, "SELECT COUNT(*) FROM companies").await, 2);
    assert_eq!(fx.recorder.jobs.lock().unwrap()[0].1["scope"]["kind"], "system");
    Ok(())
}

#[tokio::test]
async fn job_queue_failure_does_not_fail_the_reset() -> Result<()> {
    let pool = util::pos_pool().await;
    util::seed_tenant(&pool, 42, 0).await;
    util::record_completed_backup(&pool, Scope::Company(42), None).await;
    let dir = tempdir()?;
    let config = util::config(dir.path());
    let caps = util::caps(&pool).await;
    let recorder = Arc::new(util::Recorder {
        fail_jobs: true,
        ..Default::default()
    });
    let collab = util::recording(&recorder);
    let ctx = ResetContext {
        pool: &pool,
        caps: &caps,
        config: &config,
        collab: &collab,
    };

    let outcome = reset::reset_tenant(&ctx, &owner_of(42), 42, LIVE).await?;
    assert_eq!(outcome.per_table_row_counts["customers"], 1);
    Ok(())
}

#[tokio::test]
async fn cleanup_job_lands_in_the_table_queue() -> Result<()> {
    let pool = util::pos_pool().await;
    util::seed_tenant(&pool, 42, 0).await;
    util::record_completed_backup(&pool, Scope::Company(42), None).await;
    let dir = tempdir()?;
    let config = util::config(dir.path());
    let caps = util::caps(&pool).await;
    let collab = Collaborators::local(&pool);
    let ctx = ResetContext {
        pool: &pool,
        caps: &caps,
        config: &config,
        collab: &collab,
    };

    reset::reset_tenant(&ctx, &owner_of(42), 42, LIVE).await?;
    let pending = SqliteJobQueue::new(pool.clone())
        .pending(FILE_CLEANUP_JOB, 10)
        .await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["scope"]["company_id"], 42);
    Ok(())
}
