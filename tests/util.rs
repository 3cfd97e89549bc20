#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use tenant_lifecycle::catalog::{self, NewBackup};
use tenant_lifecycle::collab::{
    AuditEvent, AuditSink, Collaborators, JobQueue, MetricsSink, SideChannelError, SideResult,
    Tags, TimingHandle,
};
use tenant_lifecycle::db::sql::{Predicate, Statement};
use tenant_lifecycle::{LifecycleConfig, Row, SchemaCapabilities, Scope};

/// A small point-of-sale schema shaped like the databases the engine runs
/// against. Deliberately lacks the optional tables (repairs, purchase
/// orders, expenses, ...).
pub const POS_SCHEMA: &str = r#"
CREATE TABLE companies (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  next_invoice_number INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE users (
  id INTEGER PRIMARY KEY,
  company_id INTEGER REFERENCES companies(id),
  name TEXT NOT NULL
);
CREATE TABLE categories (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  company_id INTEGER NOT NULL REFERENCES companies(id),
  name TEXT NOT NULL
);
CREATE TABLE suppliers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  company_id INTEGER NOT NULL REFERENCES companies(id),
  name TEXT NOT NULL
);
CREATE TABLE customers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  company_id INTEGER NOT NULL REFERENCES companies(id),
  name TEXT NOT NULL,
  created_by INTEGER REFERENCES users(id)
);
CREATE TABLE products (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  company_id INTEGER NOT NULL REFERENCES companies(id),
  category_id INTEGER REFERENCES categories(id),
  name TEXT NOT NULL,
  price REAL NOT NULL DEFAULT 0,
  quantity INTEGER NOT NULL DEFAULT 0,
  active INTEGER NOT NULL DEFAULT 1,
  created_by INTEGER REFERENCES users(id)
);
CREATE TABLE sales (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  company_id INTEGER NOT NULL REFERENCES companies(id),
  customer_id INTEGER REFERENCES customers(id),
  cashier_user_id INTEGER NOT NULL REFERENCES users(id),
  total REAL NOT NULL
);
CREATE TABLE sale_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  sale_id INTEGER NOT NULL REFERENCES sales(id),
  product_id INTEGER NOT NULL REFERENCES products(id),
  qty INTEGER NOT NULL,
  price REAL NOT NULL
);
CREATE TABLE payments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  company_id INTEGER NOT NULL REFERENCES companies(id),
  sale_id INTEGER REFERENCES sales(id),
  amount REAL NOT NULL
);
"#;

/// Tables of [`POS_SCHEMA`] holding tenant data, children last.
pub const TENANT_TABLES: &[&str] = &[
    "categories",
    "suppliers",
    "customers",
    "products",
    "sales",
    "sale_items",
    "payments",
];

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

/// In-memory POS database with the lifecycle catalog applied.
pub async fn pos_pool() -> SqlitePool {
    let pool = temp_pool().await;
    sqlx::raw_sql(POS_SCHEMA).execute(&pool).await.unwrap();
    tenant_lifecycle::migrate::apply_migrations(&pool)
        .await
        .unwrap();
    pool
}

pub async fn caps(pool: &SqlitePool) -> SchemaCapabilities {
    let mut conn = pool.acquire().await.unwrap();
    SchemaCapabilities::load(&mut conn).await.unwrap()
}

pub fn config(dir: &Path) -> LifecycleConfig {
    LifecycleConfig::for_paths(&dir.join("lifecycle.sqlite3"), &dir.join("backups"))
}

pub async fn exec(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

pub async fn add_company(pool: &SqlitePool, id: i64) {
    sqlx::query("INSERT INTO companies (id, name, next_invoice_number) VALUES (?, ?, 50)")
        .bind(id)
        .bind(format!("Company {id}"))
        .execute(pool)
        .await
        .unwrap();
}

pub async fn add_user(pool: &SqlitePool, id: i64, company_id: i64) {
    sqlx::query("INSERT INTO users (id, company_id, name) VALUES (?, ?, ?)")
        .bind(id)
        .bind(company_id)
        .bind(format!("User {id}"))
        .execute(pool)
        .await
        .unwrap();
}

pub async fn add_product(pool: &SqlitePool, id: i64, company_id: i64, name: &str, quantity: i64) {
    sqlx::query(
        "INSERT INTO products (id, company_id, name, price, quantity) VALUES (?, ?, ?, 9.5, ?)",
    )
    .bind(id)
    .bind(company_id)
    .bind(name)
    .bind(quantity)
    .execute(pool)
    .await
    .unwrap();
}

/// A company with rows in every tenant table. Ids are offset by `base` so
/// several tenants can share one database.
pub async fn seed_tenant(pool: &SqlitePool, company_id: i64, base: i64) {
    add_company(pool, company_id).await;
    add_user(pool, base + 1, company_id).await;
    sqlx::query("INSERT INTO categories (id, company_id, name) VALUES (?, ?, 'Parts')")
        .bind(base + 1)
        .bind(company_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO suppliers (id, company_id, name) VALUES (?, ?, 'Acme')")
        .bind(base + 1)
        .bind(company_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO customers (id, company_id, name, created_by) VALUES (?, ?, 'Ann', ?)")
        .bind(base + 1)
        .bind(company_id)
        .bind(base + 1)
        .execute(pool)
        .await
        .unwrap();
    for n in 1..=2 {
        add_product(pool, base + n, company_id, &format!("Widget {n}"), 5).await;
    }
    sqlx::query(
        "INSERT INTO sales (id, company_id, customer_id, cashier_user_id, total) VALUES (?, ?, ?, ?, 19.0)",
    )
    .bind(base + 1)
    .bind(company_id)
    .bind(base + 1)
    .bind(base + 1)
    .execute(pool)
    .await
    .unwrap();
    for n in 1..=2 {
        sqlx::query("INSERT INTO sale_items (id, sale_id, product_id, qty, price) VALUES (?, ?, ?, 1, 9.5)")
            .bind(base + n)
            .bind(base + 1)
            .bind(base + n)
            .execute(pool)
            .await
            .unwrap();
    }
    sqlx::query("INSERT INTO payments (id, company_id, sale_id, amount) VALUES (?, ?, ?, 19.0)")
        .bind(base + 1)
        .bind(company_id)
        .bind(base + 1)
        .execute(pool)
        .await
        .unwrap();
}

/// Every row of `table`, ordered by id.
pub async fn dump(pool: &SqlitePool, table: &str) -> Vec<Row> {
    let mut conn = pool.acquire().await.unwrap();
    Statement::select(table, &Predicate::All, Some("id"))
        .fetch_rows(&mut conn)
        .await
        .unwrap()
}

/// Rows of every tenant table belonging to `company_id`; sale items are
/// attributed through their sale.
pub async fn tenant_rows(pool: &SqlitePool, company_id: i64) -> Vec<(String, Vec<Row>)> {
    let mut conn = pool.acquire().await.unwrap();
    let mut out = Vec::new();
    for table in TENANT_TABLES {
        let predicate = if *table == "sale_items" {
            Predicate::InParent {
                column: "sale_id".into(),
                parent_table: "sales".into(),
                parent_column: "id".into(),
                filter: Box::new(Predicate::eq("company_id", company_id)),
            }
        } else {
            Predicate::eq("company_id", company_id)
        };
        let rows = Statement::select(table, &predicate, Some("id"))
            .fetch_rows(&mut conn)
            .await
            .unwrap();
        out.push((table.to_string(), rows));
    }
    out
}

pub async fn record_completed_backup(pool: &SqlitePool, scope: Scope, created_at: Option<i64>) {
    let pending = catalog::insert_pending(
        pool,
        &NewBackup {
            scope,
            file_name: format!("backup_{}_fixture.zip", scope.company_id().unwrap_or(0)),
            storage_location: "/tmp".into(),
            format: "zip/json".into(),
            created_by: Some(1),
            created_at,
        },
    )
    .await
    .unwrap();
    catalog::mark_completed(pool, &pending.id, 128, 10).await.unwrap();
}

/// Collaborators that remember what they were told.
#[derive(Default)]
pub struct Recorder {
    pub metrics: Mutex<Vec<(String, serde_json::Value)>>,
    pub audits: Mutex<Vec<AuditEvent>>,
    pub jobs: Mutex<Vec<(String, serde_json::Value)>>,
    /// Makes every job enqueue fail.
    pub fail_jobs: bool,
}

impl Recorder {
    pub fn metric_names(&self) -> Vec<String> {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

pub struct RecordingMetrics(pub Arc<Recorder>);
pub struct RecordingAudit(pub Arc<Recorder>);
pub struct RecordingJobs(pub Arc<Recorder>);

impl MetricsSink for RecordingMetrics {
    fn start_timing(&self, name: &str, tags: &Tags) -> SideResult<TimingHandle> {
        Ok(TimingHandle::start(name, tags))
    }

    fn stop_timing(&self, handle: TimingHandle) -> SideResult<u64> {
        Ok(handle.elapsed_ms())
    }

    fn emit(&self, name: &str, _tags: &Tags, fields: &serde_json::Value) -> SideResult<()> {
        self.0
            .metrics
            .lock()
            .unwrap()
            .push((name.to_string(), fields.clone()));
        Ok(())
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, event: &AuditEvent) -> SideResult<()> {
        self.0.audits.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RecordingJobs {
    async fn enqueue(&self, job_type: &str, payload: serde_json::Value) -> SideResult<String> {
        if self.0.fail_jobs {
            return Err(SideChannelError::Queue("queue offline".into()));
        }
        let mut jobs = self.0.jobs.lock().unwrap();
        jobs.push((job_type.to_string(), payload));
        Ok(format!("job-{}", jobs.len()))
    }
}

pub fn recording(recorder: &Arc<Recorder>) -> Collaborators {
    Collaborators {
        store: None,
        metrics: Arc::new(RecordingMetrics(recorder.clone())),
        jobs: Arc::new(RecordingJobs(recorder.clone())),
        audit: Arc::new(RecordingAudit(recorder.clone())),
    }
}
