//! Durable catalog of backup artifacts (`backup_records`) and the restore
//! points that name them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{LifecycleError, LifecycleResult};
use crate::export::Scope;
use crate::time::now_ms;
use crate::value::{bind_scalar, Scalar};

const RECORD_COLUMNS: &str = "id, company_id, file_name, storage_location, size_bytes, status, \
                              record_count, format, created_by, created_at, remote_url";
const DEFAULT_PER_PAGE: u32 = 20;
const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(BackupStatus::Pending),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub id: String,
    pub company_id: Option<i64>,
    pub file_name: String,
    pub storage_location: String,
    pub size_bytes: i64,
    pub status: BackupStatus,
    pub record_count: i64,
    pub format: String,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub remote_url: Option<String>,
}

impl BackupRecord {
    pub fn scope(&self) -> Scope {
        match self.company_id {
            Some(id) => Scope::Company(id),
            None => Scope::System,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(BackupRecord {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            file_name: row.try_get("file_name")?,
            storage_location: row.try_get("storage_location")?,
            size_bytes: row.try_get("size_bytes")?,
            status: BackupStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unknown backup status {status:?}").into(),
            })?,
            record_count: row.try_get("record_count")?,
            format: row.try_get("format")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            remote_url: row.try_get("remote_url")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewBackup {
    pub scope: Scope,
    pub file_name: String,
    pub storage_location: String,
    pub format: String,
    pub created_by: Option<i64>,
    /// Defaults to now; set when cataloguing an artifact produced elsewhere.
    pub created_at: Option<i64>,
}

pub async fn insert_pending(pool: &SqlitePool, new: &NewBackup) -> Result<BackupRecord, sqlx::Error> {
    let id = Uuid::now_v7().to_string();
    sqlx::query(
        "INSERT INTO backup_records (id, company_id, file_name, storage_location, size_bytes, status, record_count, format, created_by, created_at) \
         VALUES (?, ?, ?, ?, 0, 'pending', 0, ?, ?, ?)",
    )
    .bind(&id)
    .bind(new.scope.company_id())
    .bind(&new.file_name)
    .bind(&new.storage_location)
    .bind(&new.format)
    .bind(new.created_by)
    .bind(new.created_at.unwrap_or_else(now_ms))
    .execute(pool)
    .await?;
    info!(target: "tenant_lifecycle", event = "backup_record_pending", backup_id = %id, scope = %new.scope);
    get(pool, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn mark_completed(
    pool: &SqlitePool,
    id: &str,
    size_bytes: u64,
    record_count: u64,
) -> LifecycleResult<BackupRecord> {
    let updated = sqlx::query(
        "UPDATE backup_records SET status = 'completed', size_bytes = ?, record_count = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(size_bytes as i64)
    .bind(record_count as i64)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LifecycleError::Validation(format!("backup {id} is not pending")));
    }
    get(pool, id)
        .await?
        .ok_or_else(|| LifecycleError::Database(sqlx::Error::RowNotFound))
}

pub async fn mark_failed(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_records SET status = 'failed' WHERE id = ? AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await?;
    info!(target: "tenant_lifecycle", event = "backup_record_failed", backup_id = %id);
    Ok(())
}

/// The only change allowed once a record is terminal.
pub async fn attach_remote_url(pool: &SqlitePool, id: &str, url: &str) -> LifecycleResult<()> {
    let updated = sqlx::query(
        "UPDATE backup_records SET remote_url = ? WHERE id = ? AND status = 'completed'",
    )
    .bind(url)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LifecycleError::Validation(format!("backup {id} is not completed")));
    }
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<BackupRecord>, sqlx::Error> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM backup_records WHERE id = ?");
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .as_ref()
        .map(BackupRecord::from_row)
        .transpose()
}

pub async fn find_by_file_name(pool: &SqlitePool, file_name: &str) -> Result<Option<BackupRecord>, sqlx::Error> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM backup_records WHERE file_name = ? LIMIT 1");
    sqlx::query(&sql)
        .bind(file_name)
        .fetch_optional(pool)
        .await?
        .as_ref()
        .map(BackupRecord::from_row)
        .transpose()
}

/// Newest completed backup of exactly this scope created at or after `since`.
pub async fn latest_completed(
    pool: &SqlitePool,
    scope: Scope,
    since: DateTime<Utc>,
) -> Result<Option<BackupRecord>, sqlx::Error> {
    let scope_clause = match scope {
        Scope::Company(_) => "company_id = ?",
        Scope::System => "company_id IS NULL",
    };
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM backup_records \
         WHERE status = 'completed' AND {scope_clause} AND created_at >= ? \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    let mut query = sqlx::query(&sql);
    if let Scope::Company(id) = scope {
        query = query.bind(id);
    }
    query
        .bind(since.timestamp_millis())
        .fetch_optional(pool)
        .await?
        .as_ref()
        .map(BackupRecord::from_row)
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFilter {
    pub scope: Option<Scope>,
    pub status: Option<BackupStatus>,
    pub created_from: Option<i64>,
    pub created_to: Option<i64>,
    /// Substring of the file name.
    pub search: Option<String>,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

impl Default for BackupFilter {
    fn default() -> Self {
        BackupFilter {
            scope: None,
            status: None,
            created_from: None,
            created_to: None,
            search: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPage {
    pub records: Vec<BackupRecord>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('%');
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

pub async fn list(pool: &SqlitePool, filter: &BackupFilter) -> Result<BackupPage, sqlx::Error> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Scalar> = Vec::new();
    match filter.scope {
        Some(Scope::Company(id)) => {
            clauses.push("company_id = ?");
            binds.push(Scalar::Int(id));
        }
        Some(Scope::System) => clauses.push("company_id IS NULL"),
        None => {}
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        binds.push(Scalar::from(status.as_str()));
    }
    if let Some(from) = filter.created_from {
        clauses.push("created_at >= ?");
        binds.push(Scalar::Int(from));
    }
    if let Some(to) = filter.created_to {
        clauses.push("created_at <= ?");
        binds.push(Scalar::Int(to));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("file_name LIKE ? ESCAPE '\\'");
        binds.push(Scalar::String(escape_like(search)));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) AS total FROM backup_records{where_sql}");
    let mut count_query = sqlx::query(&count_sql);
    for value in &binds {
        count_query = bind_scalar(count_query, value);
    }
    let total: i64 = count_query.fetch_one(pool).await?.try_get("total")?;

    let page = filter.page.max(1);
    let per_page = filter.per_page.clamp(1, MAX_PER_PAGE);
    let offset = i64::from(page - 1) * i64::from(per_page);
    let list_sql = format!(
        "SELECT {RECORD_COLUMNS} FROM backup_records{where_sql} \
         ORDER BY created_at DESC, id DESC LIMIT {per_page} OFFSET {offset}"
    );
    let mut list_query = sqlx::query(&list_sql);
    for value in &binds {
        list_query = bind_scalar(list_query, value);
    }
    let records = list_query
        .fetch_all(pool)
        .await?
        .iter()
        .map(BackupRecord::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BackupPage {
        records,
        total,
        page,
        per_page,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePoint {
    pub id: String,
    pub name: String,
    pub backup_id: String,
    pub record_count: i64,
    pub table_count: i64,
    pub created_at: i64,
}

/// Name a completed backup as a restore target.
pub async fn create_restore_point(
    pool: &SqlitePool,
    name: &str,
    backup_id: &str,
    table_count: usize,
) -> LifecycleResult<RestorePoint> {
    let record = get(pool, backup_id)
        .await?
        .filter(|r| r.status == BackupStatus::Completed)
        .ok_or_else(|| {
            LifecycleError::Validation(format!("backup {backup_id} is not a completed backup"))
        })?;
    let point = RestorePoint {
        id: Uuid::now_v7().to_string(),
        name: name.to_string(),
        backup_id: record.id,
        record_count: record.record_count,
        table_count: table_count as i64,
        created_at: now_ms(),
    };
    sqlx::query(
        "INSERT INTO restore_points (id, name, backup_id, record_count, table_count, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&point.id)
    .bind(&point.name)
    .bind(&point.backup_id)
    .bind(point.record_count)
    .bind(point.table_count)
    .bind(point.created_at)
    .execute(pool)
    .await?;
    info!(target: "tenant_lifecycle", event = "restore_point_created", restore_point = %point.id, backup_id = %point.backup_id);
    Ok(point)
}

pub async fn list_restore_points(pool: &SqlitePool) -> Result<Vec<RestorePoint>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, name, backup_id, record_count, table_count, created_at FROM restore_points ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(RestorePoint {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                backup_id: row.try_get("backup_id")?,
                record_count: row.try_get("record_count")?,
                table_count: row.try_get("table_count")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
