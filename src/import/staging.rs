use std::collections::BTreeSet;

use sqlx::SqliteConnection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::quote_ident;
use crate::export::TableSnapshot;
use crate::schema::{TableInfo, TableShape};
use crate::value::{bind_scalar, Scalar};

/// Upper bound on bound parameters per multi-row INSERT.
const MAX_BINDS_PER_STATEMENT: usize = 900;

/// A production table paired with the staging clone holding its rows.
#[derive(Debug, Clone)]
pub struct StagedTable {
    pub table: TableInfo,
    pub shape: TableShape,
    pub staging: String,
    /// Production column names loaded into the staging table.
    pub columns: Vec<String>,
    pub staged_rows: u64,
}

pub fn staging_name(table: &str) -> String {
    let uid = Uuid::new_v4().simple().to_string();
    format!("{table}_staging_{}", &uid[..12])
}

/// Column names and declared types only: no keys, defaults, checks or references.
pub fn staging_ddl(table: &TableInfo, staging: &str) -> String {
    let columns = table
        .columns
        .iter()
        .map(|col| {
            let ty = col.declared_type.trim();
            if ty.is_empty() {
                quote_ident(&col.name)
            } else {
                format!("{} {ty}", quote_ident(&col.name))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TEMP TABLE {} ({columns})", quote_ident(staging))
}

pub async fn create_staging(
    conn: &mut SqliteConnection,
    table: &TableInfo,
) -> Result<String, sqlx::Error> {
    let staging = staging_name(&table.name);
    sqlx::query(&staging_ddl(table, &staging))
        .execute(&mut *conn)
        .await?;
    info!(target: "tenant_lifecycle", event = "staging_created", table = %table.name, staging = %staging);
    Ok(staging)
}

pub async fn drop_staging(conn: &mut SqliteConnection, staging: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DROP TABLE IF EXISTS temp.{}", quote_ident(staging)))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Which production columns get loaded, in production order. Snapshot
/// columns unknown to production are dropped; the tenant column is always
/// loaded so it can be forced to the target company.
pub fn load_columns(table: &TableInfo, shape: &TableShape, snapshot: &TableSnapshot) -> Vec<String> {
    let snapshot_cols: BTreeSet<String> = snapshot
        .columns()
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let tenant = match shape {
        TableShape::TenantScoped { column } => Some(column.as_str()),
        _ => None,
    };

    let dropped: Vec<&str> = snapshot
        .columns()
        .into_iter()
        .filter(|c| !table.has_column(c))
        .collect();
    if !dropped.is_empty() {
        warn!(
            target: "tenant_lifecycle",
            event = "staging_columns_dropped",
            table = %table.name,
            columns = %dropped.join(",")
        );
    }

    table
        .columns
        .iter()
        .filter(|col| {
            snapshot_cols.contains(&col.name.to_ascii_lowercase())
                || tenant.is_some_and(|t| t.eq_ignore_ascii_case(&col.name))
        })
        .map(|col| col.name.clone())
        .collect()
}

/// Bulk-load `snapshot` into `staging`, overwriting the tenant column with
/// `company_id`. Returns the row count of the staging table afterwards.
pub async fn load_rows(
    conn: &mut SqliteConnection,
    staging: &str,
    columns: &[String],
    shape: &TableShape,
    snapshot: &TableSnapshot,
    company_id: i64,
) -> Result<u64, sqlx::Error> {
    if columns.is_empty() || snapshot.rows.is_empty() {
        return Ok(0);
    }
    let tenant = match shape {
        TableShape::TenantScoped { column } => Some(column.as_str()),
        _ => None,
    };
    let forced = Scalar::Int(company_id);
    let null = Scalar::Null;
    let rows_per_chunk = (MAX_BINDS_PER_STATEMENT / columns.len()).max(1);
    let column_sql = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));

    for chunk in snapshot.rows.chunks(rows_per_chunk) {
        let sql = format!(
            "INSERT INTO temp.{} ({column_sql}) VALUES {}",
            quote_ident(staging),
            vec![placeholders.as_str(); chunk.len()].join(", ")
        );
        let mut query = sqlx::query(&sql);
        for row in chunk {
            for column in columns {
                let value = if tenant.is_some_and(|t| t.eq_ignore_ascii_case(column)) {
                    &forced
                } else {
                    row.get(column)
                        .or_else(|| {
                            row.iter()
                                .find(|(k, _)| k.eq_ignore_ascii_case(column))
                                .map(|(_, v)| v)
                        })
                        .unwrap_or(&null)
                };
                query = bind_scalar(query, value);
            }
        }
        query.execute(&mut *conn).await?;
    }

    staged_count(conn, staging).await
}

pub async fn staged_count(conn: &mut SqliteConnection, staging: &str) -> Result<u64, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM temp.{}", quote_ident(staging)))
        .fetch_one(conn)
        .await?;
    Ok(count.max(0) as u64)
}
