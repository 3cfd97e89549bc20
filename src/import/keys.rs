//! Keeps a restore away from rows owned by other companies.
//!
//! A backup taken from one company and restored into another carries
//! primary keys that may already belong to someone else in production.
//! Those staged rows move to fresh integer keys above both key ranges, and
//! declared foreign keys of every staged table are rewritten to follow them.

use sqlx::{Row as _, SqliteConnection};
use tracing::warn;
use uuid::Uuid;

use super::staging::StagedTable;
use crate::db::quote_ident;
use crate::error::{LifecycleError, LifecycleResult, Phase};
use crate::schema::{SchemaCapabilities, TableShape};

/// Keys named in a conflict error.
const REPORTED_KEYS: i64 = 5;

/// A single-column declared foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// How production rows of a staged table are attributed to a company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Column(String),
    /// Through a foreign key into a table carrying the tenant column.
    Parent {
        column: String,
        parent_table: String,
        parent_column: String,
        tenant_column: String,
    },
}

/// Staged keys of one table moved away from another company's rows.
#[derive(Debug, Clone)]
pub struct KeyRemap {
    pub table: String,
    pub key_column: String,
    /// TEMP table of `(old_key, new_key)` pairs.
    pub map_table: String,
    pub moved: u64,
}

pub async fn foreign_keys(
    conn: &mut SqliteConnection,
    caps: &SchemaCapabilities,
    table: &str,
) -> Result<Vec<ForeignKey>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, seq, \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    let mut composite = Vec::new();
    for row in &rows {
        let seq: i64 = row.try_get("seq")?;
        if seq > 0 {
            composite.push(row.try_get::<i64, _>("id")?);
        }
    }

    let mut keys = Vec::new();
    for row in rows {
        let id: i64 = row.try_get("id")?;
        if composite.contains(&id) {
            continue;
        }
        let parent_table: String = row.try_get("table")?;
        let to: Option<String> = row.try_get("to")?;
        let parent_column = match to {
            Some(column) => column,
            None => match caps.table(&parent_table).and_then(|t| t.single_primary_key()) {
                Some(pk) => pk.name.clone(),
                None => continue,
            },
        };
        keys.push(ForeignKey {
            column: row.try_get("from")?,
            parent_table,
            parent_column,
        });
    }
    Ok(keys)
}

/// `None` when production rows of the table cannot be attributed, e.g. a
/// whole-table merge or a keyed table without a tenant-scoped parent.
pub fn owner(
    caps: &SchemaCapabilities,
    staged: &StagedTable,
    references: &[ForeignKey],
    tenant_column: &str,
) -> Option<Owner> {
    match &staged.shape {
        TableShape::TenantScoped { column } => Some(Owner::Column(column.clone())),
        TableShape::Keyed { .. } => references.iter().find_map(|fk| {
            let parent = caps.table(&fk.parent_table)?;
            let tenant = parent.column(tenant_column)?;
            Some(Owner::Parent {
                column: fk.column.clone(),
                parent_table: parent.name.clone(),
                parent_column: fk.parent_column.clone(),
                tenant_column: tenant.name.clone(),
            })
        }),
        TableShape::WholeTable | TableShape::Unmergeable => None,
    }
}

/// Staged keys that production already holds for a company other than
/// `company_id` (bound as the single parameter).
fn conflict_select(staged: &StagedTable, key: &str, owner: &Owner) -> String {
    let stg = format!("temp.{}", quote_ident(&staged.staging));
    let table = quote_ident(&staged.table.name);
    let key = quote_ident(key);
    let owned_elsewhere = match owner {
        Owner::Column(tenant) => format!(
            "SELECT p.{key} FROM {table} p WHERE p.{} IS NOT ?",
            quote_ident(tenant)
        ),
        Owner::Parent {
            column,
            parent_table,
            parent_column,
            tenant_column,
        } => format!(
            "SELECT p.{key} FROM {table} p JOIN {} q ON q.{} = p.{} WHERE q.{} IS NOT ?",
            quote_ident(parent_table),
            quote_ident(parent_column),
            quote_ident(column),
            quote_ident(tenant_column)
        ),
    };
    format!("SELECT DISTINCT s.{key} AS old_key FROM {stg} s WHERE s.{key} IN ({owned_elsewhere})")
}

/// Move staged keys owned by another company to fresh keys. Keys that are
/// not integers cannot be moved and fail the merge of the table.
pub async fn remap_conflicts(
    conn: &mut SqliteConnection,
    staged: &StagedTable,
    owner: &Owner,
    company_id: i64,
) -> LifecycleResult<Option<KeyRemap>> {
    let name = staged.table.name.as_str();
    let merge_err = |err: sqlx::Error| LifecycleError::structural(name, Phase::Merge, err);
    let Some(pk) = staged.table.single_primary_key() else {
        return Ok(None);
    };
    if !staged.columns.iter().any(|c| c.eq_ignore_ascii_case(&pk.name)) {
        return Ok(None);
    }

    let conflicts = conflict_select(staged, &pk.name, owner);
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM ({conflicts})"))
        .bind(company_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(merge_err)?;
    if count == 0 {
        return Ok(None);
    }

    if !pk.declared_type.to_ascii_uppercase().contains("INT") {
        let keys: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT CAST(old_key AS TEXT) FROM ({conflicts}) ORDER BY old_key LIMIT {REPORTED_KEYS}"
        ))
        .bind(company_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(merge_err)?;
        return Err(LifecycleError::structural(
            name,
            Phase::Merge,
            format!(
                "{count} {} keys belong to another company: {}",
                pk.name,
                keys.join(", ")
            ),
        ));
    }

    let uid = Uuid::new_v4().simple().to_string();
    let map_table = format!("{name}_keymap_{}", &uid[..12]);
    let map = format!("temp.{}", quote_ident(&map_table));
    let key = quote_ident(&pk.name);
    let stg = format!("temp.{}", quote_ident(&staged.staging));

    sqlx::query(&format!(
        "CREATE TEMP TABLE {} (old_key INTEGER PRIMARY KEY, new_key INTEGER NOT NULL)",
        quote_ident(&map_table)
    ))
    .execute(&mut *conn)
    .await
    .map_err(merge_err)?;

    let base: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(MAX(m), 0) FROM (SELECT MAX({key}) AS m FROM {} UNION ALL SELECT MAX({key}) FROM {stg})",
        quote_ident(name)
    ))
    .fetch_one(&mut *conn)
    .await
    .map_err(merge_err)?;

    let moved = sqlx::query(&format!(
        "INSERT INTO {map} (old_key, new_key) \
         SELECT old_key, ? + ROW_NUMBER() OVER (ORDER BY old_key) FROM ({conflicts})"
    ))
    .bind(base)
    .bind(company_id)
    .execute(&mut *conn)
    .await
    .map_err(merge_err)?
    .rows_affected();

    sqlx::query(&follow_statement(&staged.staging, &pk.name, &map_table))
        .execute(&mut *conn)
        .await
        .map_err(merge_err)?;

    warn!(
        target: "tenant_lifecycle",
        event = "import_keys_remapped",
        table = %name,
        column = %pk.name,
        rows = moved,
        first_new_key = base + 1
    );
    Ok(Some(KeyRemap {
        table: name.to_string(),
        key_column: pk.name.clone(),
        map_table,
        moved,
    }))
}

/// Rewrites `column` of a staging table through a key map.
pub fn follow_statement(staging: &str, column: &str, map_table: &str) -> String {
    let stg = quote_ident(staging);
    let col = quote_ident(column);
    let map = quote_ident(map_table);
    format!(
        "UPDATE temp.{stg} SET {col} = (SELECT m.new_key FROM temp.{map} m WHERE m.old_key = {stg}.{col}) \
         WHERE {col} IN (SELECT old_key FROM temp.{map})"
    )
}

/// Point declared references of `staged` at the moved parent keys. Returns
/// the number of rewritten values.
pub async fn follow_remaps(
    conn: &mut SqliteConnection,
    staged: &StagedTable,
    references: &[ForeignKey],
    remaps: &[KeyRemap],
) -> Result<u64, sqlx::Error> {
    let mut rewritten = 0;
    for fk in references {
        if !staged.columns.iter().any(|c| c.eq_ignore_ascii_case(&fk.column)) {
            continue;
        }
        let Some(remap) = remaps.iter().find(|r| {
            r.table.eq_ignore_ascii_case(&fk.parent_table)
                && r.key_column.eq_ignore_ascii_case(&fk.parent_column)
        }) else {
            continue;
        };
        rewritten += sqlx::query(&follow_statement(&staged.staging, &fk.column, &remap.map_table))
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(rewritten)
}

pub async fn drop_map(conn: &mut SqliteConnection, remap: &KeyRemap) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DROP TABLE IF EXISTS temp.{}", quote_ident(&remap.map_table)))
        .execute(&mut *conn)
        .await?;
    Ok(())
}
