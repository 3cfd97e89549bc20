use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::staging::StagedTable;
use crate::db::quote_ident;
use crate::db::sql::{Predicate, Statement};
use crate::schema::{TableInfo, TableShape};

/// Column names that point at a user row without a declared foreign key.
static SOFT_USER_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(user_id|.+_user_id|created_by|updated_by|deleted_by)$").unwrap()
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableMergeSummary {
    pub staged: u64,
    pub merged: u64,
    /// Staged rows that lost a key conflict.
    pub skipped: u64,
    /// Staged rows given a fresh key because another company owns theirs.
    pub remapped: u64,
    /// Rows dropped because a required user reference was dangling.
    pub rejected: u64,
    pub nulled_references: u64,
}

pub fn is_soft_user_reference(column: &str) -> bool {
    SOFT_USER_REFERENCE.is_match(column)
}

/// Moves one staged table into production. `users` is the live users table
/// when it exists with an `id` column; without it soft references are left
/// as they are.
pub async fn merge_table(
    conn: &mut SqliteConnection,
    staged: &StagedTable,
    company_id: i64,
    users: Option<&TableInfo>,
) -> Result<TableMergeSummary, sqlx::Error> {
    let mut summary = TableMergeSummary {
        staged: staged.staged_rows,
        ..Default::default()
    };

    if let Some(users) = users.filter(|u| !u.name.eq_ignore_ascii_case(&staged.table.name)) {
        let (nulled, rejected) = settle_soft_references(conn, staged, users).await?;
        summary.nulled_references = nulled;
        summary.rejected = rejected;
    }

    let replaced = replace_statement(staged, company_id).execute(&mut *conn).await?;
    summary.merged = copy_statement(staged).execute(&mut *conn).await?;
    summary.skipped = (summary.staged - summary.rejected).saturating_sub(summary.merged);

    info!(
        target: "tenant_lifecycle",
        event = "import_table_merged",
        table = %staged.table.name,
        shape = staged.shape.label(),
        replaced,
        staged = summary.staged,
        merged = summary.merged,
        skipped = summary.skipped,
        rejected = summary.rejected,
        nulled_references = summary.nulled_references
    );
    Ok(summary)
}

/// Null dangling references in nullable columns; drop rows whose required
/// reference dangles. Returns `(nulled, rejected)`.
async fn settle_soft_references(
    conn: &mut SqliteConnection,
    staged: &StagedTable,
    users: &TableInfo,
) -> Result<(u64, u64), sqlx::Error> {
    let stg = format!("temp.{}", quote_ident(&staged.staging));
    let users_name = quote_ident(&users.name);
    let mut nulled = 0;
    let mut rejected = 0;

    for column in staged.columns.iter().filter(|c| is_soft_user_reference(c)) {
        let col = quote_ident(column);
        let dangling = format!(
            "NOT EXISTS (SELECT 1 FROM {users_name} WHERE {users_name}.\"id\" = {stg}.{col})"
        );
        let required = staged.table.column(column).is_some_and(|c| c.not_null);
        if required {
            let sql = format!("DELETE FROM {stg} WHERE {col} IS NULL OR {dangling}");
            let removed = sqlx::query(&sql).execute(&mut *conn).await?.rows_affected();
            rejected += removed;
            if removed > 0 {
                debug!(target: "tenant_lifecycle", event = "import_rows_rejected", table = %staged.table.name, column = %column, rows = removed);
            }
        } else {
            let sql = format!("UPDATE {stg} SET {col} = NULL WHERE {col} IS NOT NULL AND {dangling}");
            let changed = sqlx::query(&sql).execute(&mut *conn).await?.rows_affected();
            nulled += changed;
            if changed > 0 {
                debug!(target: "tenant_lifecycle", event = "import_references_nulled", table = %staged.table.name, column = %column, rows = changed);
            }
        }
    }
    Ok((nulled, rejected))
}

/// Deletes the production rows the staged rows replace.
pub fn replace_statement(staged: &StagedTable, company_id: i64) -> Statement {
    let table = &staged.table.name;
    match &staged.shape {
        TableShape::TenantScoped { column } => {
            Statement::delete(table, &Predicate::eq(column.clone(), company_id))
        }
        TableShape::Keyed { column } => Statement::delete(
            table,
            &Predicate::InTable {
                column: column.clone(),
                table: staged.staging.clone(),
            },
        ),
        TableShape::WholeTable | TableShape::Unmergeable => Statement::delete(table, &Predicate::All),
    }
}

/// Copies staging into production: upsert on a single-column primary key,
/// insert-or-ignore otherwise. A tenant-scoped upsert only overwrites rows
/// that already belong to the same tenant; keys owned elsewhere have been
/// moved by then.
pub fn copy_statement(staged: &StagedTable) -> Statement {
    let table = quote_ident(&staged.table.name);
    let columns = staged
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let source = format!("SELECT {columns} FROM temp.{}", quote_ident(&staged.staging));

    let Some(pk) = staged.table.single_primary_key() else {
        return Statement::raw(format!("INSERT OR IGNORE INTO {table} ({columns}) {source}"));
    };

    let updates = staged
        .columns
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(&pk.name))
        .map(|c| format!("{col} = excluded.{col}", col = quote_ident(c)))
        .collect::<Vec<_>>();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let mut clause = format!("DO UPDATE SET {}", updates.join(", "));
        if let TableShape::TenantScoped { column } = &staged.shape {
            let tenant = quote_ident(column);
            clause.push_str(&format!(" WHERE {table}.{tenant} = excluded.{tenant}"));
        }
        clause
    };
    // `WHERE true` keeps the upsert clause from parsing as a join constraint.
    Statement::raw(format!(
        "INSERT INTO {table} ({columns}) {source} WHERE true ON CONFLICT({}) {conflict}",
        quote_ident(&pk.name)
    ))
}
