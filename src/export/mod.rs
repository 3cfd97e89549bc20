//! Reads one tenant's rows (or every row, for the system scope) from the
//! export allowlist into a [`BackupDocument`].

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::ExportTable;
use crate::db::sql::{Predicate, Statement};
use crate::db::TxHandle;
use crate::error::LifecycleResult;
use crate::schema::{SchemaCapabilities, TableInfo};

pub mod document;

pub use document::{BackupDocument, Scope, TableSnapshot, FORMAT_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub document: BackupDocument,
    /// Every allowlisted table, in allowlist order.
    pub attempted: Vec<String>,
    pub skipped_missing: Vec<String>,
    pub failed: Vec<TableFailure>,
}

/// Which rows of `table` belong to `scope`.
pub fn scope_predicate(
    caps: &SchemaCapabilities,
    entry: &ExportTable,
    table: &TableInfo,
    tenant_column: &str,
    scope: Scope,
) -> Predicate {
    let Scope::Company(company_id) = scope else {
        return Predicate::All;
    };
    if let Some(col) = table.column(tenant_column) {
        return Predicate::eq(col.name.clone(), company_id);
    }
    if let Some(link) = &entry.parent {
        let parent_scoped = caps
            .table(&link.parent_table)
            .and_then(|parent| parent.column(tenant_column))
            .map(|col| col.name.clone());
        if let (true, Some(parent_tenant)) = (table.has_column(&link.column), parent_scoped) {
            return Predicate::InParent {
                column: link.column.clone(),
                parent_table: link.parent_table.clone(),
                parent_column: link.parent_column.clone(),
                filter: Box::new(Predicate::eq(parent_tenant, company_id)),
            };
        }
    }
    warn!(
        target: "tenant_lifecycle",
        event = "export_unscoped_table",
        table = %table.name,
        company_id
    );
    Predicate::All
}

pub async fn export(
    pool: &SqlitePool,
    caps: &SchemaCapabilities,
    tables: &[ExportTable],
    tenant_column: &str,
    scope: Scope,
) -> LifecycleResult<ExportOutcome> {
    let mut tx = TxHandle::begin_read(pool).await?;
    let mut outcome = ExportOutcome {
        document: BackupDocument::new(scope),
        attempted: Vec::with_capacity(tables.len()),
        skipped_missing: Vec::new(),
        failed: Vec::new(),
    };

    for entry in tables {
        outcome.attempted.push(entry.name.clone());
        let Some(info) = caps.table(&entry.name) else {
            info!(target: "tenant_lifecycle", event = "export_table_missing", table = %entry.name);
            outcome.skipped_missing.push(entry.name.clone());
            continue;
        };

        let predicate = scope_predicate(caps, entry, info, tenant_column, scope);
        let order = info.single_primary_key().map(|pk| pk.name.as_str());
        let stmt = Statement::select(&info.name, &predicate, order);
        match stmt.fetch_rows(tx.conn()).await {
            Ok(rows) if rows.is_empty() => {
                info!(target: "tenant_lifecycle", event = "export_table_empty", table = %info.name);
            }
            Ok(rows) => {
                info!(
                    target: "tenant_lifecycle",
                    event = "export_table",
                    table = %info.name,
                    rows = rows.len()
                );
                outcome.document.push(TableSnapshot::new(info.name.clone(), rows));
            }
            Err(err) => {
                warn!(
                    target: "tenant_lifecycle",
                    event = "export_table_failed",
                    table = %info.name,
                    error = %err
                );
                outcome.failed.push(TableFailure {
                    table: info.name.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    // Read-only; committing just releases the snapshot.
    tx.commit().await?;
    info!(
        target: "tenant_lifecycle",
        event = "export_complete",
        scope = %scope,
        tables = outcome.document.tables.len(),
        records = outcome.document.record_count(),
        failed = outcome.failed.len()
    );
    Ok(outcome)
}
