//! Restores a backup into one company through constraint-free staging
//! tables, all inside a single transaction.

use std::path::Path;
use std::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info, warn};

use crate::archive;
use crate::catalog::{self, BackupStatus};
use crate::collab::{AuditEvent, Collaborators, SideChannelExt};
use crate::config::LifecycleConfig;
use crate::db::{IntegrityMode, TxHandle, TxTarget};
use crate::error::{LifecycleError, LifecycleResult, Phase};
use crate::export::{BackupDocument, Scope};
use crate::schema::{SchemaCapabilities, TableInfo, TableShape};

pub mod keys;
pub mod merge;
pub mod staging;

pub use keys::KeyRemap;
pub use merge::{is_soft_user_reference, TableMergeSummary};
pub use staging::StagedTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub valid: bool,
    pub validate_only: bool,
    pub company_id: i64,
    pub record_count: u64,
    /// Tables of the document, in document order.
    pub tables: Vec<String>,
    /// Empty for a validate-only run.
    pub merged: IndexMap<String, TableMergeSummary>,
}

/// A document table resolved against the live schema.
#[derive(Debug, Clone)]
pub struct PlannedTable {
    pub table: TableInfo,
    pub shape: TableShape,
}

/// Everything that can be rejected before a transaction is opened.
pub fn validate(
    caps: &SchemaCapabilities,
    config: &LifecycleConfig,
    document: &BackupDocument,
) -> LifecycleResult<Vec<PlannedTable>> {
    if document.tables.is_empty() {
        return Err(LifecycleError::Validation("backup has no tables".into()));
    }
    if document.record_count() == 0 {
        return Err(LifecycleError::EmptyBackup);
    }
    if document.scope == Scope::System {
        return Err(LifecycleError::Validation(
            "a system backup cannot be imported into a single company".into(),
        ));
    }

    let mut planned = Vec::with_capacity(document.tables.len());
    for name in document.tables.keys() {
        if !config
            .import_tables
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(name))
        {
            return Err(LifecycleError::Validation(format!(
                "table {name} is not importable"
            )));
        }
        let Some(info) = caps.table(name) else {
            return Err(LifecycleError::structural(
                name.as_str(),
                Phase::Validate,
                "table does not exist in this database",
            ));
        };
        let shape = TableShape::classify(info, &config.tenant_column, &config.whole_table);
        if shape == TableShape::Unmergeable {
            return Err(LifecycleError::structural(
                name.as_str(),
                Phase::Validate,
                "no tenant column, no single-column primary key and not allowlisted for whole-table replacement",
            ));
        }
        planned.push(PlannedTable {
            table: info.clone(),
            shape,
        });
    }
    Ok(planned)
}

/// Unpack `archive` and import it into `company_id`.
pub async fn import(
    target: TxTarget<'_>,
    caps: &SchemaCapabilities,
    config: &LifecycleConfig,
    company_id: i64,
    archive_bytes: &[u8],
    validate_only: bool,
) -> LifecycleResult<ImportOutcome> {
    let (document, _) = archive::unpack(archive_bytes)?;
    import_document(target, caps, config, company_id, &document, validate_only).await
}

pub async fn import_document(
    target: TxTarget<'_>,
    caps: &SchemaCapabilities,
    config: &LifecycleConfig,
    company_id: i64,
    document: &BackupDocument,
    validate_only: bool,
) -> LifecycleResult<ImportOutcome> {
    let planned = validate(caps, config, document)?;
    let record_count = document.record_count();
    info!(
        target: "tenant_lifecycle",
        event = "import_validated",
        company_id,
        records = record_count,
        tables = planned.len(),
        validate_only
    );

    let users = caps
        .table(&config.users_table)
        .filter(|users| users.has_column("id"));

    let mut tx = TxHandle::open(target, IntegrityMode::Relaxed).await?;
    let mut staged = Vec::with_capacity(planned.len());
    let mut remaps = Vec::new();
    let result = run(
        tx.conn(),
        &Merge {
            caps,
            tenant_column: &config.tenant_column,
            company_id,
            validate_only,
            users,
        },
        &planned,
        document,
        &mut staged,
        &mut remaps,
    )
    .await;
    let result = match result {
        Ok(merged) if !validate_only => check_deferred_references(&mut tx).await.map(|()| merged),
        other => other,
    };
    let cleanup = drop_all(tx.conn(), &staged, &remaps).await;

    let merged = match (result, cleanup) {
        (Ok(merged), Ok(())) => merged,
        (Err(err), _) | (Ok(_), Err(err)) => {
            error!(
                target: "tenant_lifecycle",
                event = "import_failed",
                company_id,
                error = %err
            );
            if let Err(rb) = tx.rollback().await {
                error!(target: "tenant_lifecycle", event = "import_rollback_failed", error = %rb);
            }
            return Err(err);
        }
    };

    if validate_only {
        tx.rollback().await?;
    } else {
        tx.commit().await?;
    }
    info!(
        target: "tenant_lifecycle",
        event = "import_complete",
        company_id,
        records = record_count,
        validate_only
    );
    Ok(ImportOutcome {
        valid: true,
        validate_only,
        company_id,
        record_count,
        tables: document.table_names(),
        merged,
    })
}

/// Settings shared by every table of one import.
struct Merge<'a> {
    caps: &'a SchemaCapabilities,
    tenant_column: &'a str,
    company_id: i64,
    validate_only: bool,
    users: Option<&'a TableInfo>,
}

async fn run(
    conn: &mut SqliteConnection,
    ctx: &Merge<'_>,
    planned: &[PlannedTable],
    document: &BackupDocument,
    staged: &mut Vec<StagedTable>,
    remaps: &mut Vec<KeyRemap>,
) -> LifecycleResult<IndexMap<String, TableMergeSummary>> {
    for (plan, snapshot) in planned.iter().zip(document.tables.values()) {
        let name = plan.table.name.as_str();
        let stage_err = |err: sqlx::Error| LifecycleError::structural(name, Phase::Stage, err);

        let staging_table = staging::create_staging(conn, &plan.table)
            .await
            .map_err(stage_err)?;
        let columns = staging::load_columns(&plan.table, &plan.shape, snapshot);
        staged.push(StagedTable {
            table: plan.table.clone(),
            shape: plan.shape.clone(),
            staging: staging_table,
            columns,
            staged_rows: 0,
        });
        let Some(entry) = staged.last_mut() else {
            continue;
        };
        entry.staged_rows = staging::load_rows(
            conn,
            &entry.staging,
            &entry.columns,
            &entry.shape,
            snapshot,
            ctx.company_id,
        )
        .await
        .map_err(stage_err)?;
        if entry.staged_rows == 0 && !snapshot.rows.is_empty() {
            return Err(LifecycleError::structural(
                name,
                Phase::Stage,
                format!("staging table is empty but the backup holds {} rows", snapshot.rows.len()),
            ));
        }
    }

    let mut merged = IndexMap::new();
    if ctx.validate_only {
        return Ok(merged);
    }

    // Keys are settled against production as it was before any table merges.
    let mut references = Vec::with_capacity(staged.len());
    for entry in staged.iter() {
        let name = entry.table.name.as_str();
        let fks = keys::foreign_keys(conn, ctx.caps, name)
            .await
            .map_err(|err| LifecycleError::structural(name, Phase::Merge, err))?;
        if let Some(owner) = keys::owner(ctx.caps, entry, &fks, ctx.tenant_column) {
            if let Some(remap) = keys::remap_conflicts(conn, entry, &owner, ctx.company_id).await? {
                remaps.push(remap);
            }
        }
        references.push(fks);
    }
    if !remaps.is_empty() {
        for (entry, fks) in staged.iter().zip(&references) {
            keys::follow_remaps(conn, entry, fks, remaps.as_slice())
                .await
                .map_err(|err| LifecycleError::structural(entry.table.name.as_str(), Phase::Merge, err))?;
        }
    }

    for entry in staged.iter() {
        let mut summary = merge::merge_table(conn, entry, ctx.company_id, ctx.users)
            .await
            .map_err(|err| LifecycleError::structural(entry.table.name.as_str(), Phase::Merge, err))?;
        summary.remapped = remaps
            .iter()
            .find(|r| r.table == entry.table.name)
            .map_or(0, |r| r.moved);
        merged.insert(entry.table.name.clone(), summary);
    }
    Ok(merged)
}

/// Inside a caller's transaction foreign keys are only checked at the
/// caller's commit; refuse rows that commit would reject.
async fn check_deferred_references(tx: &mut TxHandle<'_>) -> LifecycleResult<()> {
    let violations = tx.deferred_violations().await?;
    let Some(first) = violations.first() else {
        return Ok(());
    };
    let rows = violations
        .iter()
        .filter(|v| v.table == first.table && v.parent == first.parent)
        .count();
    Err(LifecycleError::structural(
        first.table.as_str(),
        Phase::Merge,
        format!("{rows} rows reference missing {} rows", first.parent),
    ))
}

/// Drop every staging and key map table, attempting all of them; reports
/// the first failure.
async fn drop_all(
    conn: &mut SqliteConnection,
    staged: &[StagedTable],
    remaps: &[KeyRemap],
) -> LifecycleResult<()> {
    let mut first = None;
    for entry in staged {
        if let Err(err) = staging::drop_staging(conn, &entry.staging).await {
            warn!(
                target: "tenant_lifecycle",
                event = "staging_drop_failed",
                staging = %entry.staging,
                error = %err
            );
            first.get_or_insert_with(|| {
                LifecycleError::structural(entry.table.name.as_str(), Phase::Cleanup, err)
            });
        }
    }
    for remap in remaps {
        if let Err(err) = keys::drop_map(conn, remap).await {
            warn!(
                target: "tenant_lifecycle",
                event = "staging_drop_failed",
                staging = %remap.map_table,
                error = %err
            );
            first.get_or_insert_with(|| {
                LifecycleError::structural(remap.table.as_str(), Phase::Cleanup, err)
            });
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Import an archive in its own transaction and report the result to the
/// audit collaborator.
pub async fn restore(
    pool: &SqlitePool,
    caps: &SchemaCapabilities,
    config: &LifecycleConfig,
    collab: &Collaborators,
    company_id: i64,
    archive_bytes: &[u8],
    validate_only: bool,
) -> LifecycleResult<ImportOutcome> {
    let started = Instant::now();
    let result = import(
        TxTarget::Pool(pool),
        caps,
        config,
        company_id,
        archive_bytes,
        validate_only,
    )
    .await;

    let details = match &result {
        Ok(outcome) => json!({
            "validate_only": outcome.validate_only,
            "record_count": outcome.record_count,
            "tables": outcome.tables,
            "duration_ms": started.elapsed().as_millis() as u64,
        }),
        Err(err) => json!({
            "validate_only": validate_only,
            "code": err.code(),
            "error": err.to_string(),
        }),
    };
    let event = AuditEvent {
        scope: Scope::Company(company_id),
        operation: "restore".into(),
        success: result.is_ok(),
        details,
    };
    collab.audit.record(&event).await.log_failure("audit_restore");
    result
}

/// Restore a catalogued backup read from its storage location.
pub async fn restore_backup(
    pool: &SqlitePool,
    caps: &SchemaCapabilities,
    config: &LifecycleConfig,
    collab: &Collaborators,
    backup_id: &str,
    company_id: i64,
    validate_only: bool,
) -> LifecycleResult<ImportOutcome> {
    let record = catalog::get(pool, backup_id)
        .await?
        .filter(|record| record.status == BackupStatus::Completed)
        .ok_or_else(|| {
            LifecycleError::Validation(format!("backup {backup_id} is not a completed backup"))
        })?;
    let path = Path::new(&record.storage_location).join(&record.file_name);
    let bytes = tokio::task::spawn_blocking(move || std::fs::read(path))
        .await
        .map_err(|err| LifecycleError::Archive(format!("read task failed: {err}")))??;
    restore(pool, caps, config, collab, company_id, &bytes, validate_only).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::TableSnapshot;
    use crate::schema::ColumnInfo;
    use crate::value::{Row, Scalar};

    fn caps() -> SchemaCapabilities {
        SchemaCapabilities::from_tables([
            TableInfo {
                name: "products".into(),
                columns: vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("company_id", "INTEGER"),
                ],
            },
            TableInfo {
                name: "sms_logs".into(),
                columns: vec![ColumnInfo::new("body", "TEXT")],
            },
        ])
    }

    fn doc(table: &str, rows: usize) -> BackupDocument {
        let mut doc = BackupDocument::new(Scope::Company(42));
        let row: Row = [("id".to_string(), Scalar::Int(1))].into_iter().collect();
        doc.push(TableSnapshot::new(table, vec![row; rows]));
        doc
    }

    fn config() -> LifecycleConfig {
        LifecycleConfig::for_paths(Path::new("/tmp/db"), Path::new("/tmp/backups"))
    }

    #[test]
    fn validation_rejects_before_mutation() {
        let caps = caps();
        let config = config();
        assert!(matches!(
            validate(&caps, &config, &BackupDocument::new(Scope::Company(1))),
            Err(LifecycleError::Validation(_))
        ));
        assert!(matches!(
            validate(&caps, &config, &doc("products", 0)),
            Err(LifecycleError::EmptyBackup)
        ));
        assert!(matches!(
            validate(&caps, &config, &doc("users", 1)),
            Err(LifecycleError::Validation(_))
        ));
        assert!(matches!(
            validate(&caps, &config, &doc("customers", 1)),
            Err(LifecycleError::Structural { phase: Phase::Validate, .. })
        ));
        assert!(matches!(
            validate(&caps, &config, &doc("sms_logs", 1)),
            Err(LifecycleError::Structural { phase: Phase::Validate, .. })
        ));
        let mut system = doc("products", 1);
        system.scope = Scope::System;
        assert!(matches!(
            validate(&caps, &config, &system),
            Err(LifecycleError::Validation(_))
        ));
    }

    #[test]
    fn whole_table_allowlist_makes_keyless_tables_mergeable() {
        let caps = caps();
        let mut config = config();
        config.whole_table.push("sms_logs".into());
        let planned = validate(&caps, &config, &doc("sms_logs", 2)).unwrap();
        assert_eq!(planned[0].shape, TableShape::WholeTable);
    }
}
