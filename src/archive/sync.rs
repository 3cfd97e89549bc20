use std::path::Path;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::{unpack, write_artifact, ARCHIVE_FORMAT, FILE_PREFIX};
use crate::catalog::{self, NewBackup};
use crate::collab::{ObjectStore, SideChannelExt};
use crate::error::LifecycleResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub listed: usize,
    pub downloaded: Vec<String>,
    pub failed: Vec<String>,
}

/// Pull remote archives the local catalog does not know about. Storage
/// failures are recorded in the report; only catalog writes can fail the call.
pub async fn sync_remote(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    backup_dir: &Path,
) -> LifecycleResult<SyncReport> {
    let mut report = SyncReport::default();
    let Some(objects) = store.list(FILE_PREFIX).await.log_failure("list_remote_backups") else {
        return Ok(report);
    };
    report.listed = objects.len();

    for object in objects {
        if catalog::find_by_file_name(pool, &object.id).await?.is_some() {
            continue;
        }
        let Some(bytes) = store
            .download(&object.id)
            .await
            .log_failure("download_remote_backup")
        else {
            report.failed.push(object.id.clone());
            continue;
        };
        let (document, _) = match unpack(&bytes) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(
                    target: "tenant_lifecycle",
                    event = "remote_backup_invalid",
                    object = %object.id,
                    error = %err
                );
                report.failed.push(object.id.clone());
                continue;
            }
        };

        let size = bytes.len() as u64;
        write_artifact(backup_dir, &object.id, bytes).await?;
        let pending = catalog::insert_pending(
            pool,
            &NewBackup {
                scope: document.scope,
                file_name: object.id.clone(),
                storage_location: backup_dir.display().to_string(),
                format: ARCHIVE_FORMAT.to_string(),
                created_by: None,
                created_at: Some(document.exported_at.timestamp_millis()),
            },
        )
        .await?;
        catalog::mark_completed(pool, &pending.id, size, document.record_count()).await?;
        catalog::attach_remote_url(pool, &pending.id, &object.url).await?;
        info!(target: "tenant_lifecycle", event = "remote_backup_synced", object = %object.id);
        report.downloaded.push(object.id);
    }
    Ok(report)
}
