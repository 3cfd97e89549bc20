//! Packs a [`BackupDocument`] into a zip artifact, writes it to the backup
//! directory and keeps its `backup_records` entry in step.

use std::env;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::available_space;
use sqlx::SqlitePool;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::catalog::{self, BackupRecord, NewBackup};
use crate::collab::{Collaborators, SideChannelExt};
use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::export::{self, BackupDocument, ExportOutcome, Scope};
use crate::schema::SchemaCapabilities;

pub mod manifest;
mod sync;

pub use manifest::{sha256_hex, ArchiveManifest};
pub use sync::{sync_remote, SyncReport};

pub const DOCUMENT_ENTRY: &str = "document.json";
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const MANIFEST_TEXT_ENTRY: &str = "MANIFEST.txt";
pub const ARCHIVE_FORMAT: &str = "zip/json";
pub const FILE_PREFIX: &str = "backup_";

const PARTIAL_SUFFIX: &str = ".partial";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const MAX_DOCUMENT_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct PackagedArchive {
    pub bytes: Vec<u8>,
    pub manifest: ArchiveManifest,
    pub manifest_text: String,
    pub record_count: u64,
    pub sha256: String,
}

pub fn package(document: &BackupDocument) -> LifecycleResult<PackagedArchive> {
    package_inner(document, None)
}

/// Like [`package`], recording which tables the export attempted, skipped and failed.
pub fn package_export(outcome: &ExportOutcome) -> LifecycleResult<PackagedArchive> {
    package_inner(&outcome.document, Some(outcome))
}

fn package_inner(
    document: &BackupDocument,
    coverage: Option<&ExportOutcome>,
) -> LifecycleResult<PackagedArchive> {
    let doc_bytes = document
        .encode()
        .map_err(|err| LifecycleError::Archive(format!("serialize document: {err}")))?;
    let mut manifest = ArchiveManifest::for_document(document, &doc_bytes);
    if let Some(outcome) = coverage {
        manifest = manifest.with_coverage(outcome);
    }
    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| LifecycleError::Archive(format!("serialize manifest: {err}")))?;
    let manifest_text = manifest.render_text();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, payload) in [
        (DOCUMENT_ENTRY, doc_bytes.as_slice()),
        (MANIFEST_ENTRY, manifest_json.as_slice()),
        (MANIFEST_TEXT_ENTRY, manifest_text.as_bytes()),
    ] {
        writer.start_file(name, options)?;
        writer.write_all(payload)?;
    }
    let bytes = writer.finish()?.into_inner();

    Ok(PackagedArchive {
        sha256: sha256_hex(&bytes),
        record_count: manifest.record_count,
        manifest,
        manifest_text,
        bytes,
    })
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> LifecycleResult<Option<Vec<u8>>> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut buf = Vec::new();
    entry.take(MAX_DOCUMENT_BYTES + 1).read_to_end(&mut buf)?;
    if buf.len() as u64 > MAX_DOCUMENT_BYTES {
        return Err(LifecycleError::Validation(format!("{name} exceeds the size limit")));
    }
    Ok(Some(buf))
}

/// Open an archive and decode its document. Archives carrying a manifest
/// must match its checksum.
pub fn unpack(bytes: &[u8]) -> LifecycleResult<(BackupDocument, Option<ArchiveManifest>)> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| LifecycleError::Validation(format!("not a backup archive: {err}")))?;
    let doc_bytes = read_entry(&mut archive, DOCUMENT_ENTRY)?.ok_or_else(|| {
        LifecycleError::Validation(format!("archive has no {DOCUMENT_ENTRY}"))
    })?;
    let manifest = match read_entry(&mut archive, MANIFEST_ENTRY)? {
        Some(raw) => Some(
            serde_json::from_slice::<ArchiveManifest>(&raw)
                .map_err(|err| LifecycleError::Validation(format!("unreadable manifest: {err}")))?,
        ),
        None => None,
    };
    if let Some(manifest) = &manifest {
        if manifest.document_sha256 != sha256_hex(&doc_bytes) {
            return Err(LifecycleError::Validation(
                "document checksum does not match the manifest".into(),
            ));
        }
    }
    Ok((BackupDocument::decode(&doc_bytes)?, manifest))
}

pub fn backup_file_name(scope: Scope) -> String {
    let slug = match scope {
        Scope::Company(id) => format!("company_{id}"),
        Scope::System => "system".to_string(),
    };
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let short = Uuid::new_v4().simple().to_string();
    format!("{FILE_PREFIX}{slug}_{stamp}_{}.zip", &short[..8])
}

fn required_free_bytes(len: u64) -> u64 {
    ((len as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn free_disk_space(path: &Path) -> LifecycleResult<u64> {
    if let Ok(fake) = env::var("TENANT_LIFECYCLE_FAKE_FREE_BYTES") {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }
    available_space(path)
        .map_err(|err| LifecycleError::Archive(format!("available space of {}: {err}", path.display())))
}

/// Write `bytes` to `dir/file_name` through a `.partial` sibling after
/// checking for enough free space.
pub async fn write_artifact(dir: &Path, file_name: &str, bytes: Vec<u8>) -> LifecycleResult<PathBuf> {
    let dir = dir.to_path_buf();
    let file_name = file_name.to_string();
    task::spawn_blocking(move || -> LifecycleResult<PathBuf> {
        fs::create_dir_all(&dir)?;
        let required = required_free_bytes(bytes.len() as u64);
        let available = free_disk_space(&dir)?;
        if available < required {
            return Err(LifecycleError::Archive(format!(
                "not enough disk space in {} (need {required} bytes, have {available})",
                dir.display()
            )));
        }
        let final_path = dir.join(&file_name);
        let partial = dir.join(format!("{file_name}{PARTIAL_SUFFIX}"));
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&partial)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&partial, &final_path)
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&partial);
            return Err(err.into());
        }
        Ok(final_path)
    })
    .await
    .map_err(|err| LifecycleError::Archive(format!("write task failed: {err}")))?
}

/// Remove an artifact whose catalog record never completed.
async fn discard_artifact(path: PathBuf) {
    let removed = task::spawn_blocking(move || fs::remove_file(&path).map(|()| path)).await;
    match removed {
        Ok(Ok(path)) => {
            warn!(target: "tenant_lifecycle", event = "backup_artifact_discarded", path = %path.display())
        }
        Ok(Err(err)) => {
            error!(target: "tenant_lifecycle", event = "backup_artifact_discard_failed", error = %err)
        }
        Err(err) => {
            error!(target: "tenant_lifecycle", event = "backup_artifact_discard_failed", error = %err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub record: BackupRecord,
    pub path: PathBuf,
    pub manifest: ArchiveManifest,
}

/// Export, package and store a backup of `scope`, keeping its catalog
/// record in step. Upload happens after the record is final and its failure
/// only shows up as a missing `remote_url`.
pub async fn create_backup(
    pool: &SqlitePool,
    caps: &SchemaCapabilities,
    config: &LifecycleConfig,
    collab: &Collaborators,
    scope: Scope,
    created_by: Option<i64>,
) -> LifecycleResult<BackupOutcome> {
    let file_name = backup_file_name(scope);
    let pending = catalog::insert_pending(
        pool,
        &NewBackup {
            scope,
            file_name: file_name.clone(),
            storage_location: config.backup_dir.display().to_string(),
            format: ARCHIVE_FORMAT.to_string(),
            created_by,
            created_at: None,
        },
    )
    .await?;

    let built = async {
        let outcome =
            export::export(pool, caps, &config.export_tables, &config.tenant_column, scope).await?;
        let packaged = package_export(&outcome)?;
        let path = write_artifact(&config.backup_dir, &file_name, packaged.bytes.clone()).await?;
        let completed = catalog::mark_completed(
            pool,
            &pending.id,
            packaged.bytes.len() as u64,
            packaged.record_count,
        )
        .await;
        match completed {
            Ok(record) => Ok::<_, LifecycleError>((packaged, path, record)),
            Err(err) => {
                discard_artifact(path).await;
                Err(err)
            }
        }
    }
    .await;

    let (packaged, path, mut record) = match built {
        Ok(parts) => parts,
        Err(err) => {
            error!(
                target: "tenant_lifecycle",
                event = "backup_failed",
                backup_id = %pending.id,
                scope = %scope,
                error = %err
            );
            if let Err(mark_err) = catalog::mark_failed(pool, &pending.id).await {
                error!(target: "tenant_lifecycle", event = "backup_mark_failed_error", error = %mark_err);
            }
            return Err(err);
        }
    };

    info!(
        target: "tenant_lifecycle",
        event = "backup_completed",
        backup_id = %record.id,
        scope = %scope,
        records = packaged.record_count,
        bytes = packaged.bytes.len(),
        sha256 = %packaged.sha256
    );

    if let Some(store) = &collab.store {
        if let Some(url) = store
            .upload(&packaged.bytes, &file_name)
            .await
            .log_failure("upload_backup")
        {
            match catalog::attach_remote_url(pool, &record.id, &url).await {
                Ok(()) => record.remote_url = Some(url),
                Err(err) => warn!(
                    target: "tenant_lifecycle",
                    event = "backup_remote_url_failed",
                    backup_id = %record.id,
                    error = %err
                ),
            }
        }
    }

    Ok(BackupOutcome {
        record,
        path,
        manifest: packaged.manifest,
    })
}
