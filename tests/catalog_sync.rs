#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tempfile::tempdir;

use tenant_lifecycle::archive::{self, sync_remote};
use tenant_lifecycle::catalog::{self, BackupFilter, BackupRecord, BackupStatus, NewBackup};
use tenant_lifecycle::collab::{LocalDirStore, ObjectStore};
use tenant_lifecycle::{LifecycleError, Scope};

#[path = "util.rs"]
mod util;

async fn catalogue(pool: &SqlitePool, scope: Scope, file_name: &str, created_at: i64) -> BackupRecord {
    let pending = catalog::insert_pending(
        pool,
        &NewBackup {
            scope,
            file_name: file_name.to_string(),
            storage_location: "/srv/backups".into(),
            format: "zip/json".into(),
            created_by: Some(1),
            created_at: Some(created_at),
        },
    )
    .await
    .unwrap();
    catalog::mark_completed(pool, &pending.id, 64, 3).await.unwrap()
}

fn names(records: &[BackupRecord]) -> Vec<&str> {
    records.iter().map(|r| r.file_name.as_str()).collect()
}

#[tokio::test]
async fn list_filters_and_pages_newest_first() -> Result<()> {
    let pool = util::pos_pool().await;
    catalogue(&pool, Scope::Company(1), "backup_company_1_a.zip", 1_000).await;
    catalogue(&pool, Scope::Company(1), "backup_company_1_b.zip", 2_000).await;
    catalogue(&pool, Scope::Company(2), "backup_company_2_100%.zip", 3_000).await;
    catalogue(&pool, Scope::Company(2), "backup_company_2_1000.zip", 4_000).await;
    catalogue(&pool, Scope::System, "backup_system_a.zip", 5_000).await;
    catalog::insert_pending(
        &pool,
        &NewBackup {
            scope: Scope::Company(1),
            file_name: "backup_company_1_pending.zip".into(),
            storage_location: "/srv/backups".into(),
            format: "zip/json".into(),
            created_by: None,
            created_at: Some(6_000),
        },
    )
    .await?;

    let all = catalog::list(&pool, &BackupFilter::default()).await?;
    assert_eq!(all.total, 6);
    assert_eq!(all.records[0].file_name, "backup_company_1_pending.zip");

    let company = catalog::list(
        &pool,
        &BackupFilter {
            scope: Some(Scope::Company(1)),
            status: Some(BackupStatus::Completed),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(
        names(&company.records),
        vec!["backup_company_1_b.zip", "backup_company_1_a.zip"]
    );

    let system = catalog::list(
        &pool,
        &BackupFilter {
            scope: Some(Scope::System),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(names(&system.records), vec!["backup_system_a.zip"]);
    assert_eq!(system.records[0].scope(), Scope::System);

    let ranged = catalog::list(
        &pool,
        &BackupFilter {
            created_from: Some(2_000),
            created_to: Some(4_000),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(ranged.total, 3);

    // Wildcards in the search term match literally.
    let search = catalog::list(
        &pool,
        &BackupFilter {
            search: Some("100%".into()),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(names(&search.records), vec!["backup_company_2_100%.zip"]);

    let second_page = catalog::list(
        &pool,
        &BackupFilter {
            status: Some(BackupStatus::Completed),
            page: 2,
            per_page: 2,
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(second_page.total, 5);
    assert_eq!(second_page.page, 2);
    assert_eq!(
        names(&second_page.records),
        vec!["backup_company_2_100%.zip", "backup_company_1_b.zip"]
    );
    Ok(())
}

#[tokio::test]
async fn restore_points_need_a_completed_backup() -> Result<()> {
    let pool = util::pos_pool().await;
    let done = catalogue(&pool, Scope::Company(1), "backup_company_1_a.zip", 1_000).await;
    let pending = catalog::insert_pending(
        &pool,
        &NewBackup {
            scope: Scope::Company(1),
            file_name: "backup_company_1_b.zip".into(),
            storage_location: "/srv/backups".into(),
            format: "zip/json".into(),
            created_by: None,
            created_at: None,
        },
    )
    .await?;

    let point = catalog::create_restore_point(&pool, "before year end", &done.id, 4).await?;
    assert_eq!(point.backup_id, done.id);
    assert_eq!(point.record_count, 3);
    assert_eq!(point.table_count, 4);

    let err = catalog::create_restore_point(&pool, "too early", &pending.id, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Validation(_)));
    let err = catalog::create_restore_point(&pool, "nothing", "missing-id", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Validation(_)));

    let points = catalog::list_restore_points(&pool).await?;
    assert_eq!(points, vec![point]);
    Ok(())
}

#[tokio::test]
async fn sync_pulls_unknown_remote_archives_once() -> Result<()> {
    let dir = tempdir()?;
    let remote = dir.path().join("remote");
    let store = LocalDirStore::new(remote.clone());

    let source = util::pos_pool().await;
    util::seed_tenant(&source, 42, 0).await;
    let source_config = util::config(&dir.path().join("source"));
    let caps = util::caps(&source).await;
    let collab = util::recording(&Arc::new(util::Recorder::default()))
        .with_store(Arc::new(store.clone()));
    let backup =
        archive::create_backup(&source, &caps, &source_config, &collab, Scope::Company(42), None)
            .await?;
    store.upload(b"not an archive", "backup_junk.zip").await?;

    let (document, _) = archive::unpack(&std::fs::read(&backup.path)?)?;
    let target = util::pos_pool().await;
    let target_dir = dir.path().join("target-backups");

    let report = sync_remote(&target, &store, &target_dir).await?;
    assert_eq!(report.listed, 2);
    assert_eq!(report.downloaded, vec![backup.record.file_name.clone()]);
    assert_eq!(report.failed, vec!["backup_junk.zip".to_string()]);

    let synced = catalog::find_by_file_name(&target, &backup.record.file_name)
        .await?
        .expect("synced record");
    assert_eq!(synced.status, BackupStatus::Completed);
    assert_eq!(synced.company_id, Some(42));
    assert_eq!(synced.record_count, 9);
    assert_eq!(synced.created_at, document.exported_at.timestamp_millis());
    assert!(synced.remote_url.as_deref().unwrap_or_default().starts_with("file://"));
    assert!(target_dir.join(&backup.record.file_name).exists());

    let again = sync_remote(&target, &store, &target_dir).await?;
    assert!(again.downloaded.is_empty());
    assert_eq!(
        catalog::list(&target, &BackupFilter::default()).await?.total,
        1
    );
    Ok(())
}

#[tokio::test]
async fn sync_with_unreachable_store_reports_nothing() -> Result<()> {
    let dir = tempdir()?;
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x")?;
    let store = LocalDirStore::new(blocker);
    let pool = util::pos_pool().await;

    let report = sync_remote(&pool, &store, &dir.path().join("backups")).await?;
    assert_eq!(report, Default::default());
    Ok(())
}
