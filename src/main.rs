use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;

use tenant_lifecycle::catalog::{self, BackupFilter, BackupStatus};
use tenant_lifecycle::collab::{remove_tenant_files, LocalDirStore, SqliteJobQueue, FILE_CLEANUP_JOB};
use tenant_lifecycle::reset::{self, Caller, ResetContext, ResetOptions, Role};
use tenant_lifecycle::{
    archive, db, import, logging, migrate, time, AppError, Collaborators, LifecycleConfig,
    SchemaCapabilities, Scope,
};

#[derive(Debug, Parser)]
#[command(
    name = "tenant-lifecycle",
    about = "Back up, restore and reset tenant data",
    version
)]
struct Cli {
    /// Emit machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ScopeArgs {
    /// Company to operate on.
    #[arg(long)]
    company: Option<i64>,
    /// Operate on every company.
    #[arg(long)]
    system: bool,
}

impl ScopeArgs {
    fn scope(&self) -> Scope {
        match self.company {
            Some(id) => Scope::Company(id),
            None => Scope::System,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export a scope into an archive and record it in the catalog.
    Backup {
        #[command(flatten)]
        scope: ScopeArgs,
        /// User recorded as the creator of the backup.
        #[arg(long)]
        created_by: Option<i64>,
    },
    /// Import an archive into a company.
    Restore {
        #[arg(long)]
        company: i64,
        /// Archive file to import.
        #[arg(long, conflicts_with = "backup_id", required_unless_present = "backup_id")]
        archive: Option<PathBuf>,
        /// Catalogued backup to import.
        #[arg(long)]
        backup_id: Option<String>,
        /// Stage and check the archive without changing any data.
        #[arg(long)]
        validate_only: bool,
    },
    /// Delete a company's data, or every company's data.
    Reset {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Count affected rows without changing anything.
        #[arg(long)]
        dry_run: bool,
        /// Keep products, categories and suppliers; zero stock instead.
        #[arg(long)]
        keep_catalog: bool,
        /// User id of the caller.
        #[arg(long)]
        caller: i64,
        /// Role of the caller: super_admin, owner, manager or staff.
        #[arg(long)]
        role: Role,
        /// Company the caller belongs to.
        #[arg(long)]
        caller_company: Option<i64>,
    },
    /// Inspect and synchronise the backup catalog.
    #[command(subcommand)]
    Backups(BackupsCommand),
    /// Name catalogued backups as restore targets.
    #[command(subcommand)]
    RestorePoints(RestorePointsCommand),
    /// Run queued follow-up work.
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Debug, Subcommand)]
enum BackupsCommand {
    List {
        #[arg(long, conflicts_with = "system")]
        company: Option<i64>,
        #[arg(long)]
        system: bool,
        /// pending, completed or failed.
        #[arg(long)]
        status: Option<String>,
        /// Created at or after, unix milliseconds.
        #[arg(long)]
        from: Option<i64>,
        /// Created at or before, unix milliseconds.
        #[arg(long)]
        to: Option<i64>,
        /// Substring of the file name.
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },
    /// Download remote archives missing from the catalog.
    Sync,
}

#[derive(Debug, Subcommand)]
enum RestorePointsCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        backup_id: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    Process {
        #[arg(long = "type", default_value = FILE_CLEANUP_JOB)]
        job_type: String,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn main() {
    logging::init();

    let cli = Cli::parse();
    let json = cli.json;
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: start runtime: {err}");
            process::exit(1);
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => process::exit(code),
        Err(err) => {
            report_error(&err, json);
            process::exit(1);
        }
    }
}

fn report_error(err: &anyhow::Error, json: bool) {
    let app = err
        .downcast_ref::<AppError>()
        .cloned()
        .unwrap_or_else(|| AppError::new(AppError::GENERIC_CODE, format!("{err:#}")));
    if json {
        match serde_json::to_string_pretty(&app) {
            Ok(text) => println!("{text}"),
            Err(_) => eprintln!("Error: {app}"),
        }
    } else {
        eprintln!("Error: {app}");
    }
}

fn print<T: Serialize>(value: &T, json: bool, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    } else {
        text(value);
    }
    Ok(())
}

struct Env {
    pool: SqlitePool,
    config: LifecycleConfig,
    collab: Collaborators,
}

async fn open_env() -> Result<Env> {
    let config = LifecycleConfig::load();
    let pool = db::open_pool(&config.db_path)
        .await
        .with_context(|| format!("open database {}", config.db_path.display()))?;
    migrate::apply_migrations(&pool)
        .await
        .context("apply lifecycle migrations")?;
    let mut collab = Collaborators::local(&pool);
    if let Some(dir) = &config.remote_dir {
        collab = collab.with_store(Arc::new(LocalDirStore::new(dir.clone())));
    }
    Ok(Env {
        pool,
        config,
        collab,
    })
}

async fn load_caps(pool: &SqlitePool) -> Result<SchemaCapabilities> {
    let mut conn = pool.acquire().await.context("acquire connection")?;
    SchemaCapabilities::load(&mut conn)
        .await
        .context("inspect database schema")
}

async fn handle_cli(cli: Cli) -> Result<i32> {
    let env = open_env().await?;
    let result = dispatch(&env, cli.command, cli.json).await;
    env.pool.close().await;
    result
}

async fn dispatch(env: &Env, command: Commands, json: bool) -> Result<i32> {
    match command {
        Commands::Backup { scope, created_by } => {
            let caps = load_caps(&env.pool).await?;
            let outcome = archive::create_backup(
                &env.pool,
                &caps,
                &env.config,
                &env.collab,
                scope.scope(),
                created_by,
            )
            .await
            .map_err(AppError::from)?;
            print(&outcome.record, json, |record| {
                println!(
                    "Backup {} completed: {} records",
                    record.id, record.record_count
                );
                println!("Stored at {}", outcome.path.display());
            })?;
            Ok(0)
        }
        Commands::Restore {
            company,
            archive,
            backup_id,
            validate_only,
        } => {
            let caps = load_caps(&env.pool).await?;
            let outcome = match (archive, backup_id) {
                (_, Some(id)) => {
                    import::restore_backup(
                        &env.pool,
                        &caps,
                        &env.config,
                        &env.collab,
                        &id,
                        company,
                        validate_only,
                    )
                    .await
                }
                (Some(path), None) => {
                    let bytes = read_archive(&path).await?;
                    import::restore(
                        &env.pool,
                        &caps,
                        &env.config,
                        &env.collab,
                        company,
                        &bytes,
                        validate_only,
                    )
                    .await
                }
                (None, None) => anyhow::bail!("either --archive or --backup-id is required"),
            }
            .map_err(AppError::from)?;
            print(&outcome, json, |outcome| {
                let verb = if outcome.validate_only { "Validated" } else { "Restored" };
                println!(
                    "{verb} {} records into company {}",
                    outcome.record_count, outcome.company_id
                );
                for (table, summary) in &outcome.merged {
                    println!(
                        "  {table:<24} merged {:>6}  skipped {:>4}  remapped {:>4}  rejected {:>4}  nulled {:>4}",
                        summary.merged,
                        summary.skipped,
                        summary.remapped,
                        summary.rejected,
                        summary.nulled_references
                    );
                }
                if outcome.merged.is_empty() {
                    println!("  tables: {}", outcome.tables.join(", "));
                }
            })?;
            Ok(0)
        }
        Commands::Reset {
            scope,
            dry_run,
            keep_catalog,
            caller,
            role,
            caller_company,
        } => {
            let caps = load_caps(&env.pool).await?;
            let ctx = ResetContext {
                pool: &env.pool,
                caps: &caps,
                config: &env.config,
                collab: &env.collab,
            };
            let caller = Caller {
                user_id: caller,
                role,
                company_id: caller_company,
            };
            let options = ResetOptions {
                dry_run,
                keep_catalog,
            };
            let outcome = match scope.scope() {
                Scope::Company(id) => reset::reset_tenant(&ctx, &caller, id, options).await,
                Scope::System => reset::reset_system(&ctx, &caller, options).await,
            }
            .map_err(AppError::from)?;
            print(&outcome, json, |outcome| {
                let label = if outcome.dry_run { "would affect" } else { "affected" };
                println!("Reset of {} {label} {} rows", outcome.scope, outcome.total_rows());
                for (table, rows) in &outcome.per_table_row_counts {
                    println!("  {table:<24} {rows:>8}");
                }
                for error in &outcome.errors {
                    println!("  warning: {error}");
                }
            })?;
            Ok(0)
        }
        Commands::Backups(BackupsCommand::List {
            company,
            system,
            status,
            from,
            to,
            search,
            page,
            per_page,
        }) => {
            let status = match status {
                Some(raw) => Some(
                    BackupStatus::parse(&raw)
                        .with_context(|| format!("unknown backup status {raw}"))?,
                ),
                None => None,
            };
            let scope = match (company, system) {
                (Some(id), _) => Some(Scope::Company(id)),
                (None, true) => Some(Scope::System),
                (None, false) => None,
            };
            let filter = BackupFilter {
                scope,
                status,
                created_from: from,
                created_to: to,
                search,
                page,
                per_page,
            };
            let listing = catalog::list(&env.pool, &filter)
                .await
                .context("list backups")?;
            print(&listing, json, |listing| {
                println!(
                    "{} backups (page {}, {} per page)",
                    listing.total, listing.page, listing.per_page
                );
                for record in &listing.records {
                    println!(
                        "  {} {} {:<10} {:<9} {:>8} records  {}",
                        record.id,
                        time::from_ms(record.created_at).format("%Y-%m-%d %H:%M"),
                        record.scope(),
                        record.status.as_str(),
                        record.record_count,
                        record.file_name
                    );
                }
            })?;
            Ok(0)
        }
        Commands::Backups(BackupsCommand::Sync) => {
            let Some(store) = &env.collab.store else {
                anyhow::bail!("TENANT_LIFECYCLE_REMOTE_DIR is not set");
            };
            let report = archive::sync_remote(&env.pool, store.as_ref(), &env.config.backup_dir)
                .await
                .map_err(AppError::from)?;
            print(&report, json, |report| {
                println!(
                    "Listed {}, downloaded {}, failed {}",
                    report.listed,
                    report.downloaded.len(),
                    report.failed.len()
                );
            })?;
            Ok(if report.failed.is_empty() { 0 } else { 1 })
        }
        Commands::RestorePoints(RestorePointsCommand::Create { name, backup_id }) => {
            let record = catalog::get(&env.pool, &backup_id)
                .await
                .context("load backup")?
                .with_context(|| format!("backup {backup_id} not found"))?;
            let table_count = table_count(&record.storage_location, &record.file_name).await?;
            let point = catalog::create_restore_point(&env.pool, &name, &backup_id, table_count)
                .await
                .map_err(AppError::from)?;
            print(&point, json, |point| {
                println!("Restore point {} ({}) -> backup {}", point.name, point.id, point.backup_id);
            })?;
            Ok(0)
        }
        Commands::RestorePoints(RestorePointsCommand::List) => {
            let points = catalog::list_restore_points(&env.pool)
                .await
                .context("list restore points")?;
            print(&points, json, |points| {
                for point in points {
                    println!(
                        "  {} {:<24} backup {} ({} records, {} tables)",
                        point.id, point.name, point.backup_id, point.record_count, point.table_count
                    );
                }
            })?;
            Ok(0)
        }
        Commands::Jobs(JobsCommand::Process { job_type, limit }) => {
            let queue = SqliteJobQueue::new(env.pool.clone());
            let files_dir = env.config.files_dir.clone();
            let report = queue
                .process_pending(&job_type, limit, |job| match (job.job_type.as_str(), &files_dir) {
                    (FILE_CLEANUP_JOB, Some(dir)) => remove_tenant_files(dir, job),
                    (FILE_CLEANUP_JOB, None) => {
                        anyhow::bail!("TENANT_LIFECYCLE_FILES_DIR is not set")
                    }
                    (other, _) => anyhow::bail!("no handler for job type {other}"),
                })
                .await
                .context("process jobs")?;
            print(&report, json, |report| {
                println!(
                    "Processed {} jobs: {} succeeded, {} failed",
                    report.processed, report.succeeded, report.failed
                );
            })?;
            Ok(if report.failed == 0 { 0 } else { 1 })
        }
    }
}

async fn read_archive(path: &Path) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::read(&path).with_context(|| format!("read archive {}", path.display()))
    })
    .await
    .context("read task failed")?
}

async fn table_count(storage_location: &str, file_name: &str) -> Result<usize> {
    let bytes = read_archive(&Path::new(storage_location).join(file_name)).await?;
    let (document, _) = archive::unpack(&bytes).map_err(AppError::from)?;
    Ok(document.tables.len())
}
