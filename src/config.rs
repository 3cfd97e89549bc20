use std::env;
use std::path::{Path, PathBuf};

use chrono::Duration;

const DEFAULT_TENANT_COLUMN: &str = "company_id";
const DEFAULT_USERS_TABLE: &str = "users";
const DEFAULT_SAFETY_WINDOW_HOURS: u32 = 24;
const MAX_SAFETY_WINDOW_HOURS: u32 = 720;
const DB_FILE_NAME: &str = "lifecycle.sqlite3";
const BACKUP_DIR_NAME: &str = "backups";

/// A child table whose tenancy is only known through its parent row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTable {
    pub name: String,
    pub parent: Option<ParentLink>,
}

impl ExportTable {
    pub fn plain(name: &str) -> Self {
        ExportTable {
            name: name.to_string(),
            parent: None,
        }
    }

    pub fn child_of(name: &str, column: &str, parent_table: &str) -> Self {
        ExportTable {
            name: name.to_string(),
            parent: Some(ParentLink {
                column: column.to_string(),
                parent_table: parent_table.to_string(),
                parent_column: "id".to_string(),
            }),
        }
    }
}

/// Default export allowlist, parents before children.
pub fn default_export_tables() -> Vec<ExportTable> {
    vec![
        ExportTable::plain("categories"),
        ExportTable::plain("suppliers"),
        ExportTable::plain("customers"),
        ExportTable::plain("products"),
        ExportTable::plain("sales"),
        ExportTable::child_of("sale_items", "sale_id", "sales"),
        ExportTable::plain("payments"),
        ExportTable::plain("repairs"),
        ExportTable::plain("repairs_new"),
        ExportTable::plain("purchase_orders"),
        ExportTable::child_of("purchase_order_items", "purchase_order_id", "purchase_orders"),
        ExportTable::plain("inventory_movements"),
        ExportTable::plain("expenses"),
        ExportTable::plain("sms_logs"),
    ]
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Root of per-company upload directories cleaned after a reset.
    pub files_dir: Option<PathBuf>,
    /// Directory used as the object store for uploads and sync.
    pub remote_dir: Option<PathBuf>,
    pub safety_window_hours: u32,
    pub tenant_column: String,
    pub users_table: String,
    pub export_tables: Vec<ExportTable>,
    /// Tables an import is allowed to write.
    pub import_tables: Vec<String>,
    /// Tables without a tenant column or single-column key that may be merged
    /// by replacing their whole content. Empty unless a deployment opts in.
    pub whole_table: Vec<String>,
}

impl LifecycleConfig {
    pub fn for_paths(db_path: &Path, backup_dir: &Path) -> Self {
        let export_tables = default_export_tables();
        let import_tables = export_tables.iter().map(|t| t.name.clone()).collect();
        LifecycleConfig {
            db_path: db_path.to_path_buf(),
            backup_dir: backup_dir.to_path_buf(),
            files_dir: None,
            remote_dir: None,
            safety_window_hours: DEFAULT_SAFETY_WINDOW_HOURS,
            tenant_column: DEFAULT_TENANT_COLUMN.to_string(),
            users_table: DEFAULT_USERS_TABLE.to_string(),
            export_tables,
            import_tables,
            whole_table: Vec::new(),
        }
    }

    /// Build the configuration from `TENANT_LIFECYCLE_*` environment variables,
    /// falling back to the platform data directory.
    pub fn load() -> Self {
        let db_path = env::var_os("TENANT_LIFECYCLE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);
        let backup_dir = env::var_os("TENANT_LIFECYCLE_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                db_path
                    .parent()
                    .map(|p| p.join(BACKUP_DIR_NAME))
                    .unwrap_or_else(|| PathBuf::from(BACKUP_DIR_NAME))
            });

        let mut config = LifecycleConfig::for_paths(&db_path, &backup_dir);
        config.files_dir = env::var_os("TENANT_LIFECYCLE_FILES_DIR").map(PathBuf::from);
        config.remote_dir = env::var_os("TENANT_LIFECYCLE_REMOTE_DIR").map(PathBuf::from);
        config.safety_window_hours = env::var("TENANT_LIFECYCLE_SAFETY_WINDOW_HOURS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .map(|value| value.clamp(1, MAX_SAFETY_WINDOW_HOURS))
            .unwrap_or(DEFAULT_SAFETY_WINDOW_HOURS);
        if let Some(column) = env::var("TENANT_LIFECYCLE_TENANT_COLUMN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            config.tenant_column = column;
        }
        config
    }

    pub fn safety_window(&self) -> Duration {
        Duration::hours(i64::from(self.safety_window_hours))
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tenant-lifecycle")
        .join(DB_FILE_NAME)
}
