//! Backup, staged restore and ordered reset of one tenant's rows (or every
//! tenant's rows) in a shared SQLite schema.

pub mod archive;
pub mod catalog;
pub mod collab;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod migrate;
pub mod reset;
pub mod schema;
pub mod time;
pub mod value;

pub use archive::{create_backup, package, unpack, BackupOutcome, PackagedArchive};
pub use collab::Collaborators;
pub use config::LifecycleConfig;
pub use error::{AppError, AppResult, LifecycleError, LifecycleResult, Phase};
pub use export::{export, BackupDocument, ExportOutcome, Scope, TableSnapshot};
pub use import::{import, import_document, restore, restore_backup, ImportOutcome};
pub use reset::{
    reset_system, reset_tenant, Caller, ResetContext, ResetOptions, ResetOutcome, Role,
};
pub use schema::{SchemaCache, SchemaCapabilities, TableShape};
pub use value::{Row, Scalar};
