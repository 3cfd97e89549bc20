use std::fmt;

use thiserror::Error;

/// Stage of an export, import or reset in which a structural failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Export,
    Package,
    Validate,
    Stage,
    Merge,
    Cleanup,
    Reset,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Export => "export",
            Phase::Package => "package",
            Phase::Validate => "validate",
            Phase::Stage => "stage",
            Phase::Merge => "merge",
            Phase::Cleanup => "cleanup",
            Phase::Reset => "reset",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid backup document: {0}")]
    Validation(String),
    #[error("backup contains no records")]
    EmptyBackup,
    #[error("{phase} failed on table {table}: {reason}")]
    Structural {
        table: String,
        phase: Phase,
        reason: String,
    },
    #[error("no completed backup for {scope} in the last {window_hours} hours")]
    SafetyGate { scope: String, window_hours: u32 },
    #[error("caller {caller_id} is not allowed to {action}")]
    Authorization { caller_id: i64, action: String },
    #[error("object storage unavailable: {0}")]
    TransientStorage(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl LifecycleError {
    pub fn structural(table: impl Into<String>, phase: Phase, reason: impl fmt::Display) -> Self {
        LifecycleError::Structural {
            table: table.into(),
            phase,
            reason: reason.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "LIFECYCLE/VALIDATION",
            LifecycleError::EmptyBackup => "LIFECYCLE/EMPTY_BACKUP",
            LifecycleError::Structural { .. } => "LIFECYCLE/STRUCTURAL",
            LifecycleError::SafetyGate { .. } => "LIFECYCLE/SAFETY_GATE",
            LifecycleError::Authorization { .. } => "LIFECYCLE/AUTHORIZATION",
            LifecycleError::TransientStorage(_) => "LIFECYCLE/STORAGE",
            LifecycleError::Archive(_) => "LIFECYCLE/ARCHIVE",
            LifecycleError::Database(_) => "LIFECYCLE/DATABASE",
        }
    }
}

impl From<zip::result::ZipError> for LifecycleError {
    fn from(err: zip::result::ZipError) -> Self {
        LifecycleError::Archive(err.to_string())
    }
}

impl From<std::io::Error> for LifecycleError {
    fn from(err: std::io::Error) -> Self {
        LifecycleError::Archive(err.to_string())
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
