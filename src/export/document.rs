use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};
use crate::value::Row;

/// Version written into every document this build produces.
pub const FORMAT_VERSION: &str = "1.0.0";

/// The data set an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "company_id", rename_all = "snake_case")]
pub enum Scope {
    Company(i64),
    System,
}

impl Scope {
    pub fn company_id(&self) -> Option<i64> {
        match self {
            Scope::Company(id) => Some(*id),
            Scope::System => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Company(id) => write!(f, "company:{id}"),
            Scope::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table_name: String,
    pub rows: Vec<Row>,
}

impl TableSnapshot {
    pub fn new(table_name: impl Into<String>, rows: Vec<Row>) -> Self {
        TableSnapshot {
            table_name: table_name.into(),
            rows,
        }
    }

    /// Column names of the snapshot, taken from the first row.
    pub fn columns(&self) -> Vec<&str> {
        self.rows
            .first()
            .map(|row| row.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every row must carry exactly the key set of the first row.
    pub fn check_keys(&self) -> Result<(), String> {
        let Some(first) = self.rows.first() else {
            return Ok(());
        };
        let expected: BTreeSet<&String> = first.keys().collect();
        for (idx, row) in self.rows.iter().enumerate().skip(1) {
            let keys: BTreeSet<&String> = row.keys().collect();
            if keys != expected {
                return Err(format!(
                    "row {idx} of {} does not match the columns of the first row",
                    self.table_name
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub scope: Scope,
    pub exported_at: DateTime<Utc>,
    pub format_version: String,
    /// Export order is kept; imports merge in this order.
    pub tables: IndexMap<String, TableSnapshot>,
}

impl BackupDocument {
    pub fn new(scope: Scope) -> Self {
        BackupDocument {
            scope,
            exported_at: Utc::now(),
            format_version: FORMAT_VERSION.to_string(),
            tables: IndexMap::new(),
        }
    }

    pub fn push(&mut self, snapshot: TableSnapshot) {
        self.tables.insert(snapshot.table_name.clone(), snapshot);
    }

    pub fn record_count(&self) -> u64 {
        self.tables.values().map(|t| t.rows.len() as u64).sum()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a document and check everything that can be checked without a
    /// database: version, table naming and row shape.
    pub fn decode(bytes: &[u8]) -> LifecycleResult<Self> {
        let doc: BackupDocument = serde_json::from_slice(bytes)
            .map_err(|err| LifecycleError::Validation(format!("unreadable document: {err}")))?;
        check_version(&doc.format_version)?;
        for (name, snapshot) in &doc.tables {
            if name != &snapshot.table_name {
                return Err(LifecycleError::Validation(format!(
                    "table entry {name} holds a snapshot of {}",
                    snapshot.table_name
                )));
            }
            snapshot.check_keys().map_err(LifecycleError::Validation)?;
        }
        Ok(doc)
    }
}

/// Accept documents of the same major version whose minor is not newer than ours.
pub fn check_version(raw: &str) -> LifecycleResult<()> {
    let current = Version::parse(FORMAT_VERSION)
        .map_err(|err| LifecycleError::Validation(err.to_string()))?;
    let found = Version::parse(raw.trim()).map_err(|_| {
        LifecycleError::Validation(format!("unknown format version {raw:?}"))
    })?;
    if found.major != current.major || found.minor > current.minor {
        return Err(LifecycleError::Validation(format!(
            "unsupported format version {found} (this build reads {}.x up to {current})",
            current.major
        )));
    }
    Ok(())
}
