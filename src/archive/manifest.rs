use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::export::{BackupDocument, ExportOutcome, Scope, TableFailure};

/// Machine-readable summary stored next to the document in every archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: String,
    pub scope: Scope,
    pub exported_at: DateTime<Utc>,
    pub record_count: u64,
    pub tables: IndexMap<String, u64>,
    #[serde(default)]
    pub attempted: Vec<String>,
    #[serde(default)]
    pub skipped_missing: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedTable>,
    pub document_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTable {
    pub table: String,
    pub error: String,
}

impl From<&TableFailure> for FailedTable {
    fn from(f: &TableFailure) -> Self {
        FailedTable {
            table: f.table.clone(),
            error: f.error.clone(),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl ArchiveManifest {
    pub fn for_document(document: &BackupDocument, document_bytes: &[u8]) -> Self {
        ArchiveManifest {
            format_version: document.format_version.clone(),
            scope: document.scope,
            exported_at: document.exported_at,
            record_count: document.record_count(),
            tables: document
                .tables
                .iter()
                .map(|(name, snap)| (name.clone(), snap.rows.len() as u64))
                .collect(),
            attempted: document.table_names(),
            skipped_missing: Vec::new(),
            failed: Vec::new(),
            document_sha256: sha256_hex(document_bytes),
        }
    }

    pub fn with_coverage(mut self, outcome: &ExportOutcome) -> Self {
        self.attempted = outcome.attempted.clone();
        self.skipped_missing = outcome.skipped_missing.clone();
        self.failed = outcome.failed.iter().map(FailedTable::from).collect();
        self
    }

    /// Human-readable `MANIFEST.txt`.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let tenant = match self.scope {
            Scope::Company(id) => id.to_string(),
            Scope::System => "system (all tenants)".to_string(),
        };
        let _ = writeln!(out, "Tenant: {tenant}");
        let _ = writeln!(
            out,
            "Exported at: {}",
            self.exported_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(out, "Format version: {}", self.format_version);
        let _ = writeln!(out, "Record count: {}", self.record_count);
        let _ = writeln!(out, "Tables attempted: {}", self.attempted.len());
        for (table, count) in &self.tables {
            let _ = writeln!(out, "  {table}: {count}");
        }
        if !self.skipped_missing.is_empty() {
            let _ = writeln!(out, "Not present: {}", self.skipped_missing.join(", "));
        }
        for failed in &self.failed {
            let _ = writeln!(out, "FAILED {}: {}", failed.table, failed.error);
        }
        let _ = writeln!(out, "Document SHA-256: {}", self.document_sha256);
        out
    }
}
