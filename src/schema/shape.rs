use super::TableInfo;

/// How rows of a table are attributed to a tenant, which decides how a merge
/// replaces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableShape {
    /// Carries the tenant column: replace every row of the target tenant.
    TenantScoped { column: String },
    /// No tenant column but a single-column primary key: replace by key.
    Keyed { column: String },
    /// Explicitly allowlisted as owned entirely by one tenant's data set:
    /// delete everything, then copy.
    WholeTable,
    /// No safe merge strategy exists.
    Unmergeable,
}

impl TableShape {
    pub fn classify(table: &TableInfo, tenant_column: &str, whole_table: &[String]) -> TableShape {
        if let Some(col) = table.column(tenant_column) {
            return TableShape::TenantScoped {
                column: col.name.clone(),
            };
        }
        if let Some(pk) = table.single_primary_key() {
            return TableShape::Keyed {
                column: pk.name.clone(),
            };
        }
        if whole_table
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&table.name))
        {
            return TableShape::WholeTable;
        }
        TableShape::Unmergeable
    }

    pub fn label(&self) -> &'static str {
        match self {
            TableShape::TenantScoped { .. } => "tenant_scoped",
            TableShape::Keyed { .. } => "keyed",
            TableShape::WholeTable => "whole_table",
            TableShape::Unmergeable => "unmergeable",
        }
    }
}
