//! Runtime view of the live schema.
//!
//! Deployments diverge (`repairs` vs `repairs_new`, `quantity` vs `qty`), so
//! the engines never hard-code column lists. They take a [`SchemaCapabilities`]
//! snapshot and branch on what it reports; absence is an `Option`, not an error.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use sqlx::{Row, SqliteConnection};
use tracing::debug;

mod shape;

pub use shape::TableShape;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    /// 1-based position within the primary key, 0 when not part of it.
    pub pk: u32,
}

impl ColumnInfo {
    pub fn new(name: &str, declared_type: &str) -> Self {
        ColumnInfo {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            not_null: false,
            pk: 0,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.pk = 1;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// First of `candidates` the table actually carries.
    pub fn first_present(&self, candidates: &[&str]) -> Option<&ColumnInfo> {
        candidates.iter().find_map(|c| self.column(c))
    }

    pub fn primary_key(&self) -> Vec<&ColumnInfo> {
        let mut pk: Vec<_> = self.columns.iter().filter(|c| c.pk > 0).collect();
        pk.sort_by_key(|c| c.pk);
        pk
    }

    pub fn single_primary_key(&self) -> Option<&ColumnInfo> {
        match self.primary_key().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

/// Tables, ordered columns and primary keys of the live database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCapabilities {
    tables: BTreeMap<String, TableInfo>,
}

impl SchemaCapabilities {
    pub fn from_tables(tables: impl IntoIterator<Item = TableInfo>) -> Self {
        SchemaCapabilities {
            tables: tables
                .into_iter()
                .map(|t| (t.name.to_ascii_lowercase(), t))
                .collect(),
        }
    }

    pub async fn load(conn: &mut SqliteConnection) -> Result<Self, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' \
             AND (name NOT LIKE 'sqlite_%' OR name = 'sqlite_sequence') ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let sql: Option<String> = row.try_get("sql")?;
            let is_virtual = sql
                .as_deref()
                .map(|ddl| {
                    ddl.trim_start()
                        .to_ascii_uppercase()
                        .starts_with("CREATE VIRTUAL TABLE")
                })
                .unwrap_or(false);
            if !is_virtual {
                names.push(name);
            }
        }

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = load_columns(conn, &name).await?;
            tables.push(TableInfo { name, columns });
        }
        debug!(target: "tenant_lifecycle", event = "schema_loaded", tables = tables.len());
        Ok(SchemaCapabilities::from_tables(tables))
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// First of `candidates` present in the schema, e.g. `["repairs", "repairs_new"]`.
    pub fn first_table(&self, candidates: &[&str]) -> Option<&TableInfo> {
        candidates.iter().find_map(|c| self.table(c))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.values().map(|t| t.name.as_str())
    }

    pub fn shape(&self, table: &str, tenant_column: &str, whole_table: &[String]) -> Option<TableShape> {
        self.table(table)
            .map(|info| TableShape::classify(info, tenant_column, whole_table))
    }
}

async fn load_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<ColumnInfo>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT name, type, \"notnull\", pk, hidden FROM pragma_table_xinfo(?) ORDER BY cid",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let hidden: i64 = row.try_get("hidden")?;
        if hidden != 0 {
            continue;
        }
        let pk: i64 = row.try_get("pk")?;
        let not_null: i64 = row.try_get("notnull")?;
        columns.push(ColumnInfo {
            name: row.try_get("name")?,
            declared_type: row.try_get("type")?,
            not_null: not_null != 0,
            pk: pk.max(0) as u32,
        });
    }
    Ok(columns)
}

/// Per-process cache of [`SchemaCapabilities`]. Callers that change the
/// host schema must call [`SchemaCache::invalidate`].
#[derive(Debug, Default)]
pub struct SchemaCache {
    inner: RwLock<Option<Arc<SchemaCapabilities>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, conn: &mut SqliteConnection) -> Result<Arc<SchemaCapabilities>, sqlx::Error> {
        if let Some(caps) = self.cached() {
            return Ok(caps);
        }
        let caps = Arc::new(SchemaCapabilities::load(conn).await?);
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(caps.clone());
        Ok(caps)
    }

    pub fn cached(&self) -> Option<Arc<SchemaCapabilities>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invalidate(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn load_reports_columns_and_keys() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE products (id INTEGER PRIMARY KEY AUTOINCREMENT, company_id INTEGER NOT NULL, name TEXT, qty INTEGER);
             CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b));
             INSERT INTO products (company_id, name, qty) VALUES (1, 'x', 2);",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let caps = SchemaCapabilities::load(&mut conn).await.unwrap();

        let products = caps.table("Products").unwrap();
        let names: Vec<_> = products.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "company_id", "name", "qty"]);
        assert_eq!(products.single_primary_key().unwrap().name, "id");
        assert!(products.column("company_id").unwrap().not_null);
        assert_eq!(products.first_present(&["quantity", "qty"]).unwrap().name, "qty");

        let pairs = caps.table("pairs").unwrap();
        assert_eq!(pairs.primary_key().len(), 2);
        assert!(pairs.single_primary_key().is_none());

        assert!(caps.has_table("sqlite_sequence"));
        assert!(caps.table("repairs").is_none());
        assert!(caps.first_table(&["repairs", "repairs_new"]).is_none());
    }

    #[tokio::test]
    async fn cache_serves_snapshot_until_invalidated() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let cache = SchemaCache::new();

        let first = cache.get(&mut conn).await.unwrap();
        assert!(!first.has_table("later"));
        sqlx::query("CREATE TABLE later (id INTEGER PRIMARY KEY)")
            .execute(&mut *conn)
            .await
            .unwrap();
        assert!(!cache.get(&mut conn).await.unwrap().has_table("later"));

        cache.invalidate();
        assert!(cache.get(&mut conn).await.unwrap().has_table("later"));
    }
}
