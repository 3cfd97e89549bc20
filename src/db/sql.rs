//! Small typed builder for the statements the lifecycle engines issue.
//! Identifiers are always quoted and values are always bound.

use sqlx::SqliteConnection;

use super::quote_ident;
use crate::value::{bind_scalar, decode_row, Row, Scalar};

/// Row selection for a single table.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every row of the table.
    All,
    /// `column = value`.
    Eq { column: String, value: Scalar },
    /// `column IN (SELECT parent_column FROM parent_table WHERE <filter>)`.
    InParent {
        column: String,
        parent_table: String,
        parent_column: String,
        filter: Box<Predicate>,
    },
    /// `column IN (SELECT column FROM other_table)`, used against staging tables.
    InTable { column: String, table: String },
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Renders the predicate without the leading `WHERE`, pushing bound values.
    /// `None` means no restriction.
    fn render(&self, binds: &mut Vec<Scalar>) -> Option<String> {
        match self {
            Predicate::All => None,
            Predicate::Eq { column, value } => {
                binds.push(value.clone());
                Some(format!("{} = ?", quote_ident(column)))
            }
            Predicate::InParent {
                column,
                parent_table,
                parent_column,
                filter,
            } => {
                let mut sub = format!(
                    "SELECT {} FROM {}",
                    quote_ident(parent_column),
                    quote_ident(parent_table)
                );
                if let Some(clause) = filter.render(binds) {
                    sub.push_str(" WHERE ");
                    sub.push_str(&clause);
                }
                Some(format!("{} IN ({sub})", quote_ident(column)))
            }
            Predicate::InTable { column, table } => Some(format!(
                "{col} IN (SELECT {col} FROM {tbl})",
                col = quote_ident(column),
                tbl = quote_ident(table)
            )),
        }
    }

    fn where_clause(&self, binds: &mut Vec<Scalar>) -> String {
        match self.render(binds) {
            Some(clause) => format!(" WHERE {clause}"),
            None => String::new(),
        }
    }
}

/// A rendered statement with its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<Scalar>,
}

impl Statement {
    pub fn raw(sql: impl Into<String>) -> Self {
        Statement {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn count(table: &str, predicate: &Predicate) -> Self {
        let mut binds = Vec::new();
        let filter = predicate.where_clause(&mut binds);
        Statement {
            sql: format!("SELECT COUNT(*) FROM {}{filter}", quote_ident(table)),
            binds,
        }
    }

    pub fn delete(table: &str, predicate: &Predicate) -> Self {
        let mut binds = Vec::new();
        let filter = predicate.where_clause(&mut binds);
        Statement {
            sql: format!("DELETE FROM {}{filter}", quote_ident(table)),
            binds,
        }
    }

    pub fn update(table: &str, assignments: &[(String, Scalar)], predicate: &Predicate) -> Self {
        let mut binds = Vec::new();
        let sets = assignments
            .iter()
            .map(|(column, value)| {
                binds.push(value.clone());
                format!("{} = ?", quote_ident(column))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let filter = predicate.where_clause(&mut binds);
        Statement {
            sql: format!("UPDATE {} SET {sets}{filter}", quote_ident(table)),
            binds,
        }
    }

    pub fn select(table: &str, predicate: &Predicate, order_by: Option<&str>) -> Self {
        let mut binds = Vec::new();
        let filter = predicate.where_clause(&mut binds);
        let order = order_by
            .map(|col| format!(" ORDER BY {}", quote_ident(col)))
            .unwrap_or_default();
        Statement {
            sql: format!("SELECT * FROM {}{filter}{order}", quote_ident(table)),
            binds,
        }
    }

    pub async fn execute(&self, conn: &mut SqliteConnection) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query(&self.sql);
        for value in &self.binds {
            query = bind_scalar(query, value);
        }
        Ok(query.execute(conn).await?.rows_affected())
    }

    pub async fn fetch_count(&self, conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
        let mut query = sqlx::query_scalar::<_, i64>(&self.sql);
        for value in &self.binds {
            query = match value {
                Scalar::Null => query.bind(Option::<i64>::None),
                Scalar::Bool(b) => query.bind(*b),
                Scalar::Int(i) => query.bind(*i),
                Scalar::Float(f) => query.bind(*f),
                Scalar::String(s) => query.bind(s.clone()),
            };
        }
        query.fetch_one(conn).await
    }

    pub async fn fetch_rows(&self, conn: &mut SqliteConnection) -> Result<Vec<Row>, sqlx::Error> {
        let mut query = sqlx::query(&self.sql);
        for value in &self.binds {
            query = bind_scalar(query, value);
        }
        let rows = query.fetch_all(conn).await?;
        rows.iter().map(decode_row).collect()
    }
}
