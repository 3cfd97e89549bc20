//! The hand-ordered step lists behind tenant and system resets. Children
//! always come before the parents they reference.

use serde::Serialize;

use crate::db::sql::{Predicate, Statement};
use crate::export::Scope;
use crate::schema::SchemaCapabilities;
use crate::value::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOperation {
    Delete,
    Update,
    RawSql,
}

/// Which rows of the target table a step touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFilter {
    /// Rows whose tenant column equals the company id.
    Tenant,
    /// Rows whose `column` equals the company id, e.g. `companies.id`.
    TenantKey(String),
    /// Rows whose `column` points at a parent row of the company.
    ViaParent {
        column: String,
        parent_table: String,
        parent_column: String,
    },
    Everything,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Delete(StepFilter),
    /// Each assignment names alternative spellings of one column; the first
    /// present in the live table is written.
    Update {
        assignments: Vec<(Vec<String>, Scalar)>,
        filter: StepFilter,
    },
    /// Literal SQL bound with the step's params. `count_sql` is what a dry
    /// run executes instead.
    Raw { sql: String, count_sql: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResetStep {
    pub order: u32,
    pub operation: StepOperation,
    pub target_table: String,
    pub action: StepAction,
    pub params: Vec<Scalar>,
    pub optional: bool,
}

/// A step rendered against the live schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    pub mutate: Statement,
    pub count: Statement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    MissingTable,
    /// The table exists but lacks something the step filters or writes on.
    Incompatible(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Keep products, categories and suppliers; zero stock instead.
    pub keep_catalog: bool,
}

struct PlanBuilder {
    steps: Vec<ResetStep>,
    everything: bool,
}

impl PlanBuilder {
    fn filter(&self, tenant: StepFilter) -> StepFilter {
        if self.everything {
            StepFilter::Everything
        } else {
            tenant
        }
    }

    fn push(&mut self, table: &str, operation: StepOperation, action: StepAction, optional: bool) {
        self.steps.push(ResetStep {
            order: self.steps.len() as u32 + 1,
            operation,
            target_table: table.to_string(),
            action,
            params: Vec::new(),
            optional,
        });
    }

    fn delete(&mut self, table: &str, optional: bool) {
        let action = StepAction::Delete(self.filter(StepFilter::Tenant));
        self.push(table, StepOperation::Delete, action, optional);
    }

    fn delete_children(&mut self, table: &str, column: &str, parent_table: &str, optional: bool) {
        let action = StepAction::Delete(self.filter(StepFilter::ViaParent {
            column: column.to_string(),
            parent_table: parent_table.to_string(),
            parent_column: "id".to_string(),
        }));
        self.push(table, StepOperation::Delete, action, optional);
    }
}

/// Tables the reset steps of a scope delete from, in step order.
const SEQUENCE_TABLES: &[&str] = &[
    "sale_items",
    "payments",
    "sales",
    "repairs",
    "repairs_new",
    "inventory_movements",
    "purchase_order_items",
    "purchase_orders",
    "sms_logs",
    "expenses",
    "customers",
    "products",
    "categories",
    "suppliers",
];

fn build(everything: bool, options: PlanOptions) -> PlanBuilder {
    let mut plan = PlanBuilder {
        steps: Vec::new(),
        everything,
    };
    plan.delete_children("sale_items", "sale_id", "sales", false);
    plan.delete("payments", true);
    plan.delete("sales", false);
    plan.delete("repairs", true);
    plan.delete("repairs_new", true);
    plan.delete("inventory_movements", true);
    plan.delete_children("purchase_order_items", "purchase_order_id", "purchase_orders", true);
    plan.delete("purchase_orders", true);
    plan.delete("sms_logs", true);
    plan.delete("expenses", true);
    plan.delete("customers", false);
    if options.keep_catalog {
        let action = StepAction::Update {
            assignments: vec![(vec!["quantity".into(), "qty".into()], Scalar::Int(0))],
            filter: plan.filter(StepFilter::Tenant),
        };
        plan.push("products", StepOperation::Update, action, false);
    } else {
        plan.delete("products", false);
        plan.delete("categories", true);
        plan.delete("suppliers", true);
    }
    plan
}

pub fn tenant_plan(options: PlanOptions) -> Vec<ResetStep> {
    let mut plan = build(false, options);
    let action = StepAction::Update {
        assignments: vec![(vec!["next_invoice_number".into()], Scalar::Int(1))],
        filter: StepFilter::TenantKey("id".into()),
    };
    plan.push("companies", StepOperation::Update, action, true);
    plan.steps
}

pub fn system_plan(options: PlanOptions) -> Vec<ResetStep> {
    let mut plan = build(true, options);
    let tables: Vec<&str> = SEQUENCE_TABLES
        .iter()
        .copied()
        .filter(|t| !options.keep_catalog || !matches!(*t, "products" | "categories" | "suppliers"))
        .collect();
    let placeholders = vec!["?"; tables.len()].join(", ");
    plan.push(
        "sqlite_sequence",
        StepOperation::RawSql,
        StepAction::Raw {
            sql: format!("DELETE FROM sqlite_sequence WHERE name IN ({placeholders})"),
            count_sql: format!("SELECT COUNT(*) FROM sqlite_sequence WHERE name IN ({placeholders})"),
        },
        true,
    );
    if let Some(step) = plan.steps.last_mut() {
        step.params = tables.into_iter().map(Scalar::from).collect();
    }
    plan.steps
}

impl ResetStep {
    /// Render the step for `scope` against the live schema.
    pub fn resolve(
        &self,
        caps: &SchemaCapabilities,
        tenant_column: &str,
        scope: Scope,
    ) -> Result<ResolvedStep, Unresolved> {
        let table = caps.table(&self.target_table).ok_or(Unresolved::MissingTable)?;
        match &self.action {
            StepAction::Delete(filter) => {
                let predicate = filter_predicate(caps, &table.name, filter, tenant_column, scope)?;
                Ok(ResolvedStep {
                    mutate: Statement::delete(&table.name, &predicate),
                    count: Statement::count(&table.name, &predicate),
                })
            }
            StepAction::Update {
                assignments,
                filter,
            } => {
                let predicate = filter_predicate(caps, &table.name, filter, tenant_column, scope)?;
                let mut sets = Vec::with_capacity(assignments.len());
                for (candidates, value) in assignments {
                    let names: Vec<&str> = candidates.iter().map(String::as_str).collect();
                    let column = table.first_present(&names).ok_or_else(|| {
                        Unresolved::Incompatible(format!("none of {} exist", names.join("/")))
                    })?;
                    sets.push((column.name.clone(), value.clone()));
                }
                Ok(ResolvedStep {
                    mutate: Statement::update(&table.name, &sets, &predicate),
                    count: Statement::count(&table.name, &predicate),
                })
            }
            StepAction::Raw { sql, count_sql } => Ok(ResolvedStep {
                mutate: Statement {
                    sql: sql.clone(),
                    binds: self.params.clone(),
                },
                count: Statement {
                    sql: count_sql.clone(),
                    binds: self.params.clone(),
                },
            }),
        }
    }
}

fn filter_predicate(
    caps: &SchemaCapabilities,
    table: &str,
    filter: &StepFilter,
    tenant_column: &str,
    scope: Scope,
) -> Result<Predicate, Unresolved> {
    let company_id = match (filter, scope) {
        (StepFilter::Everything, _) => return Ok(Predicate::All),
        (_, Scope::Company(id)) => id,
        (_, Scope::System) => {
            return Err(Unresolved::Incompatible(
                "tenant filter used in a system reset".into(),
            ))
        }
    };
    match filter {
        StepFilter::Tenant => {
            let column = caps
                .table(table)
                .and_then(|t| t.column(tenant_column))
                .ok_or_else(|| Unresolved::Incompatible(format!("no {tenant_column} column")))?;
            Ok(Predicate::eq(column.name.clone(), company_id))
        }
        StepFilter::TenantKey(column) => Ok(Predicate::eq(column.clone(), company_id)),
        StepFilter::ViaParent {
            column,
            parent_table,
            parent_column,
        } => {
            let parent_tenant = caps
                .table(parent_table)
                .and_then(|t| t.column(tenant_column))
                .ok_or_else(|| {
                    Unresolved::Incompatible(format!("parent {parent_table} has no {tenant_column} column"))
                })?;
            Ok(Predicate::InParent {
                column: column.clone(),
                parent_table: parent_table.clone(),
                parent_column: parent_column.clone(),
                filter: Box::new(Predicate::eq(parent_tenant.name.clone(), company_id)),
            })
        }
        StepFilter::Everything => Ok(Predicate::All),
    }
}
