use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};
use crate::export::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Owner,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Owner => "owner",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "super_admin" | "superadmin" => Ok(Role::SuperAdmin),
            "owner" => Ok(Role::Owner),
            "manager" => Ok(Role::Manager),
            "staff" => Ok(Role::Staff),
            other => Err(format!("unknown role {other}")),
        }
    }
}

/// Who is asking for a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: i64,
    pub role: Role,
    /// The company the caller belongs to, if any.
    pub company_id: Option<i64>,
}

/// System resets need a super admin; a company reset needs a super admin or
/// the owner of that company.
pub fn authorize(caller: &Caller, scope: Scope) -> LifecycleResult<()> {
    let allowed = match (caller.role, scope) {
        (Role::SuperAdmin, _) => true,
        (Role::Owner, Scope::Company(id)) => caller.company_id == Some(id),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(LifecycleError::Authorization {
            caller_id: caller.user_id,
            action: format!("reset {scope}"),
        })
    }
}
