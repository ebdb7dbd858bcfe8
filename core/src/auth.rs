//! Authorization context handed in by the (external) auth layer.
//!
//! The engine never authenticates anyone. It trusts the Actor it is given
//! and uses it for two things: tenant scoping and role checks.

use crate::{
    error::{EngineError, EngineResult},
    types::{TenantId, UserId},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Agent,
    DataUploader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin        => "admin",
            Self::Manager      => "manager",
            Self::Agent        => "agent",
            Self::DataUploader => "data_uploader",
        }
    }

    pub fn is_supervisor(&self) -> bool {
        matches!(self, Self::Admin | Self::Manager)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub user_id:   UserId,
    pub tenant_id: TenantId,
    pub role:      Role,
}

impl Actor {
    pub fn new(user_id: impl Into<UserId>, tenant_id: impl Into<TenantId>, role: Role) -> Self {
        Self {
            user_id:   user_id.into(),
            tenant_id: tenant_id.into(),
            role,
        }
    }

    /// Create assignments (single, multi, bulk).
    pub fn require_assigner(&self) -> EngineResult<()> {
        match self.role {
            Role::Admin | Role::Manager | Role::DataUploader => Ok(()),
            Role::Agent => Err(self.denied("assign leads")),
        }
    }

    /// Reuse settings, reuse runs and load-index repair.
    pub fn require_supervisor(&self) -> EngineResult<()> {
        if self.role.is_supervisor() {
            Ok(())
        } else {
            Err(self.denied("manage lead reuse"))
        }
    }

    /// Agents may only touch their own assignments; supervisors any in their tenant.
    pub fn require_can_work(&self, assignee: &str) -> EngineResult<()> {
        match self.role {
            Role::Admin | Role::Manager => Ok(()),
            Role::Agent if self.user_id == assignee => Ok(()),
            Role::Agent => Err(EngineError::forbidden(format!(
                "agent '{}' cannot modify an assignment held by '{assignee}'",
                self.user_id
            ))),
            Role::DataUploader => Err(self.denied("update assignments")),
        }
    }

    /// Viewing one's own worklist.
    pub fn require_worker(&self) -> EngineResult<()> {
        match self.role {
            Role::DataUploader => Err(self.denied("view assigned leads")),
            _ => Ok(()),
        }
    }

    fn denied(&self, what: &str) -> EngineError {
        EngineError::forbidden(format!("role '{}' may not {what}", self.role.as_str()))
    }
}
