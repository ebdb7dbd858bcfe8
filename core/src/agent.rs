//! Agents and the Agent Load Index.
//!
//! Identity and availability come from the external agent directory.
//! `open_assignments` is owned by this engine: it is changed only inside
//! the transaction that creates or terminalizes an assignment.

use crate::{
    error::EngineResult,
    types::{AgentId, TenantId},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub agent_id:         AgentId,
    pub tenant_id:        TenantId,
    pub display_name:     String,
    pub is_active:        bool,
    pub is_available:     bool,
    pub open_assignments: u32,
}

impl Agent {
    /// A directory entry with an empty worklist.
    pub fn new(agent_id: impl Into<AgentId>, tenant_id: impl Into<TenantId>, display_name: &str) -> Self {
        Self {
            agent_id:         agent_id.into(),
            tenant_id:        tenant_id.into(),
            display_name:     display_name.to_string(),
            is_active:        true,
            is_available:     true,
            open_assignments: 0,
        }
    }

    /// Eligible to receive automatically routed work.
    pub fn can_take_work(&self) -> bool {
        self.is_active && self.is_available
    }
}

/// Difference between the stored counter and the ledger, found by a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadDrift {
    pub agent_id: AgentId,
    pub recorded: u32,
    pub actual:   u32,
}

/// Read-only consultation of the billing ledger: may this agent be given more work?
pub trait CreditGate: Send + Sync {
    fn may_assign(&self, tenant_id: &str, agent_id: &str) -> EngineResult<bool>;
}

/// No billing constraints.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmetered;

impl CreditGate for Unmetered {
    fn may_assign(&self, _tenant_id: &str, _agent_id: &str) -> EngineResult<bool> {
        Ok(true)
    }
}
