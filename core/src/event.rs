//! The audit log — every state change the engine makes.
//!
//! RULE: an event is appended in the same transaction as the change it
//! describes. If the change rolls back, so does its event.
//! Variants are only ever added, never removed or reordered.

use crate::{
    assignment::{AssignedBy, AssignmentStatus},
    lead::CallOutcome,
    types::{AgentId, AssignmentId, EntityId, LeadId, TenantId, Timestamp},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Assignment ledger ──────────────────────────
    AssignmentCreated {
        assignment_id: AssignmentId,
        lead_id:       LeadId,
        agent_id:      AgentId,
        assigned_by:   AssignedBy,
        expires_at:    Timestamp,
    },
    AssignmentTransitioned {
        assignment_id: AssignmentId,
        lead_id:       LeadId,
        agent_id:      AgentId,
        from:          AssignmentStatus,
        to:            AssignmentStatus,
    },
    AssignmentExpired {
        assignment_id: AssignmentId,
        lead_id:       LeadId,
        agent_id:      AgentId,
        expired_at:    Timestamp,
    },

    // ── Call outcomes ──────────────────────────────
    CallOutcomeRecorded {
        call_id:       EntityId,
        lead_id:       LeadId,
        assignment_id: Option<AssignmentId>,
        outcome:       CallOutcome,
    },

    // ── Reuse ──────────────────────────────────────
    LeadReused {
        lead_id:           LeadId,
        new_assignment_id: AssignmentId,
        agent_id:          AgentId,
        attempt:           u32,
        manual:            bool,
    },
    ReusePolicyUpdated {
        auto_reuse_enabled: bool,
        max_reuse_attempts: u32,
        reuse_delay_hours:  u32,
    },

    // ── Load index ─────────────────────────────────
    LoadIndexRepaired {
        agent_id: AgentId,
        recorded: u32,
        actual:   u32,
    },
}

impl EngineEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AssignmentCreated { .. }      => "assignment_created",
            Self::AssignmentTransitioned { .. } => "assignment_transitioned",
            Self::AssignmentExpired { .. }      => "assignment_expired",
            Self::CallOutcomeRecorded { .. }    => "call_outcome_recorded",
            Self::LeadReused { .. }             => "lead_reused",
            Self::ReusePolicyUpdated { .. }     => "reuse_policy_updated",
            Self::LoadIndexRepaired { .. }      => "load_index_repaired",
        }
    }

    /// The row the event is about.
    pub fn entity_id(&self) -> &str {
        match self {
            Self::AssignmentCreated { assignment_id, .. }
            | Self::AssignmentTransitioned { assignment_id, .. }
            | Self::AssignmentExpired { assignment_id, .. } => assignment_id,
            Self::CallOutcomeRecorded { call_id, .. } => call_id,
            Self::LeadReused { lead_id, .. } => lead_id,
            Self::ReusePolicyUpdated { .. } => "reuse_policy",
            Self::LoadIndexRepaired { agent_id, .. } => agent_id,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:          Option<i64>,
    pub tenant_id:   TenantId,
    pub occurred_at: Timestamp,
    pub actor:       String,
    pub event_type:  String,
    pub entity_id:   String,
    pub payload:     String, // JSON-serialized EngineEvent
}

impl EventLogEntry {
    pub fn decode(&self) -> serde_json::Result<EngineEvent> {
        serde_json::from_str(&self.payload)
    }
}
