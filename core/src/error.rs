use crate::assignment::{AssignmentStatus, LeadConflict};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{} lead(s) already assigned: {}", .conflicts.len(), describe_conflicts(.conflicts))]
    Conflict { conflicts: Vec<LeadConflict> },

    #[error("Illegal assignment transition {from} -> {to}")]
    InvalidTransition {
        from: AssignmentStatus,
        to:   AssignmentStatus,
    },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("No active, available agent in tenant '{tenant_id}'")]
    NoCapacity { tenant_id: String },

    #[error("Automatic reuse is disabled for tenant '{tenant_id}'")]
    PolicyDisabled { tenant_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation { field, reason: reason.into() }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden { reason: reason.into() }
    }

    /// Storage and encoding failures. A sweep run that hits one of these
    /// stops and is retried on the next tick.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Serialization(_) | Self::Other(_)
        )
    }
}

fn describe_conflicts(conflicts: &[LeadConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} ({}) held by {}", c.lead_name, c.lead_id, c.held_by_name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type EngineResult<T> = Result<T, EngineError>;
