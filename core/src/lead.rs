//! Lead records and call outcomes, as seen by this engine.
//!
//! The lead store is an external system of record. The engine reads leads,
//! and only ever writes the status and the reuse fields.

use crate::types::{AssignmentId, EntityId, LeadId, TenantId, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Assigned,
    Contacted,
    Interested,
    NotInterested,
    RetryPending,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New           => "new",
            Self::Assigned      => "assigned",
            Self::Contacted     => "contacted",
            Self::Interested    => "interested",
            Self::NotInterested => "not_interested",
            Self::RetryPending  => "retry_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new"            => Some(Self::New),
            "assigned"       => Some(Self::Assigned),
            "contacted"      => Some(Self::Contacted),
            "interested"     => Some(Self::Interested),
            "not_interested" => Some(Self::NotInterested),
            "retry_pending"  => Some(Self::RetryPending),
            _ => None,
        }
    }

    /// Statuses bulk assignment may draw from.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Self::New | Self::RetryPending)
    }
}

/// Terminal outcome of one call, as delivered by the call-outcome feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Answered,
    Interested,
    NotInterested,
    Callback,
    Voicemail,
    Busy,
    NoAnswer,
    Missed,
    WrongNumber,
    DncRequest,
}

impl CallOutcome {
    pub const ALL: [CallOutcome; 10] = [
        Self::Answered,
        Self::Interested,
        Self::NotInterested,
        Self::Callback,
        Self::Voicemail,
        Self::Busy,
        Self::NoAnswer,
        Self::Missed,
        Self::WrongNumber,
        Self::DncRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered      => "answered",
            Self::Interested    => "interested",
            Self::NotInterested => "not_interested",
            Self::Callback      => "callback",
            Self::Voicemail     => "voicemail",
            Self::Busy          => "busy",
            Self::NoAnswer      => "no_answer",
            Self::Missed        => "missed",
            Self::WrongNumber   => "wrong_number",
            Self::DncRequest    => "dnc_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|o| o.as_str() == s)
    }

    /// The lead was never reached. Only these may ever trigger reuse.
    pub fn is_reusable(&self) -> bool {
        matches!(self, Self::NoAnswer | Self::Busy | Self::Missed | Self::Voicemail)
    }

    /// The contact told us to stop, or cannot be reached at this number.
    pub fn is_hard_stop(&self) -> bool {
        matches!(self, Self::NotInterested | Self::WrongNumber | Self::DncRequest)
    }

    /// Lead status after an assignment closes with this outcome.
    pub fn resulting_lead_status(&self) -> LeadStatus {
        match self {
            Self::Interested => LeadStatus::Interested,
            Self::Answered | Self::Callback => LeadStatus::Contacted,
            Self::NotInterested | Self::WrongNumber | Self::DncRequest => LeadStatus::NotInterested,
            Self::NoAnswer | Self::Busy | Self::Missed | Self::Voicemail => LeadStatus::RetryPending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub lead_id:       LeadId,
    pub tenant_id:     TenantId,
    pub campaign_id:   Option<EntityId>,
    pub first_name:    String,
    pub last_name:     String,
    pub phone:         String,
    pub industry:      Option<String>,
    pub location:      Option<String>,
    pub status:        LeadStatus,
    pub reuse_enabled: bool,
    pub reuse_count:   u32,
    pub last_reuse_at: Option<Timestamp>,
    pub created_at:    Timestamp,
}

impl Lead {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// A lead as handed over by the import pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLead {
    pub lead_id:     LeadId,
    pub campaign_id: Option<EntityId>,
    pub first_name:  String,
    pub last_name:   String,
    pub phone:       String,
    pub industry:    Option<String>,
    pub location:    Option<String>,
    pub status:      LeadStatus,
    pub reuse_enabled: bool,
}

impl NewLead {
    pub fn new(lead_id: impl Into<LeadId>, first_name: &str, last_name: &str, phone: &str) -> Self {
        Self {
            lead_id:       lead_id.into(),
            campaign_id:   None,
            first_name:    first_name.to_string(),
            last_name:     last_name.to_string(),
            phone:         phone.to_string(),
            industry:      None,
            location:      None,
            status:        LeadStatus::New,
            reuse_enabled: true,
        }
    }

    pub fn in_campaign(mut self, campaign_id: &str) -> Self {
        self.campaign_id = Some(campaign_id.to_string());
        self
    }
}

/// One row of the call-outcome feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub call_id:       EntityId,
    pub lead_id:       LeadId,
    pub agent_id:      Option<EntityId>,
    pub assignment_id: Option<AssignmentId>,
    pub outcome:       CallOutcome,
    pub occurred_at:   Timestamp,
}

/// Filters accepted by bulk assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadFilters {
    pub campaign_id: Option<EntityId>,
    /// Narrows the default {new, retry_pending} set to one of them.
    pub status:      Option<LeadStatus>,
    pub industry:    Option<String>,
    /// Case-insensitive substring match.
    pub location:    Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_stops_are_never_reusable() {
        for outcome in CallOutcome::ALL {
            assert!(
                !(outcome.is_hard_stop() && outcome.is_reusable()),
                "{outcome:?} is both a hard stop and reusable"
            );
        }
    }

    #[test]
    fn outcome_names_round_trip() {
        for outcome in CallOutcome::ALL {
            assert_eq!(CallOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(CallOutcome::parse("hung_up"), None);
    }
}
