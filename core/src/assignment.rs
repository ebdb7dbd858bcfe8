//! Assignment Ledger records and the assignment state machine.
//!
//!   pending ──► in_progress ──► completed
//!      │             │
//!      ├─────────────┴──► cancelled
//!      └─────────────┴──► expired      (system only)
//!
//! RULE: at most one open (pending | in_progress) assignment per lead.
//! An open assignment past `expires_at` is stale: it no longer holds the
//! lead, cannot be worked, and is expired by whichever writer meets it first.
//! Rows are never deleted; terminal rows are the audit trail.

use crate::types::{AgentId, AssignmentId, LeadId, TenantId, Timestamp, UserId};
use chrono::{Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending    => "pending",
            Self::InProgress => "in_progress",
            Self::Completed  => "completed",
            Self::Cancelled  => "cancelled",
            Self::Expired    => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending"     => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed"   => Some(Self::Completed),
            "cancelled"   => Some(Self::Cancelled),
            "expired"     => Some(Self::Expired),
            _ => None,
        }
    }

    /// Counts toward the lead's claim and the agent's load.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Transitions a caller may request. Expiry is reserved for the reaper.
    pub fn can_transition_to(&self, next: AssignmentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending | Self::InProgress, Self::Completed)
                | (Self::Pending | Self::InProgress, Self::Cancelled)
        )
    }

    /// Transitions the expiry reaper may apply.
    pub fn can_expire(&self) -> bool {
        self.is_open()
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created an assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum AssignedBy {
    Operator(UserId),
    SystemReuse,
}

impl AssignedBy {
    const SYSTEM: &'static str = "system";
    const OPERATOR_PREFIX: &'static str = "operator:";

    /// Column encoding: "system" or "operator:<user id>".
    pub fn encode(&self) -> String {
        match self {
            Self::Operator(id) => format!("{}{id}", Self::OPERATOR_PREFIX),
            Self::SystemReuse  => Self::SYSTEM.to_string(),
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        if s == Self::SYSTEM {
            return Some(Self::SystemReuse);
        }
        s.strip_prefix(Self::OPERATOR_PREFIX)
            .map(|id| Self::Operator(id.to_string()))
    }

    /// Label written to the audit log.
    pub fn actor_label(&self) -> &str {
        match self {
            Self::Operator(id) => id,
            Self::SystemReuse  => Self::SYSTEM,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub assignment_id: AssignmentId,
    pub tenant_id:     TenantId,
    pub lead_id:       LeadId,
    pub agent_id:      AgentId,
    pub assigned_by:   AssignedBy,
    pub status:        AssignmentStatus,
    pub assigned_at:   Timestamp,
    pub expires_at:    Timestamp,
    pub updated_at:    Timestamp,
}

impl Assignment {
    /// Open but past its deadline.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.status.is_open() && self.expires_at <= now
    }
}

/// Everything the ledger needs to open a claim.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub tenant_id:   TenantId,
    pub lead_id:     LeadId,
    pub agent_id:    AgentId,
    pub assigned_by: AssignedBy,
    pub expires_at:  Timestamp,
}

/// A lead that could not be claimed because somebody already holds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadConflict {
    pub lead_id:       LeadId,
    pub lead_name:     String,
    pub assignment_id: AssignmentId,
    pub held_by:       AgentId,
    pub held_by_name:  String,
}

/// Result of assigning an explicit list of leads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignBatch {
    pub assignments: Vec<Assignment>,
    pub conflicts:   Vec<LeadConflict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkAssignResult {
    pub agent_id:          AgentId,
    pub requested_count:   u32,
    pub assigned_lead_ids: Vec<LeadId>,
    pub assignments:       Vec<Assignment>,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentQuery {
    pub status:      Option<AssignmentStatus>,
    pub campaign_id: Option<String>,
    pub limit:       u32,
    pub offset:      u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatsPeriod {
    Today,
    Last7Days,
    Last30Days,
    All,
}

impl StatsPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1d"  => Some(Self::Today),
            "7d"  => Some(Self::Last7Days),
            "30d" => Some(Self::Last30Days),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Lower bound on `assigned_at`, counted from midnight UTC of `now`'s day.
    pub fn since(&self, now: Timestamp) -> Option<Timestamp> {
        let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(chrono::NaiveTime::MIN));
        match self {
            Self::Today      => Some(midnight),
            Self::Last7Days  => Some(midnight - Duration::days(7)),
            Self::Last30Days => Some(midnight - Duration::days(30)),
            Self::All        => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssignmentStats {
    pub total:              u64,
    pub pending:            u64,
    pub in_progress:        u64,
    pub completed:          u64,
    pub cancelled:          u64,
    pub expired:            u64,
    pub active_agent_count: u64,
    /// Whole percent of assignments completed.
    pub completion_rate:    u32,
}

impl AssignmentStats {
    pub fn with_completion_rate(mut self) -> Self {
        self.completion_rate = if self.total > 0 {
            ((self.completed as f64 / self.total as f64) * 100.0).round() as u32
        } else {
            0
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssignmentStatus::*;

    #[test]
    fn only_documented_transitions_are_legal() {
        let all = [Pending, InProgress, Completed, Cancelled, Expired];
        let legal = [
            (Pending, InProgress),
            (Pending, Completed),
            (InProgress, Completed),
            (Pending, Cancelled),
            (InProgress, Cancelled),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_cannot_expire() {
        assert!(Pending.can_expire());
        assert!(InProgress.can_expire());
        assert!(!Completed.can_expire());
        assert!(!Cancelled.can_expire());
        assert!(!Expired.can_expire());
    }

    #[test]
    fn assigned_by_column_encoding() {
        let op = AssignedBy::Operator("u-17".into());
        assert_eq!(op.encode(), "operator:u-17");
        assert_eq!(AssignedBy::decode("operator:u-17"), Some(op));
        assert_eq!(AssignedBy::decode("system"), Some(AssignedBy::SystemReuse));
        assert_eq!(AssignedBy::decode("u-17"), None);
    }

    #[test]
    fn stats_periods_start_at_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 15, 30, 0).unwrap();
        let today = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap();
        assert_eq!(StatsPeriod::Today.since(now), Some(today));
        assert_eq!(StatsPeriod::Last7Days.since(now), Some(today - Duration::days(7)));
        assert_eq!(StatsPeriod::All.since(now), None);
    }

    #[test]
    fn completion_rate_rounds_to_whole_percent() {
        let stats = AssignmentStats { total: 3, completed: 2, ..Default::default() }
            .with_completion_rate();
        assert_eq!(stats.completion_rate, 67);
    }
}
