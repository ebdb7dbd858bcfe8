//! Reuse policy — per-tenant recycling configuration and the eligibility
//! rule derived from it.
//!
//! The rule is pure: the store evaluates it against a lead's current
//! state inside the same transaction that performs the reuse, so the
//! decision and the write can never disagree.

use crate::{
    error::{EngineError, EngineResult},
    lead::{CallOutcome, Lead},
    types::{AssignmentId, EntityId, Timestamp},
};
use chrono::{Datelike, Duration, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

pub const MAX_REUSE_ATTEMPTS_LIMIT: u32 = 10;
pub const MAX_REUSE_DELAY_HOURS: u32 = 168;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub const WEEKDAYS: [Day; 5] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
    ];

    pub fn of(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Monday,
            Weekday::Tue => Self::Tuesday,
            Weekday::Wed => Self::Wednesday,
            Weekday::Thu => Self::Thursday,
            Weekday::Fri => Self::Friday,
            Weekday::Sat => Self::Saturday,
            Weekday::Sun => Self::Sunday,
        }
    }
}

/// When automatic reuse may run. Times are "HH:MM" in UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub enabled:    bool,
    pub start_time: String,
    pub end_time:   String,
    pub days:       Vec<Day>,
}

impl TimeWindow {
    pub fn business_hours() -> Self {
        Self {
            enabled:    true,
            start_time: "09:00".to_string(),
            end_time:   "17:00".to_string(),
            days:       Day::WEEKDAYS.to_vec(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let start = parse_hhmm(&self.start_time)
            .ok_or_else(|| EngineError::validation("time_window.start_time", "expected HH:MM"))?;
        let end = parse_hhmm(&self.end_time)
            .ok_or_else(|| EngineError::validation("time_window.end_time", "expected HH:MM"))?;
        if start == end {
            return Err(EngineError::validation("time_window.end_time", "must differ from start_time"));
        }
        if self.enabled && self.days.is_empty() {
            return Err(EngineError::validation("time_window.days", "at least one day is required"));
        }
        Ok(())
    }

    /// Start inclusive, end exclusive. A window whose end precedes its start
    /// wraps past midnight and belongs to the day it opened on.
    pub fn contains(&self, at: Timestamp) -> bool {
        if !self.enabled {
            return true;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&self.start_time), parse_hhmm(&self.end_time)) else {
            return false;
        };
        let time = at.time();
        let today = Day::of(at.weekday());
        if start <= end {
            self.days.contains(&today) && time >= start && time < end
        } else if time >= start {
            self.days.contains(&today)
        } else {
            let yesterday = Day::of(at.weekday().pred());
            time < end && self.days.contains(&yesterday)
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReusePolicy {
    pub auto_reuse_enabled: bool,
    pub max_reuse_attempts: u32,
    pub reuse_delay_hours:  u32,
    pub trigger_outcomes:   Vec<CallOutcome>,
    pub time_window:        Option<TimeWindow>,
}

impl Default for ReusePolicy {
    fn default() -> Self {
        Self {
            auto_reuse_enabled: true,
            max_reuse_attempts: 3,
            reuse_delay_hours:  24,
            trigger_outcomes:   vec![CallOutcome::NoAnswer, CallOutcome::Busy, CallOutcome::Missed],
            time_window:        Some(TimeWindow::business_hours()),
        }
    }
}

impl ReusePolicy {
    /// Bounds an operator update must satisfy.
    pub fn validate(&self) -> EngineResult<()> {
        if !(1..=MAX_REUSE_ATTEMPTS_LIMIT).contains(&self.max_reuse_attempts) {
            return Err(EngineError::validation(
                "max_reuse_attempts",
                format!("must be between 1 and {MAX_REUSE_ATTEMPTS_LIMIT}"),
            ));
        }
        if !(1..=MAX_REUSE_DELAY_HOURS).contains(&self.reuse_delay_hours) {
            return Err(EngineError::validation(
                "reuse_delay_hours",
                format!("must be between 1 and {MAX_REUSE_DELAY_HOURS}"),
            ));
        }
        if self.trigger_outcomes.is_empty() {
            return Err(EngineError::validation("trigger_outcomes", "at least one outcome is required"));
        }
        if let Some(bad) = self.trigger_outcomes.iter().find(|o| !o.is_reusable()) {
            return Err(EngineError::validation(
                "trigger_outcomes",
                format!("'{}' can never trigger reuse", bad.as_str()),
            ));
        }
        if let Some(window) = &self.time_window {
            window.validate()?;
        }
        Ok(())
    }

    /// Configured triggers with anything unreachable-by-design removed.
    /// Applied on every read, whatever the row says.
    pub fn effective_triggers(&self) -> Vec<CallOutcome> {
        let mut triggers: Vec<CallOutcome> = self
            .trigger_outcomes
            .iter()
            .copied()
            .filter(|o| o.is_reusable() && !o.is_hard_stop())
            .collect();
        triggers.sort();
        triggers.dedup();
        triggers
    }

    pub fn cooldown(&self) -> Duration {
        Duration::hours(i64::from(self.reuse_delay_hours.max(1)))
    }

    /// Automatic runs only. Manual reuse ignores the window.
    pub fn window_allows(&self, now: Timestamp) -> bool {
        self.time_window.as_ref().map_or(true, |w| w.contains(now))
    }

    pub fn rule(&self) -> ReuseRule {
        ReuseRule {
            max_attempts: self.max_reuse_attempts.max(1),
            cooldown:     self.cooldown(),
            triggers:     self.effective_triggers(),
        }
    }
}

/// The most recent call against a lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastCall {
    pub call_id:       EntityId,
    pub outcome:       CallOutcome,
    pub occurred_at:   Timestamp,
    pub assignment_id: Option<AssignmentId>,
}

/// Everything the rule looks at for one lead.
#[derive(Debug, Clone)]
pub struct LeadReuseState {
    pub lead:            Lead,
    pub last_call:       Option<LastCall>,
    pub open_assignment: Option<AssignmentId>,
}

/// Why a lead was not recycled.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReuseSkip {
    #[error("lead not found")]
    LeadNotFound,
    #[error("reuse is disabled for this lead")]
    ReuseDisabled,
    #[error("reuse attempts exhausted ({reuse_count}/{max_attempts})")]
    AttemptsExhausted { reuse_count: u32, max_attempts: u32 },
    #[error("lead has no recorded call outcome")]
    NoCallOutcome,
    #[error("last outcome '{}' does not trigger reuse", .outcome.as_str())]
    OutcomeNotEligible { outcome: CallOutcome },
    #[error("cooldown active until {eligible_at}")]
    CooldownActive { eligible_at: Timestamp },
    #[error("lead already has an open assignment")]
    HasOpenAssignment,
    #[error("no available agents for reassignment")]
    NoAvailableAgent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReuseRule {
    pub max_attempts: u32,
    pub cooldown:     Duration,
    pub triggers:     Vec<CallOutcome>,
}

impl ReuseRule {
    /// Events at or before this instant have cooled down.
    pub fn cutoff(&self, now: Timestamp) -> Timestamp {
        now - self.cooldown
    }

    pub fn evaluate(&self, state: &LeadReuseState, now: Timestamp) -> Result<(), ReuseSkip> {
        let lead = &state.lead;
        if !lead.reuse_enabled {
            return Err(ReuseSkip::ReuseDisabled);
        }
        if lead.reuse_count >= self.max_attempts {
            return Err(ReuseSkip::AttemptsExhausted {
                reuse_count:  lead.reuse_count,
                max_attempts: self.max_attempts,
            });
        }
        if state.open_assignment.is_some() {
            return Err(ReuseSkip::HasOpenAssignment);
        }
        let call = state.last_call.as_ref().ok_or(ReuseSkip::NoCallOutcome)?;
        if !self.triggers.contains(&call.outcome) {
            return Err(ReuseSkip::OutcomeNotEligible { outcome: call.outcome });
        }

        let cutoff = self.cutoff(now);
        let latest_event = match lead.last_reuse_at {
            Some(reused) if reused > call.occurred_at => reused,
            _ => call.occurred_at,
        };
        if latest_event > cutoff {
            return Err(ReuseSkip::CooldownActive {
                eligible_at: latest_event + self.cooldown,
            });
        }
        Ok(())
    }
}
