use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TalentId(pub String);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TalentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted pipeline state of a negotiation thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStage {
    Open,
    Simulated,
    Decided,
    Dispatched,
    FollowUpScheduled,
    Replied,
    FollowUpFired,
    Halted,
}

impl ThreadStage {
    pub const ALL: [ThreadStage; 8] = [
        Self::Open,
        Self::Simulated,
        Self::Decided,
        Self::Dispatched,
        Self::FollowUpScheduled,
        Self::Replied,
        Self::FollowUpFired,
        Self::Halted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Simulated => "simulated",
            Self::Decided => "decided",
            Self::Dispatched => "dispatched",
            Self::FollowUpScheduled => "followup_scheduled",
            Self::Replied => "replied",
            Self::FollowUpFired => "followup_fired",
            Self::Halted => "halted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "simulated" => Some(Self::Simulated),
            "decided" => Some(Self::Decided),
            "dispatched" => Some(Self::Dispatched),
            "followup_scheduled" => Some(Self::FollowUpScheduled),
            "replied" => Some(Self::Replied),
            "followup_fired" => Some(Self::FollowUpFired),
            "halted" => Some(Self::Halted),
            _ => None,
        }
    }

    /// Stages a decision cycle may start from.
    pub fn starts_cycle(&self) -> bool {
        matches!(self, Self::Open | Self::FollowUpFired)
    }
}

impl fmt::Display for ThreadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commercial terms the pipeline negotiates against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealTerms {
    pub initial_offer: Option<Decimal>,
    pub floor_rate: Decimal,
    pub target_rate: Decimal,
    pub deliverables: Vec<String>,
    pub creator_tier: String,
    pub category: String,
    pub proposed_start: Option<NaiveDate>,
    pub campaign_days: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationThread {
    pub id: ThreadId,
    pub talent_id: TalentId,
    pub brand_name: String,
    pub brand_email: String,
    pub subject_root: String,
    pub stage: ThreadStage,
    pub stage_version: u32,
    pub terms: DealTerms,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optimistic guard captured when a thread is read; a stage write only lands
/// if the persisted row still carries both values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGuard {
    pub stage: ThreadStage,
    pub stage_version: u32,
}

impl NegotiationThread {
    pub fn guard(&self) -> StageGuard {
        StageGuard { stage: self.stage, stage_version: self.stage_version }
    }

    pub fn reply_subject(&self) -> String {
        let root = self.subject_root.trim();
        if root.to_ascii_lowercase().starts_with("re:") {
            root.to_string()
        } else {
            format!("Re: {root}")
        }
    }
}
