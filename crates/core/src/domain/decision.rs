use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::scenario::ScenarioCandidate;
use crate::domain::thread::ThreadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    Send,
    Draft,
    Halt,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "SEND",
            Self::Draft => "DRAFT",
            Self::Halt => "HALT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SEND" => Some(Self::Send),
            "DRAFT" => Some(Self::Draft),
            "HALT" => Some(Self::Halt),
            _ => None,
        }
    }
}

/// Immutable record of one decision. Entries for a thread form a hash chain
/// ordered by `sequence`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub id: DecisionId,
    pub thread_id: ThreadId,
    pub sequence: u32,
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub chosen_candidate: Option<ScenarioCandidate>,
    pub generated_message: Option<String>,
    /// `None` when the policy gate never ran (halts).
    pub policy_compliant: Option<bool>,
    pub prev_hash: String,
    pub entry_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Entry contents before the chain assigns sequence and hashes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionDraft {
    pub thread_id: ThreadId,
    pub decision_type: DecisionType,
    pub reasoning: Vec<String>,
    pub chosen_candidate: Option<ScenarioCandidate>,
    pub generated_message: Option<String>,
    pub policy_compliant: Option<bool>,
}

impl DecisionDraft {
    pub fn reasoning_text(&self) -> String {
        self.reasoning.join("\n")
    }
}
