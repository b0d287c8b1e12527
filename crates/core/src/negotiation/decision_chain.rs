//! Per-thread hash chain over decision-log entries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::decision::{DecisionDraft, DecisionId, DecisionLogEntry, DecisionType};
use crate::domain::scenario::ScenarioCandidate;
use crate::domain::thread::ThreadId;

/// `prev_hash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub thread_id: ThreadId,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Serialize)]
struct HashMaterial<'a> {
    thread_id: &'a str,
    sequence: u32,
    decision_type: &'a str,
    reasoning: &'a str,
    chosen_candidate: Option<&'a ScenarioCandidate>,
    generated_message: Option<&'a str>,
    policy_compliant: Option<bool>,
    prev_hash: &'a str,
    created_at: String,
}

/// Seals a draft onto the end of a chain whose last entry is `previous`.
pub fn seal(
    draft: DecisionDraft,
    previous: Option<&DecisionLogEntry>,
    created_at: DateTime<Utc>,
) -> DecisionLogEntry {
    let sequence = previous.map_or(1, |entry| entry.sequence.saturating_add(1));
    let prev_hash = previous.map_or_else(|| GENESIS_HASH.to_string(), |entry| entry.entry_hash.clone());
    let reasoning = draft.reasoning_text();

    let mut entry = DecisionLogEntry {
        id: DecisionId(Uuid::new_v4().to_string()),
        thread_id: draft.thread_id,
        sequence,
        decision_type: draft.decision_type,
        reasoning,
        chosen_candidate: draft.chosen_candidate,
        generated_message: draft.generated_message,
        policy_compliant: draft.policy_compliant,
        prev_hash,
        entry_hash: String::new(),
        created_at,
    };
    entry.entry_hash = entry_hash(&entry);
    entry
}

pub fn entry_hash(entry: &DecisionLogEntry) -> String {
    let material = HashMaterial {
        thread_id: &entry.thread_id.0,
        sequence: entry.sequence,
        decision_type: entry.decision_type.as_str(),
        reasoning: &entry.reasoning,
        chosen_candidate: entry.chosen_candidate.as_ref(),
        generated_message: entry.generated_message.as_deref(),
        policy_compliant: entry.policy_compliant,
        prev_hash: &entry.prev_hash,
        created_at: entry.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
    };
    let canonical = serde_json::to_vec(&material).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

/// Verifies entries ordered by sequence.
pub fn verify(thread_id: &ThreadId, entries: &[DecisionLogEntry]) -> ChainVerification {
    let failure = |index: usize, latest: Option<String>, reason: String| ChainVerification {
        thread_id: thread_id.clone(),
        valid: false,
        verified_entries: index,
        latest_hash: latest,
        failure_reason: Some(reason),
    };

    let mut previous_hash: Option<String> = None;
    for (index, entry) in entries.iter().enumerate() {
        let expected_sequence = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
        if entry.sequence != expected_sequence {
            return failure(
                index,
                previous_hash,
                format!(
                    "sequence mismatch at entry {}: expected {expected_sequence}, found {}",
                    entry.id.0, entry.sequence
                ),
            );
        }

        let expected_prev = previous_hash.as_deref().unwrap_or(GENESIS_HASH);
        if entry.prev_hash != expected_prev {
            return failure(
                index,
                previous_hash,
                format!("previous hash mismatch at entry {}", entry.id.0),
            );
        }

        if !is_well_formed(entry) {
            return failure(index, previous_hash, format!("halt entry {} carries a message", entry.id.0));
        }

        if entry_hash(entry) != entry.entry_hash {
            return failure(index, previous_hash, format!("entry hash mismatch at entry {}", entry.id.0));
        }

        previous_hash = Some(entry.entry_hash.clone());
    }

    ChainVerification {
        thread_id: thread_id.clone(),
        valid: true,
        verified_entries: entries.len(),
        latest_hash: previous_hash,
        failure_reason: None,
    }
}

/// Halt entries never carry a message; anything else is a corrupt log.
pub fn is_well_formed(entry: &DecisionLogEntry) -> bool {
    entry.decision_type != DecisionType::Halt || entry.generated_message.is_none()
}
