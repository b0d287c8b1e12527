use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::scenario::{Archetype, ScenarioCandidate};
use crate::domain::thread::DealTerms;
use crate::negotiation::conflicts::{
    CommitmentLedger, ConflictDetector, ConflictFinding, ConflictVerdict,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockedCandidate {
    pub archetype: Archetype,
    pub score: f64,
    pub findings: Vec<ConflictFinding>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    Chosen {
        candidate: ScenarioCandidate,
        warnings: Vec<ConflictFinding>,
        passed_over: Vec<BlockedCandidate>,
    },
    Halt {
        blocked: Vec<BlockedCandidate>,
    },
}

impl Selection {
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt { .. })
    }

    pub fn chosen(&self) -> Option<&ScenarioCandidate> {
        match self {
            Self::Chosen { candidate, .. } => Some(candidate),
            Self::Halt { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DecisionSelector {
    detector: ConflictDetector,
}

impl DecisionSelector {
    /// Picks the highest-ranked candidate that no commitment blocks.
    /// `ranked` must already be ordered best first.
    pub fn select(
        &self,
        ranked: &[ScenarioCandidate],
        terms: &DealTerms,
        ledger: &CommitmentLedger,
        policy_buffer_days: u32,
        today: NaiveDate,
    ) -> Selection {
        let mut blocked = Vec::new();

        for candidate in ranked {
            match self.detector.check(terms, candidate, ledger, policy_buffer_days, today) {
                ConflictVerdict::Blocked(findings) => blocked.push(BlockedCandidate {
                    archetype: candidate.archetype,
                    score: candidate.score,
                    findings,
                }),
                ConflictVerdict::Clear => {
                    return Selection::Chosen {
                        candidate: candidate.clone(),
                        warnings: Vec::new(),
                        passed_over: blocked,
                    };
                }
                ConflictVerdict::ClearWithWarning(warnings) => {
                    return Selection::Chosen {
                        candidate: candidate.clone(),
                        warnings,
                        passed_over: blocked,
                    };
                }
            }
        }

        Selection::Halt { blocked }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use super::{DecisionSelector, Selection};
    use crate::domain::commitment::{Commitment, CommitmentId};
    use crate::domain::scenario::{Archetype, ScenarioCandidate};
    use crate::domain::thread::{DealTerms, TalentId, ThreadId};
    use crate::negotiation::conflicts::CommitmentLedger;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn terms() -> DealTerms {
        DealTerms {
            initial_offer: None,
            floor_rate: Decimal::new(1000, 0),
            target_rate: Decimal::new(1500, 0),
            deliverables: Vec::new(),
            creator_tier: "mid".to_string(),
            category: "beauty".to_string(),
            proposed_start: None,
            campaign_days: 5,
        }
    }

    fn candidate(archetype: Archetype, days: u32, score: f64) -> ScenarioCandidate {
        ScenarioCandidate {
            thread_id: ThreadId("T-1".to_string()),
            archetype,
            anchor_rate: Decimal::new(1500, 0),
            predicted_counter: Decimal::new(1400, 0),
            acceptance_likelihood: 0.6,
            predicted_close_days: days,
            confidence: 0.6,
            script_stub: String::new(),
            degraded_reason: None,
            score,
        }
    }

    fn ledger_blocking_until(end: NaiveDate) -> CommitmentLedger {
        CommitmentLedger::new(
            TalentId("talent-1".to_string()),
            vec![Commitment {
                id: CommitmentId("c1".to_string()),
                talent_id: TalentId("talent-1".to_string()),
                brand_name: "Glow Co".to_string(),
                category: "fitness".to_string(),
                start_date: date(2026, 3, 1),
                end_date: end,
                exclusivity_buffer_days: 0,
                rate: Decimal::new(1200, 0),
            }],
        )
    }

    #[test]
    fn falls_back_to_lower_ranked_clear_candidate() {
        // Close in 2 days overlaps the commitment; close in 30 days does not.
        let ranked = vec![
            candidate(Archetype::Balanced, 2, 70.0),
            candidate(Archetype::Collaborative, 30, 60.0),
        ];
        let selection = DecisionSelector::default().select(
            &ranked,
            &terms(),
            &ledger_blocking_until(date(2026, 3, 20)),
            0,
            date(2026, 3, 1),
        );

        match selection {
            Selection::Chosen { candidate, passed_over, .. } => {
                assert_eq!(candidate.archetype, Archetype::Collaborative);
                assert_eq!(passed_over.len(), 1);
                assert_eq!(passed_over[0].archetype, Archetype::Balanced);
            }
            Selection::Halt { .. } => panic!("expected a chosen candidate"),
        }
    }

    #[test]
    fn halts_when_every_candidate_is_blocked() {
        let ranked = vec![
            candidate(Archetype::Balanced, 2, 70.0),
            candidate(Archetype::Aggressive, 3, 60.0),
            candidate(Archetype::Collaborative, 4, 50.0),
        ];
        let selection = DecisionSelector::default().select(
            &ranked,
            &terms(),
            &ledger_blocking_until(date(2026, 4, 30)),
            0,
            date(2026, 3, 1),
        );

        assert!(selection.is_halt());
        match selection {
            Selection::Halt { blocked } => assert_eq!(blocked.len(), 3),
            Selection::Chosen { .. } => panic!("expected halt"),
        }
    }
}
