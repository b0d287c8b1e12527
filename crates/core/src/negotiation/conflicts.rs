//! Candidate validation against the talent's existing commitments.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::commitment::{Commitment, CommitmentId};
use crate::domain::scenario::ScenarioCandidate;
use crate::domain::thread::{DealTerms, TalentId};

/// Counters under this share of the category's average rate raise a warning.
pub const LOW_BALL_RATIO: Decimal = Decimal::from_parts(6, 0, 0, false, 1);

/// Read-only view of one talent's commitments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitmentLedger {
    talent_id: Option<TalentId>,
    commitments: Vec<Commitment>,
}

impl CommitmentLedger {
    pub fn new(talent_id: TalentId, commitments: Vec<Commitment>) -> Self {
        let commitments =
            commitments.into_iter().filter(|commitment| commitment.talent_id == talent_id).collect();
        Self { talent_id: Some(talent_id), commitments }
    }

    pub fn talent_id(&self) -> Option<&TalentId> {
        self.talent_id.as_ref()
    }

    pub fn commitments(&self) -> &[Commitment] {
        &self.commitments
    }

    pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a Commitment> {
        self.commitments.iter().filter(move |commitment| commitment.same_category(category))
    }

    /// Mean rate of same-category commitments that had started by `as_of`.
    pub fn trailing_average_rate(&self, category: &str, as_of: NaiveDate) -> Option<Decimal> {
        let rates: Vec<Decimal> = self
            .in_category(category)
            .filter(|commitment| commitment.start_date <= as_of)
            .map(|commitment| commitment.rate)
            .collect();
        if rates.is_empty() {
            return None;
        }
        let total: Decimal = rates.iter().copied().sum();
        Some(total / Decimal::from(rates.len()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Exclusivity,
    DateOverlap,
    PricingAnomaly,
}

impl ConflictKind {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::PricingAnomaly)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFinding {
    pub kind: ConflictKind,
    pub commitment_id: Option<CommitmentId>,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "findings", rename_all = "snake_case")]
pub enum ConflictVerdict {
    Clear,
    Blocked(Vec<ConflictFinding>),
    ClearWithWarning(Vec<ConflictFinding>),
}

impl ConflictVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    pub fn findings(&self) -> &[ConflictFinding] {
        match self {
            Self::Clear => &[],
            Self::Blocked(findings) | Self::ClearWithWarning(findings) => findings,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngagementWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl EngagementWindow {
    pub fn implied(terms: &DealTerms, candidate: &ScenarioCandidate, today: NaiveDate) -> Self {
        let start = terms.proposed_start.unwrap_or_else(|| {
            today + Duration::days(i64::from(candidate.predicted_close_days))
        });
        let end = start + Duration::days(i64::from(terms.campaign_days));
        Self { start, end }
    }

    pub fn overlaps(&self, commitment: &Commitment) -> bool {
        self.start <= commitment.end_date && commitment.start_date <= self.end
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn check(
        &self,
        terms: &DealTerms,
        candidate: &ScenarioCandidate,
        ledger: &CommitmentLedger,
        policy_buffer_days: u32,
        today: NaiveDate,
    ) -> ConflictVerdict {
        let window = EngagementWindow::implied(terms, candidate, today);
        let mut blocking = Vec::new();

        for commitment in ledger.commitments() {
            if commitment.same_category(&terms.category) {
                let buffer = commitment.exclusivity_buffer_days.max(policy_buffer_days);
                let exclusive_until = commitment.end_date + Duration::days(i64::from(buffer));
                if exclusive_until >= window.start {
                    blocking.push(ConflictFinding {
                        kind: ConflictKind::Exclusivity,
                        commitment_id: Some(commitment.id.clone()),
                        detail: format!(
                            "{} holds {} exclusivity until {exclusive_until}; implied start {}",
                            commitment.brand_name, commitment.category, window.start
                        ),
                    });
                }
            }
            if window.overlaps(commitment) {
                blocking.push(ConflictFinding {
                    kind: ConflictKind::DateOverlap,
                    commitment_id: Some(commitment.id.clone()),
                    detail: format!(
                        "window {}..{} overlaps {} ({}..{})",
                        window.start,
                        window.end,
                        commitment.brand_name,
                        commitment.start_date,
                        commitment.end_date
                    ),
                });
            }
        }

        if !blocking.is_empty() {
            return ConflictVerdict::Blocked(blocking);
        }

        match ledger.trailing_average_rate(&terms.category, today) {
            Some(average) if candidate.predicted_counter < average * LOW_BALL_RATIO => {
                ConflictVerdict::ClearWithWarning(vec![ConflictFinding {
                    kind: ConflictKind::PricingAnomaly,
                    commitment_id: None,
                    detail: format!(
                        "predicted counter {} is below 60% of the {} average {}",
                        candidate.predicted_counter,
                        terms.category,
                        average.round_dp(2)
                    ),
                }])
            }
            _ => ConflictVerdict::Clear,
        }
    }
}
