use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::message::{MessageSender, NegotiationMessage};
use crate::domain::thread::{NegotiationThread, TalentId, ThreadId};

/// Acceptance likelihood assigned to a candidate whose prediction failed.
pub const NEUTRAL_ACCEPTANCE: f64 = 0.5;
/// Close horizon assigned to a candidate whose prediction failed.
pub const NEUTRAL_CLOSE_DAYS: u32 = 14;

const HISTORY_WINDOW: usize = 12;

/// Negotiation strategy template. Declaration order is the canonical
/// generation order and the last-resort tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Balanced,
    Aggressive,
    Collaborative,
}

impl Archetype {
    pub const ALL: [Archetype; 3] = [Self::Balanced, Self::Aggressive, Self::Collaborative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
            Self::Collaborative => "collaborative",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "balanced" => Some(Self::Balanced),
            "aggressive" => Some(Self::Aggressive),
            "collaborative" => Some(Self::Collaborative),
            _ => None,
        }
    }

    pub fn anchor_multiplier(&self) -> Decimal {
        match self {
            Self::Balanced => Decimal::ONE,
            Self::Aggressive => Decimal::new(120, 2),
            Self::Collaborative => Decimal::new(90, 2),
        }
    }

    pub fn tone_hint(&self) -> &'static str {
        match self {
            Self::Balanced => "confident and fair; hold the target rate while signalling flexibility on scope",
            Self::Aggressive => "firm and premium; lead with audience value and anchor high",
            Self::Collaborative => "warm and partnership-minded; trade a softer rate for a faster close",
        }
    }

    /// Distance from the canonical Balanced archetype, measured on anchor
    /// multipliers.
    pub fn balance_distance(&self) -> Decimal {
        (self.anchor_multiplier() - Self::Balanced.anchor_multiplier()).abs()
    }

    pub fn list_position(&self) -> usize {
        Self::ALL.iter().position(|archetype| archetype == self).unwrap_or(Self::ALL.len())
    }

    /// Opening ask for this archetype: target rate scaled by the multiplier,
    /// capped by the policy ceiling over the brand's initial offer.
    pub fn anchor_rate(
        &self,
        target_rate: Decimal,
        initial_offer: Option<Decimal>,
        ceiling_pct: Option<Decimal>,
    ) -> Decimal {
        let mut anchor = (target_rate * self.anchor_multiplier()).round_dp(2);
        if let (Some(offer), Some(ceiling)) = (initial_offer, ceiling_pct) {
            if offer > Decimal::ZERO {
                let cap = (offer * (Decimal::ONE + ceiling / Decimal::ONE_HUNDRED)).round_dp(2);
                anchor = anchor.min(cap);
            }
        }
        anchor
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLine {
    pub sender: MessageSender,
    pub body: String,
}

/// Everything the outcome oracle sees about a deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealContext {
    pub thread_id: ThreadId,
    pub talent_id: TalentId,
    pub brand_name: String,
    pub initial_offer: Option<Decimal>,
    pub floor_rate: Decimal,
    pub target_rate: Decimal,
    pub deliverables: Vec<String>,
    pub creator_tier: String,
    pub category: String,
    pub round_number: u32,
    pub history: Vec<HistoryLine>,
}

impl DealContext {
    /// Builds the oracle context from the thread and its ordered history,
    /// keeping only the most recent messages.
    pub fn from_thread(thread: &NegotiationThread, messages: &[NegotiationMessage]) -> Self {
        let skip = messages.len().saturating_sub(HISTORY_WINDOW);
        let history = messages
            .iter()
            .skip(skip)
            .map(|message| HistoryLine { sender: message.sender, body: message.body.clone() })
            .collect();
        let round_number = u32::try_from(messages.len().div_ceil(2)).unwrap_or(u32::MAX).max(1);

        Self {
            thread_id: thread.id.clone(),
            talent_id: thread.talent_id.clone(),
            brand_name: thread.brand_name.clone(),
            initial_offer: thread.terms.initial_offer,
            floor_rate: thread.terms.floor_rate,
            target_rate: thread.terms.target_rate,
            deliverables: thread.terms.deliverables.clone(),
            creator_tier: thread.terms.creator_tier.clone(),
            category: thread.terms.category.clone(),
            round_number,
            history,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomePrediction {
    pub predicted_counter: Decimal,
    pub acceptance_likelihood: f64,
    pub predicted_close_days: u32,
    pub confidence: f64,
    pub script_stub: String,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum InvalidPrediction {
    #[error("acceptance likelihood {0} is outside [0, 1]")]
    AcceptanceOutOfRange(f64),
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("predicted counter {0} is negative")]
    NegativeCounter(Decimal),
}

impl OutcomePrediction {
    pub fn validate(&self) -> Result<(), InvalidPrediction> {
        if !(0.0..=1.0).contains(&self.acceptance_likelihood) {
            return Err(InvalidPrediction::AcceptanceOutOfRange(self.acceptance_likelihood));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(InvalidPrediction::ConfidenceOutOfRange(self.confidence));
        }
        if self.predicted_counter < Decimal::ZERO {
            return Err(InvalidPrediction::NegativeCounter(self.predicted_counter));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCandidate {
    pub thread_id: ThreadId,
    pub archetype: Archetype,
    pub anchor_rate: Decimal,
    pub predicted_counter: Decimal,
    pub acceptance_likelihood: f64,
    pub predicted_close_days: u32,
    pub confidence: f64,
    pub script_stub: String,
    /// Set when the prediction failed and the neutral default stands in.
    pub degraded_reason: Option<String>,
    pub score: f64,
}

impl ScenarioCandidate {
    pub fn from_prediction(
        thread_id: ThreadId,
        archetype: Archetype,
        anchor_rate: Decimal,
        prediction: OutcomePrediction,
    ) -> Self {
        Self {
            thread_id,
            archetype,
            anchor_rate,
            predicted_counter: prediction.predicted_counter,
            acceptance_likelihood: prediction.acceptance_likelihood,
            predicted_close_days: prediction.predicted_close_days,
            confidence: prediction.confidence,
            script_stub: prediction.script_stub,
            degraded_reason: None,
            score: 0.0,
        }
    }

    pub fn neutral(
        thread_id: ThreadId,
        archetype: Archetype,
        anchor_rate: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            thread_id,
            archetype,
            anchor_rate,
            predicted_counter: anchor_rate,
            acceptance_likelihood: NEUTRAL_ACCEPTANCE,
            predicted_close_days: NEUTRAL_CLOSE_DAYS,
            confidence: 0.0,
            script_stub: String::new(),
            degraded_reason: Some(reason.into()),
            score: 0.0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }
}
