use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::decision::DecisionType;
use crate::domain::policy::AgentPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Send,
    Draft,
}

impl DispatchMode {
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Self::Send => DecisionType::Send,
            Self::Draft => DecisionType::Draft,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Sandbox,
    NonCompliantMargin,
    AutoSend,
    ManualReview,
}

impl GateReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox mode forces draft",
            Self::NonCompliantMargin => "anchor margin below policy requirement; forced draft",
            Self::AutoSend => "policy allows auto-send",
            Self::ManualReview => "auto-send disabled; drafted for review",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub mode: DispatchMode,
    pub reason: GateReason,
    pub policy_compliant: bool,
    /// `None` when the floor is not positive.
    pub margin_pct: Option<Decimal>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyGate;

impl PolicyGate {
    pub fn margin_pct(anchor_rate: Decimal, floor_rate: Decimal) -> Option<Decimal> {
        if floor_rate <= Decimal::ZERO {
            return None;
        }
        Some((anchor_rate - floor_rate) / floor_rate * Decimal::ONE_HUNDRED)
    }

    pub fn evaluate(
        &self,
        policy: &AgentPolicy,
        anchor_rate: Decimal,
        floor_rate: Decimal,
    ) -> GateDecision {
        let margin_pct = Self::margin_pct(anchor_rate, floor_rate);
        let policy_compliant = margin_pct.is_some_and(|margin| margin >= policy.required_margin_pct);

        let (mode, reason) = if policy.sandbox_mode {
            (DispatchMode::Draft, GateReason::Sandbox)
        } else if !policy_compliant {
            (DispatchMode::Draft, GateReason::NonCompliantMargin)
        } else if policy.auto_send_negotiation {
            (DispatchMode::Send, GateReason::AutoSend)
        } else {
            (DispatchMode::Draft, GateReason::ManualReview)
        };

        GateDecision { mode, reason, policy_compliant, margin_pct }
    }
}
