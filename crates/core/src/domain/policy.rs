use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::thread::TalentId;

/// Per-talent autonomy settings. Read once per decision cycle and passed
/// down to every engine that needs it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub talent_id: TalentId,
    pub sandbox_mode: bool,
    pub auto_send_negotiation: bool,
    pub required_margin_pct: Decimal,
    pub exclusivity_buffer_days: u32,
    pub negotiation_ceiling_pct: Option<Decimal>,
    /// Voice the reply oracle should write in.
    pub persona: Option<String>,
}

impl AgentPolicy {
    /// Policy used when a talent has none stored: nothing is ever sent.
    pub fn safe_default(talent_id: TalentId) -> Self {
        Self {
            talent_id,
            sandbox_mode: true,
            auto_send_negotiation: false,
            required_margin_pct: Decimal::ZERO,
            exclusivity_buffer_days: 0,
            negotiation_ceiling_pct: None,
            persona: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AgentPolicy;
    use crate::domain::thread::TalentId;

    #[test]
    fn safe_default_never_auto_sends() {
        let policy = AgentPolicy::safe_default(TalentId("talent-1".to_string()));
        assert!(policy.sandbox_mode);
        assert!(!policy.auto_send_negotiation);
        assert!(policy.negotiation_ceiling_pct.is_none());
    }
}
