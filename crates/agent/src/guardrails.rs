use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::oracle::ComposedReply;

const CURRENCY_SYMBOLS: [char; 3] = ['£', '$', '€'];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReplyViolation {
    #[error("reply body is empty")]
    EmptyBody,
    #[error("reply quotes {quoted}, below the floor rate {floor}")]
    RateBelowFloor { quoted: Decimal, floor: Decimal },
}

impl ReplyViolation {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyBody => "empty_body",
            Self::RateBelowFloor { .. } => "rate_below_floor",
        }
    }
}

/// Checks oracle-written text before it can leave the system. The oracle
/// only words the reply; it never gets to undercut the floor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyGuardrail {
    floor_rate: Decimal,
}

impl ReplyGuardrail {
    pub fn new(floor_rate: Decimal) -> Self {
        Self { floor_rate }
    }

    pub fn check(&self, reply: &ComposedReply) -> Result<(), ReplyViolation> {
        if reply.body.trim().is_empty() {
            return Err(ReplyViolation::EmptyBody);
        }

        let text = format!("{}\n{}", reply.subject, reply.body);
        if let Some(quoted) =
            quoted_amounts(&text).into_iter().filter(|amount| *amount < self.floor_rate).min()
        {
            return Err(ReplyViolation::RateBelowFloor { quoted, floor: self.floor_rate });
        }
        Ok(())
    }
}

/// Every currency-prefixed amount in `text`, e.g. `£1,250`, `$2.5k`, `€900`.
pub fn quoted_amounts(text: &str) -> Vec<Decimal> {
    let mut amounts = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(character) = chars.next() {
        if !CURRENCY_SYMBOLS.contains(&character) {
            continue;
        }
        while chars.peek() == Some(&' ') {
            chars.next();
        }

        let mut raw = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == ',' || next == '.' {
                raw.push(next);
                chars.next();
            } else {
                break;
            }
        }

        let multiplier = match chars.peek() {
            Some('k' | 'K') => {
                chars.next();
                Decimal::ONE_THOUSAND
            }
            _ => Decimal::ONE,
        };

        if let Some(amount) = parse_amount(&raw) {
            amounts.push(amount * multiplier);
        }
    }

    amounts
}

fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String =
        raw.trim_end_matches(['.', ',']).chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{quoted_amounts, ReplyGuardrail, ReplyViolation};
    use crate::oracle::ComposedReply;

    fn reply(body: &str) -> ComposedReply {
        ComposedReply { subject: "Re: Spring launch".to_string(), body: body.to_string() }
    }

    #[test]
    fn finds_amounts_in_common_notations() {
        let amounts = quoted_amounts("We can do £1,500. Or $2.5k, maybe € 900, but not 3 stories.");
        assert_eq!(
            amounts,
            vec![Decimal::new(1500, 0), Decimal::new(2500, 0), Decimal::new(900, 0)]
        );
    }

    #[test]
    fn empty_body_is_rejected() {
        let guardrail = ReplyGuardrail::new(Decimal::new(1000, 0));
        assert_eq!(guardrail.check(&reply("   \n")), Err(ReplyViolation::EmptyBody));
    }

    #[test]
    fn quote_below_floor_is_rejected() {
        let guardrail = ReplyGuardrail::new(Decimal::new(1000, 0));
        let violation = guardrail
            .check(&reply("Happy to meet you at £1,500, or £950 if you add a story."))
            .expect_err("£950 is under the floor");
        assert_eq!(
            violation,
            ReplyViolation::RateBelowFloor {
                quoted: Decimal::new(950, 0),
                floor: Decimal::new(1000, 0)
            }
        );
        assert_eq!(violation.reason_code(), "rate_below_floor");
    }

    #[test]
    fn reply_at_or_above_floor_passes() {
        let guardrail = ReplyGuardrail::new(Decimal::new(1000, 0));
        assert!(guardrail.check(&reply("Our rate for the package is £1,000.")).is_ok());
        assert!(guardrail.check(&reply("Thanks, we'll confirm dates shortly.")).is_ok());
    }
}
