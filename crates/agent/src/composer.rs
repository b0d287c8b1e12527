use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tera::{Context, Tera};
use tracing::warn;

use crate::guardrails::ReplyGuardrail;
use crate::oracle::{ComposedReply, ReplyOracle, ReplyRequest};

const FALLBACK_TEMPLATE: &str = "fallback_reply.txt";
const ORACLE_ATTEMPTS: usize = 2;

/// Reply text for one decision, plus why the template stood in if it did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposedOutcome {
    pub reply: ComposedReply,
    pub fallback_reason: Option<String>,
}

impl ComposedOutcome {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

pub struct ReplyComposer {
    oracle: Arc<dyn ReplyOracle>,
    templates: Tera,
}

impl ReplyComposer {
    pub fn new(oracle: Arc<dyn ReplyOracle>) -> Self {
        let mut templates = Tera::default();
        templates.register_filter("money", money_filter);
        if let Err(error) = templates.add_raw_template(
            FALLBACK_TEMPLATE,
            include_str!("../../../templates/replies/fallback_reply.txt"),
        ) {
            warn!(error = %error, "fallback reply template failed to load; using inline text");
        }
        Self { oracle, templates }
    }

    /// Asks the oracle for text, retrying once on invalid output, then falls
    /// back to the template. Never fails.
    pub async fn compose(&self, request: &ReplyRequest) -> ComposedOutcome {
        let guardrail = ReplyGuardrail::new(request.floor_rate);
        let mut reasons = Vec::new();

        for attempt in 1..=ORACLE_ATTEMPTS {
            match self.oracle.compose(request).await {
                Ok(mut reply) => match guardrail.check(&reply) {
                    Ok(()) => {
                        if reply.subject.trim().is_empty() {
                            reply.subject = request.subject.clone();
                        }
                        return ComposedOutcome { reply, fallback_reason: None };
                    }
                    Err(violation) => {
                        warn!(
                            event_name = "composer.reply_rejected",
                            thread_id = %request.thread_id,
                            attempt,
                            reason_code = violation.reason_code(),
                            "oracle reply failed validation"
                        );
                        reasons.push(violation.to_string());
                    }
                },
                Err(error) => {
                    warn!(
                        event_name = "composer.oracle_failed",
                        thread_id = %request.thread_id,
                        attempt,
                        error = %error,
                        "reply oracle call failed"
                    );
                    reasons.push(error.to_string());
                }
            }
        }

        ComposedOutcome {
            reply: self.fallback(request),
            fallback_reason: Some(format!("templated fallback used: {}", reasons.join("; "))),
        }
    }

    fn fallback(&self, request: &ReplyRequest) -> ComposedReply {
        // The template never quotes under the floor, whatever the anchor.
        let rate = request.anchor_rate.max(request.floor_rate);
        let deliverables = if request.deliverables.is_empty() {
            "the campaign".to_string()
        } else {
            request.deliverables.join(", ")
        };
        let signature = request.persona.clone().unwrap_or_else(|| "The talent team".to_string());

        let mut context = Context::new();
        context.insert("brand_name", &request.brand_name);
        context.insert("deliverables", &deliverables);
        context.insert("rate", &rate.round_dp(2).to_string());
        context.insert("close_days", &request.predicted_close_days);
        context.insert("signature", &signature);

        let body = self.templates.render(FALLBACK_TEMPLATE, &context).unwrap_or_else(|error| {
            warn!(error = %error, "fallback reply template failed to render");
            format!(
                "Hi {} team,\n\nThanks for the details. For {deliverables}, our rate is {}.\n\nBest,\n{signature}",
                request.brand_name,
                format_money(rate),
            )
        });

        ComposedReply { subject: request.subject.clone(), body }
    }
}

/// `£` amount with thousands separators and pence only when present.
pub fn format_money(amount: Decimal) -> String {
    let rounded = amount.round_dp(2);
    let whole = rounded.trunc().abs().normalize().to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let fraction = (rounded.fract().abs() * Decimal::ONE_HUNDRED).round();
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    if fraction.is_zero() {
        format!("{sign}£{grouped}")
    } else {
        format!("{sign}£{grouped}.{:0>2}", fraction.to_string())
    }
}

fn money_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let amount = match value {
        tera::Value::String(raw) => raw.parse::<Decimal>().map_err(|error| {
            tera::Error::msg(format!("money filter could not parse `{raw}`: {error}"))
        })?,
        tera::Value::Number(number) => number
            .to_string()
            .parse::<Decimal>()
            .map_err(|error| tera::Error::msg(format!("money filter: {error}")))?,
        _ => return Err(tera::Error::msg("money filter expects a number or numeric string")),
    };
    Ok(tera::Value::String(format_money(amount)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use parley_core::domain::scenario::Archetype;
    use parley_core::domain::thread::ThreadId;

    use super::{format_money, ReplyComposer};
    use crate::guardrails::quoted_amounts;
    use crate::oracle::{ComposedReply, OracleError, ReplyRequest, ScriptedOracle};

    fn request(anchor: i64) -> ReplyRequest {
        ReplyRequest {
            thread_id: ThreadId("T-COMP-1".to_string()),
            brand_name: "Lumen Skincare".to_string(),
            archetype: Archetype::Balanced,
            tone_hint: Archetype::Balanced.tone_hint().to_string(),
            justification: "highest score".to_string(),
            persona: Some("Ava".to_string()),
            subject: "Re: Spring launch".to_string(),
            anchor_rate: Decimal::new(anchor, 0),
            floor_rate: Decimal::new(1000, 0),
            predicted_close_days: 7,
            deliverables: vec!["1x reel".to_string(), "3x stories".to_string()],
            history: Vec::new(),
        }
    }

    #[test]
    fn money_is_grouped_by_thousands() {
        assert_eq!(format_money(Decimal::new(1500, 0)), "£1,500");
        assert_eq!(format_money(Decimal::new(123456789, 2)), "£1,234,567.89");
        assert_eq!(format_money(Decimal::new(950, 0)), "£950");
    }

    #[tokio::test]
    async fn valid_oracle_reply_is_used_as_is() {
        let oracle = Arc::new(ScriptedOracle::new().with_reply(Ok(ComposedReply {
            subject: String::new(),
            body: "Our rate is £1,500 for the package.".to_string(),
        })));
        let composer = ReplyComposer::new(oracle.clone());

        let outcome = composer.compose(&request(1500)).await;
        assert!(!outcome.used_fallback());
        assert_eq!(outcome.reply.subject, "Re: Spring launch");
        assert_eq!(oracle.compose_calls(), 1);
    }

    #[tokio::test]
    async fn invalid_reply_is_retried_once() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .with_reply(Ok(ComposedReply { subject: "x".to_string(), body: String::new() }))
                .with_reply(Ok(ComposedReply {
                    subject: "Re: Spring launch".to_string(),
                    body: "We can do £1,500.".to_string(),
                })),
        );
        let composer = ReplyComposer::new(oracle.clone());

        let outcome = composer.compose(&request(1500)).await;
        assert!(!outcome.used_fallback());
        assert_eq!(outcome.reply.body, "We can do £1,500.");
        assert_eq!(oracle.compose_calls(), 2);
    }

    #[tokio::test]
    async fn two_bad_replies_fall_back_to_template() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .with_reply(Ok(ComposedReply {
                    subject: "Re: Spring launch".to_string(),
                    body: "Fine, £800 works.".to_string(),
                }))
                .with_reply(Err(OracleError::Unavailable("rate limited".to_string()))),
        );
        let composer = ReplyComposer::new(oracle.clone());

        let outcome = composer.compose(&request(1500)).await;
        let reason = outcome.fallback_reason.clone().expect("fallback reason");
        assert!(reason.contains("below the floor"));
        assert!(reason.contains("rate limited"));
        assert!(outcome.reply.body.contains("Lumen Skincare"));
        assert!(outcome.reply.body.contains("£1,500"));
        assert_eq!(oracle.compose_calls(), 2);
    }

    #[tokio::test]
    async fn fallback_never_quotes_below_floor() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .with_reply(Err(OracleError::Malformed("no json".to_string())))
                .with_reply(Err(OracleError::Malformed("no json".to_string()))),
        );
        let composer = ReplyComposer::new(oracle);

        let outcome = composer.compose(&request(900)).await;
        assert!(outcome.used_fallback());
        assert!(quoted_amounts(&outcome.reply.body)
            .iter()
            .all(|amount| *amount >= Decimal::new(1000, 0)));
    }
}
