//! Narrow interfaces to the reasoning oracle: outcome prediction per
//! archetype and reply wording. Numbers in, numbers out; the oracle never
//! decides what is sent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use parley_core::domain::message::MessageSender;
use parley_core::domain::scenario::{Archetype, DealContext, HistoryLine, OutcomePrediction};
use parley_core::domain::thread::ThreadId;

use crate::llm::{extract_json_object, LlmClient, LlmError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle response malformed: {0}")]
    Malformed(String),
}

impl From<LlmError> for OracleError {
    fn from(error: LlmError) -> Self {
        match error {
            LlmError::Malformed(detail) => Self::Malformed(detail),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait OutcomeOracle: Send + Sync {
    async fn predict(
        &self,
        context: &DealContext,
        archetype: Archetype,
        anchor_rate: Decimal,
    ) -> Result<OutcomePrediction, OracleError>;
}

/// What the reply oracle needs to word one outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub thread_id: ThreadId,
    pub brand_name: String,
    pub archetype: Archetype,
    pub tone_hint: String,
    pub justification: String,
    pub persona: Option<String>,
    pub subject: String,
    pub anchor_rate: Decimal,
    pub floor_rate: Decimal,
    pub predicted_close_days: u32,
    pub deliverables: Vec<String>,
    pub history: Vec<HistoryLine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedReply {
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait ReplyOracle: Send + Sync {
    async fn compose(&self, request: &ReplyRequest) -> Result<ComposedReply, OracleError>;
}

const PREDICT_SYSTEM: &str = "You are a negotiation analyst for a creator talent agency. \
You predict how a brand will respond to an opening rate. Respond with a single JSON object only.";

const COMPOSE_SYSTEM: &str = "You write short, professional negotiation emails on behalf of a \
creator. Never quote a rate other than the one you are given. Respond with a single JSON object only.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPrediction {
    predicted_counter: Decimal,
    acceptance_likelihood: f64,
    predicted_close_days: u32,
    confidence: f64,
    #[serde(default)]
    script_stub: String,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    subject: String,
    body: String,
}

/// Oracle backed by a hosted or local language model.
pub struct LlmOracle {
    client: Arc<dyn LlmClient>,
}

impl LlmOracle {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

fn render_history(history: &[HistoryLine]) -> String {
    if history.is_empty() {
        return "(no messages yet)".to_string();
    }
    history
        .iter()
        .map(|line| format!("{}: {}", line.sender.as_str(), line.body.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn prediction_prompt(context: &DealContext, archetype: Archetype, anchor_rate: Decimal) -> String {
    let initial_offer = context
        .initial_offer
        .map_or_else(|| "not stated".to_string(), |offer| format!("£{offer}"));
    format!(
        "**Deal:**\n\
         - Brand: {brand}\n\
         - Category: {category}\n\
         - Creator tier: {tier}\n\
         - Deliverables: {deliverables}\n\
         - Brand's initial offer: {initial_offer}\n\
         - Minimum rate: £{floor}\n\
         - Target rate: £{target}\n\n\
         **Negotiation History (Round {round}):**\n---\n{history}\n---\n\n\
         **Strategy under test:** {archetype} ({tone}). The creator opens at £{anchor}.\n\n\
         Predict the brand's response to this opening.\n\n\
         **JSON Output Schema:**\n\
         {{\n  \"predictedCounter\": \"number, the rate the brand will counter with\",\n  \
         \"acceptanceLikelihood\": \"number between 0 and 1\",\n  \
         \"predictedCloseDays\": \"integer days until the deal closes\",\n  \
         \"confidence\": \"number between 0 and 1\",\n  \
         \"scriptStub\": \"one sentence describing the opening line\"\n}}",
        brand = context.brand_name,
        category = context.category,
        tier = context.creator_tier,
        deliverables = context.deliverables.join(", "),
        floor = context.floor_rate,
        target = context.target_rate,
        round = context.round_number,
        history = render_history(&context.history),
        archetype = archetype.as_str(),
        tone = archetype.tone_hint(),
        anchor = anchor_rate,
    )
}

pub fn reply_prompt(request: &ReplyRequest) -> String {
    let persona = request.persona.as_deref().unwrap_or("a professional creator");
    format!(
        "Write the next email to {brand} in the voice of {persona}.\n\n\
         - Strategy: {archetype} ({tone})\n\
         - Rate to quote: £{anchor}\n\
         - Deliverables: {deliverables}\n\
         - Why this strategy: {justification}\n\
         - Subject line to keep: {subject}\n\n\
         **Conversation so far:**\n---\n{history}\n---\n\n\
         **JSON Output Schema:**\n{{ \"subject\": \"string\", \"body\": \"string\" }}",
        brand = request.brand_name,
        archetype = request.archetype.as_str(),
        tone = request.tone_hint,
        anchor = request.anchor_rate,
        deliverables = request.deliverables.join(", "),
        justification = request.justification,
        subject = request.subject,
        history = render_history(&request.history),
    )
}

#[async_trait]
impl OutcomeOracle for LlmOracle {
    async fn predict(
        &self,
        context: &DealContext,
        archetype: Archetype,
        anchor_rate: Decimal,
    ) -> Result<OutcomePrediction, OracleError> {
        let raw = self
            .client
            .complete(PREDICT_SYSTEM, &prediction_prompt(context, archetype, anchor_rate))
            .await?;
        let value = extract_json_object(&raw)?;
        let parsed: RawPrediction = serde_json::from_value(value)
            .map_err(|error| OracleError::Malformed(error.to_string()))?;

        let prediction = OutcomePrediction {
            predicted_counter: parsed.predicted_counter,
            acceptance_likelihood: parsed.acceptance_likelihood,
            predicted_close_days: parsed.predicted_close_days,
            confidence: parsed.confidence,
            script_stub: parsed.script_stub,
        };
        prediction.validate().map_err(|error| OracleError::Malformed(error.to_string()))?;
        Ok(prediction)
    }
}

#[async_trait]
impl ReplyOracle for LlmOracle {
    async fn compose(&self, request: &ReplyRequest) -> Result<ComposedReply, OracleError> {
        let raw = self.client.complete(COMPOSE_SYSTEM, &reply_prompt(request)).await?;
        let value = extract_json_object(&raw)?;
        let parsed: RawReply = serde_json::from_value(value)
            .map_err(|error| OracleError::Malformed(error.to_string()))?;
        Ok(ComposedReply { subject: parsed.subject, body: parsed.body })
    }
}

enum ScriptedPrediction {
    Ready(OutcomePrediction),
    Fail(OracleError),
    Stall(Duration),
}

/// Deterministic oracle for tests and dry runs. Archetypes without a script
/// fall back to fixed per-archetype heuristics.
#[derive(Default)]
pub struct ScriptedOracle {
    predictions: BTreeMap<Archetype, ScriptedPrediction>,
    replies: Mutex<VecDeque<Result<ComposedReply, OracleError>>>,
    predict_calls: AtomicUsize,
    compose_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prediction(mut self, archetype: Archetype, prediction: OutcomePrediction) -> Self {
        self.predictions.insert(archetype, ScriptedPrediction::Ready(prediction));
        self
    }

    pub fn failing(mut self, archetype: Archetype, error: OracleError) -> Self {
        self.predictions.insert(archetype, ScriptedPrediction::Fail(error));
        self
    }

    /// The archetype's prediction only arrives after `delay`.
    pub fn stalled(mut self, archetype: Archetype, delay: Duration) -> Self {
        self.predictions.insert(archetype, ScriptedPrediction::Stall(delay));
        self
    }

    /// Queues a compose result; once the queue is empty a reply is built
    /// from the request.
    pub fn with_reply(self, reply: Result<ComposedReply, OracleError>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    pub fn predict_calls(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }

    pub fn compose_calls(&self) -> usize {
        self.compose_calls.load(Ordering::SeqCst)
    }

    pub fn heuristic(archetype: Archetype, anchor_rate: Decimal) -> OutcomePrediction {
        let (acceptance, close_days, confidence, counter_pct) = match archetype {
            Archetype::Balanced => (0.75, 7, 0.8, 95),
            Archetype::Aggressive => (0.45, 12, 0.7, 88),
            Archetype::Collaborative => (0.85, 5, 0.8, 98),
        };
        OutcomePrediction {
            predicted_counter: (anchor_rate * Decimal::new(counter_pct, 2)).round_dp(2),
            acceptance_likelihood: acceptance,
            predicted_close_days: close_days,
            confidence,
            script_stub: format!("open at {anchor_rate} with a {} tone", archetype.as_str()),
        }
    }
}

#[async_trait]
impl OutcomeOracle for ScriptedOracle {
    async fn predict(
        &self,
        _context: &DealContext,
        archetype: Archetype,
        anchor_rate: Decimal,
    ) -> Result<OutcomePrediction, OracleError> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        match self.predictions.get(&archetype) {
            Some(ScriptedPrediction::Ready(prediction)) => Ok(prediction.clone()),
            Some(ScriptedPrediction::Fail(error)) => Err(error.clone()),
            Some(ScriptedPrediction::Stall(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(Self::heuristic(archetype, anchor_rate))
            }
            None => Ok(Self::heuristic(archetype, anchor_rate)),
        }
    }
}

#[async_trait]
impl ReplyOracle for ScriptedOracle {
    async fn compose(&self, request: &ReplyRequest) -> Result<ComposedReply, OracleError> {
        self.compose_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.replies.lock().ok().and_then(|mut replies| replies.pop_front());
        if let Some(reply) = queued {
            return reply;
        }

        let greeting = request
            .history
            .iter()
            .rev()
            .find(|line| line.sender == MessageSender::Brand)
            .map_or("Thanks for getting in touch", |_| "Thanks for the update");
        Ok(ComposedReply {
            subject: request.subject.clone(),
            body: format!(
                "Hi {} team,\n\n{greeting}. For {} our rate is £{}.\n\nBest,\n{}",
                request.brand_name,
                request.deliverables.join(", "),
                request.anchor_rate,
                request.persona.as_deref().unwrap_or("The talent team"),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use parley_core::domain::scenario::{Archetype, DealContext};
    use parley_core::domain::thread::{TalentId, ThreadId};

    use super::{LlmOracle, OracleError, OutcomeOracle, ScriptedOracle};
    use crate::llm::{LlmClient, LlmError};

    struct CannedClient(&'static str);

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    fn context() -> DealContext {
        DealContext {
            thread_id: ThreadId("T-1".to_string()),
            talent_id: TalentId("talent-1".to_string()),
            brand_name: "Lumen".to_string(),
            initial_offer: Some(Decimal::new(1200, 0)),
            floor_rate: Decimal::new(1000, 0),
            target_rate: Decimal::new(1500, 0),
            deliverables: vec!["1x reel".to_string()],
            creator_tier: "mid".to_string(),
            category: "beauty".to_string(),
            round_number: 1,
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn llm_prediction_is_parsed_from_camel_case_json() {
        let oracle = LlmOracle::new(Arc::new(CannedClient(
            r#"{"predictedCounter": 1400, "acceptanceLikelihood": 0.8, "predictedCloseDays": 7, "confidence": 0.9, "scriptStub": "hold"}"#,
        )));
        let prediction = oracle
            .predict(&context(), Archetype::Balanced, Decimal::new(1500, 0))
            .await
            .expect("prediction");
        assert_eq!(prediction.predicted_counter, Decimal::new(1400, 0));
        assert_eq!(prediction.predicted_close_days, 7);
    }

    #[tokio::test]
    async fn out_of_range_prediction_is_malformed() {
        let oracle = LlmOracle::new(Arc::new(CannedClient(
            r#"{"predictedCounter": 1400, "acceptanceLikelihood": 1.4, "predictedCloseDays": 7, "confidence": 0.9}"#,
        )));
        let error = oracle
            .predict(&context(), Archetype::Balanced, Decimal::new(1500, 0))
            .await
            .expect_err("likelihood above one");
        assert!(matches!(error, OracleError::Malformed(_)));
    }

    #[tokio::test]
    async fn scripted_oracle_counts_calls_and_uses_heuristics() {
        let oracle = ScriptedOracle::new()
            .failing(Archetype::Aggressive, OracleError::Unavailable("down".to_string()));

        let balanced = oracle
            .predict(&context(), Archetype::Balanced, Decimal::new(1500, 0))
            .await
            .expect("heuristic prediction");
        assert_eq!(balanced, ScriptedOracle::heuristic(Archetype::Balanced, Decimal::new(1500, 0)));
        assert!(oracle.predict(&context(), Archetype::Aggressive, Decimal::new(1800, 0)).await.is_err());
        assert_eq!(oracle.predict_calls(), 2);
    }
}
