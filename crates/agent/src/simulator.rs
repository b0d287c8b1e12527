use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use parley_core::config::NegotiationConfig;
use parley_core::domain::scenario::{Archetype, DealContext, OutcomePrediction, ScenarioCandidate};

use crate::oracle::{OracleError, OutcomeOracle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimulatorSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl SimulatorSettings {
    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.archetype_timeout_secs),
            max_retries: config.oracle_max_retries,
            backoff: Duration::from_millis(config.oracle_backoff_millis),
        }
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self::from_config(&NegotiationConfig::default())
    }
}

/// Fans one deal out across every archetype and collects a candidate for
/// each. A failing archetype degrades to the neutral candidate instead of
/// failing the batch.
pub struct ScenarioSimulator {
    oracle: Arc<dyn OutcomeOracle>,
    settings: SimulatorSettings,
}

impl ScenarioSimulator {
    pub fn new(oracle: Arc<dyn OutcomeOracle>, settings: SimulatorSettings) -> Self {
        Self { oracle, settings }
    }

    pub fn settings(&self) -> SimulatorSettings {
        self.settings
    }

    /// Returns one candidate per archetype, in archetype order.
    pub async fn simulate(
        &self,
        context: &DealContext,
        ceiling_pct: Option<Decimal>,
    ) -> Vec<ScenarioCandidate> {
        let runs = Archetype::ALL.into_iter().map(|archetype| {
            let anchor =
                archetype.anchor_rate(context.target_rate, context.initial_offer, ceiling_pct);
            async move {
                match self.predict_with_retry(context, archetype, anchor).await {
                    Ok(prediction) => ScenarioCandidate::from_prediction(
                        context.thread_id.clone(),
                        archetype,
                        anchor,
                        prediction,
                    ),
                    Err(error) => {
                        warn!(
                            event_name = "simulation.archetype_degraded",
                            thread_id = %context.thread_id,
                            archetype = archetype.as_str(),
                            error = %error,
                            "outcome prediction failed; using neutral candidate"
                        );
                        ScenarioCandidate::neutral(
                            context.thread_id.clone(),
                            archetype,
                            anchor,
                            format!("{archetype} prediction unavailable: {error}"),
                        )
                    }
                }
            }
        });

        join_all(runs).await
    }

    async fn predict_with_retry(
        &self,
        context: &DealContext,
        archetype: Archetype,
        anchor: Decimal,
    ) -> Result<OutcomePrediction, OracleError> {
        let mut attempt = 0;
        loop {
            let outcome =
                tokio::time::timeout(self.settings.timeout, self.oracle.predict(context, archetype, anchor))
                    .await;
            let error = match outcome {
                Ok(Ok(prediction)) => match prediction.validate() {
                    Ok(()) => return Ok(prediction),
                    Err(invalid) => OracleError::Malformed(invalid.to_string()),
                },
                Ok(Err(error)) => error,
                Err(_) => OracleError::Timeout(self.settings.timeout),
            };

            if attempt >= self.settings.max_retries {
                return Err(error);
            }
            let delay = self.settings.backoff.saturating_mul(2_u32.saturating_pow(attempt));
            debug!(
                event_name = "simulation.retry_scheduled",
                thread_id = %context.thread_id,
                archetype = archetype.as_str(),
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying outcome prediction"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal::Decimal;

    use parley_core::domain::scenario::{
        Archetype, DealContext, OutcomePrediction, NEUTRAL_ACCEPTANCE, NEUTRAL_CLOSE_DAYS,
    };
    use parley_core::domain::thread::{TalentId, ThreadId};

    use super::{ScenarioSimulator, SimulatorSettings};
    use crate::oracle::{OracleError, ScriptedOracle};

    fn context() -> DealContext {
        DealContext {
            thread_id: ThreadId("T-SIM-1".to_string()),
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

    fn fast_settings() -> SimulatorSettings {
        SimulatorSettings {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn produces_one_candidate_per_archetype_in_order() {
        let prediction = OutcomePrediction {
            predicted_counter: Decimal::new(1400, 0),
            acceptance_likelihood: 0.8,
            predicted_close_days: 7,
            confidence: 0.9,
            script_stub: "hold".to_string(),
        };
        let oracle = ScriptedOracle::new().with_prediction(Archetype::Balanced, prediction);
        let simulator = ScenarioSimulator::new(Arc::new(oracle), fast_settings());

        let candidates = simulator.simulate(&context(), None).await;
        let archetypes: Vec<_> = candidates.iter().map(|c| c.archetype).collect();
        assert_eq!(archetypes, Archetype::ALL.to_vec());
        assert_eq!(candidates[0].predicted_counter, Decimal::new(1400, 0));
        assert_eq!(candidates[1].anchor_rate, Decimal::new(1800, 0));
        assert!(candidates.iter().all(|c| !c.is_degraded()));
    }

    #[tokio::test]
    async fn ceiling_caps_every_anchor() {
        let simulator = ScenarioSimulator::new(Arc::new(ScriptedOracle::new()), fast_settings());
        let candidates = simulator.simulate(&context(), Some(Decimal::new(25, 0))).await;
        assert!(candidates.iter().all(|c| c.anchor_rate <= Decimal::new(1500, 0)));
        assert_eq!(candidates[1].anchor_rate, Decimal::new(1500, 0));
    }

    #[tokio::test]
    async fn failing_archetype_degrades_without_blocking_the_rest() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .failing(Archetype::Aggressive, OracleError::Unavailable("503".to_string())),
        );
        let simulator = ScenarioSimulator::new(oracle.clone(), fast_settings());

        let candidates = simulator.simulate(&context(), None).await;
        let aggressive = &candidates[1];
        assert!(aggressive.is_degraded());
        assert_eq!(aggressive.confidence, 0.0);
        assert_eq!(aggressive.acceptance_likelihood, NEUTRAL_ACCEPTANCE);
        assert_eq!(aggressive.predicted_close_days, NEUTRAL_CLOSE_DAYS);
        assert_eq!(aggressive.predicted_counter, aggressive.anchor_rate);
        assert!(aggressive.degraded_reason.as_deref().is_some_and(|r| r.contains("503")));
        assert!(!candidates[0].is_degraded());

        // one call each for the healthy archetypes, 1 + 2 retries for the failing one
        assert_eq!(oracle.predict_calls(), 5);
    }

    #[tokio::test]
    async fn stalled_archetype_times_out_into_neutral_candidate() {
        let oracle =
            ScriptedOracle::new().stalled(Archetype::Collaborative, Duration::from_secs(30));
        let settings = SimulatorSettings { max_retries: 0, ..fast_settings() };
        let simulator = ScenarioSimulator::new(Arc::new(oracle), settings);

        let candidates = simulator.simulate(&context(), None).await;
        let collaborative = &candidates[2];
        assert!(collaborative.is_degraded());
        assert!(collaborative
            .degraded_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("timed out")));
    }
}
