use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use parley_core::domain::commitment::{Commitment, CommitmentId};
use parley_core::domain::message::{MessageId, MessageSender, MessageStatus, NegotiationMessage};
use parley_core::domain::policy::AgentPolicy;
use parley_core::domain::thread::{
    DealTerms, NegotiationThread, TalentId, ThreadId, ThreadStage,
};

use crate::repositories::{RepositoryError, RepositorySet};

struct SeedThread {
    thread_id: &'static str,
    talent_id: &'static str,
    brand_name: &'static str,
    category: &'static str,
    scenario: &'static str,
    description: &'static str,
    initial_offer: i64,
    floor_rate: i64,
    target_rate: i64,
    sandbox_mode: bool,
    auto_send: bool,
    required_margin_pct: i64,
    opening_message: &'static str,
}

const SEED_THREADS: &[SeedThread] = &[
    SeedThread {
        thread_id: "T-DEMO-AUTOSEND",
        talent_id: "talent-ava",
        brand_name: "Lumen Skincare",
        category: "beauty",
        scenario: "auto-send",
        description: "compliant policy with auto-send on; the cycle sends a reply",
        initial_offer: 1200,
        floor_rate: 1000,
        target_rate: 1500,
        sandbox_mode: false,
        auto_send: true,
        required_margin_pct: 20,
        opening_message: "Hi Ava! We'd love one reel and three stories for our spring launch. Our budget is £1,200.",
    },
    SeedThread {
        thread_id: "T-DEMO-SANDBOX",
        talent_id: "talent-ben",
        brand_name: "Stride Athletics",
        category: "fitness",
        scenario: "sandbox",
        description: "sandbox policy; the cycle only drafts",
        initial_offer: 2000,
        floor_rate: 1800,
        target_rate: 2600,
        sandbox_mode: true,
        auto_send: true,
        required_margin_pct: 10,
        opening_message: "Hey Ben, would you be up for a two-week training series? We can offer £2,000.",
    },
    SeedThread {
        thread_id: "T-DEMO-HALT",
        talent_id: "talent-cai",
        brand_name: "Pixel Forge",
        category: "gaming",
        scenario: "halt",
        description: "existing gaming exclusivity blocks every candidate; the cycle halts",
        initial_offer: 900,
        floor_rate: 800,
        target_rate: 1200,
        sandbox_mode: false,
        auto_send: true,
        required_margin_pct: 0,
        opening_message: "Hi Cai, we're launching a new title next month and want a sponsored stream.",
    },
];

/// Deterministic demo data: one thread per pipeline outcome.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    /// Loads the demo threads. Re-running leaves existing threads untouched.
    pub async fn load(
        repositories: &RepositorySet,
        now: DateTime<Utc>,
    ) -> Result<SeedResult, RepositoryError> {
        let today = now.date_naive();
        let mut threads_seeded = Vec::with_capacity(SEED_THREADS.len());

        for seed in SEED_THREADS {
            let thread_id = ThreadId(seed.thread_id.to_string());
            let talent_id = TalentId(seed.talent_id.to_string());

            if repositories.threads.find_by_id(&thread_id).await?.is_none() {
                repositories
                    .threads
                    .save(NegotiationThread {
                        id: thread_id.clone(),
                        talent_id: talent_id.clone(),
                        brand_name: seed.brand_name.to_string(),
                        brand_email: format!(
                            "partnerships@{}.example",
                            seed.brand_name.to_ascii_lowercase().replace(' ', "-")
                        ),
                        subject_root: format!("{} x {}", seed.brand_name, seed.talent_id),
                        stage: ThreadStage::Open,
                        stage_version: 0,
                        terms: DealTerms {
                            initial_offer: Some(Decimal::new(seed.initial_offer, 0)),
                            floor_rate: Decimal::new(seed.floor_rate, 0),
                            target_rate: Decimal::new(seed.target_rate, 0),
                            deliverables: vec!["1x reel".to_string(), "3x stories".to_string()],
                            creator_tier: "mid".to_string(),
                            category: seed.category.to_string(),
                            proposed_start: Some(today + Duration::days(21)),
                            campaign_days: 14,
                        },
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
            }

            if repositories.messages.list_for_thread(&thread_id).await?.is_empty() {
                repositories
                    .messages
                    .append(NegotiationMessage {
                        id: MessageId(format!("{}-M1", seed.thread_id)),
                        thread_id: thread_id.clone(),
                        sender: MessageSender::Brand,
                        subject: format!("{} x {}", seed.brand_name, seed.talent_id),
                        body: seed.opening_message.to_string(),
                        status: MessageStatus::Received,
                        created_at: now,
                    })
                    .await?;
            }

            repositories
                .policies
                .save(AgentPolicy {
                    talent_id: talent_id.clone(),
                    sandbox_mode: seed.sandbox_mode,
                    auto_send_negotiation: seed.auto_send,
                    required_margin_pct: Decimal::new(seed.required_margin_pct, 0),
                    exclusivity_buffer_days: 7,
                    negotiation_ceiling_pct: Some(Decimal::new(50, 0)),
                    persona: Some(format!("friendly {} creator", seed.category)),
                })
                .await?;

            for commitment in commitments_for(seed, today) {
                repositories.commitments.save(commitment).await?;
            }

            threads_seeded.push(ThreadSeedInfo {
                scenario: seed.scenario,
                thread_id: seed.thread_id,
                description: seed.description,
            });
        }

        Ok(SeedResult { threads_seeded })
    }

    /// Checks every demo thread, policy, and opening message is present.
    pub async fn verify(repositories: &RepositorySet) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for seed in SEED_THREADS {
            let thread_id = ThreadId(seed.thread_id.to_string());
            let talent_id = TalentId(seed.talent_id.to_string());

            let thread = repositories.threads.find_by_id(&thread_id).await?;
            checks.push((
                seed.thread_id,
                thread.is_some_and(|thread| thread.talent_id == talent_id),
            ));

            let policy = repositories.policies.find_for_talent(&talent_id).await?;
            checks.push((
                seed.talent_id,
                policy.is_some_and(|policy| policy.sandbox_mode == seed.sandbox_mode),
            ));

            let history = repositories.messages.list_for_thread(&thread_id).await?;
            checks.push((
                seed.scenario,
                history.first().is_some_and(|message| message.sender == MessageSender::Brand),
            ));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

fn commitments_for(seed: &SeedThread, today: chrono::NaiveDate) -> Vec<Commitment> {
    let talent_id = TalentId(seed.talent_id.to_string());
    match seed.scenario {
        "halt" => vec![Commitment {
            id: CommitmentId("C-DEMO-GAMING-EXCL".to_string()),
            talent_id,
            brand_name: "Arcade Nova".to_string(),
            category: "gaming".to_string(),
            start_date: today - Duration::days(10),
            end_date: today + Duration::days(60),
            exclusivity_buffer_days: 14,
            rate: Decimal::new(1500, 0),
        }],
        "auto-send" => vec![Commitment {
            id: CommitmentId("C-DEMO-TRAVEL".to_string()),
            talent_id,
            brand_name: "Wander Bags".to_string(),
            category: "travel".to_string(),
            start_date: today - Duration::days(90),
            end_date: today - Duration::days(60),
            exclusivity_buffer_days: 0,
            rate: Decimal::new(1100, 0),
        }],
        _ => Vec::new(),
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub threads_seeded: Vec<ThreadSeedInfo>,
}

#[derive(Debug)]
pub struct ThreadSeedInfo {
    pub scenario: &'static str,
    pub thread_id: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::DemoSeedDataset;
    use crate::repositories::RepositorySet;
    use crate::test_support::{parse_ts, setup_pool};

    #[tokio::test]
    async fn demo_seed_is_idempotent_against_sqlite() {
        let repositories = RepositorySet::sql(setup_pool().await);
        let now = parse_ts("2026-03-01T09:00:00Z");

        let first = DemoSeedDataset::load(&repositories, now).await.expect("load seed");
        let first_verification = DemoSeedDataset::verify(&repositories).await.expect("verify");
        assert!(first_verification.all_present, "{:?}", first_verification.checks);
        assert_eq!(first.threads_seeded.len(), 3);

        let second = DemoSeedDataset::load(&repositories, now).await.expect("reload seed");
        let second_verification = DemoSeedDataset::verify(&repositories).await.expect("re-verify");
        assert_eq!(second.threads_seeded.len(), 3);
        assert_eq!(first_verification.checks, second_verification.checks);
    }
}
