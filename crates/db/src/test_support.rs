use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use parley_core::domain::thread::{
    DealTerms, NegotiationThread, TalentId, ThreadId, ThreadStage,
};

use crate::{connect_with_settings, migrations, DbPool};

pub(crate) async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool should connect");
    migrations::run_pending(&pool).await.expect("migrations should run");
    pool
}

pub(crate) fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
}

pub(crate) fn sample_thread(id: &str, talent: &str) -> NegotiationThread {
    NegotiationThread {
        id: ThreadId(id.to_string()),
        talent_id: TalentId(talent.to_string()),
        brand_name: "Glow Co".to_string(),
        brand_email: "partnerships@glow.example".to_string(),
        subject_root: "Spring campaign".to_string(),
        stage: ThreadStage::Open,
        stage_version: 0,
        terms: DealTerms {
            initial_offer: Some(Decimal::new(1200, 0)),
            floor_rate: Decimal::new(1000, 0),
            target_rate: Decimal::new(1500, 0),
            deliverables: vec!["1x reel".to_string(), "3x stories".to_string()],
            creator_tier: "mid".to_string(),
            category: "beauty".to_string(),
            proposed_start: None,
            campaign_days: 14,
        },
        created_at: parse_ts("2026-03-01T09:00:00Z"),
        updated_at: parse_ts("2026-03-01T09:00:00Z"),
    }
}
