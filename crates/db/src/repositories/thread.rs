use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::thread::{
    DealTerms, NegotiationThread, StageGuard, TalentId, ThreadId, ThreadStage,
};

use super::codec::{
    encode_date, encode_timestamp, parse_decimal, parse_enum, parse_optional_date,
    parse_optional_decimal, parse_timestamp, parse_u32,
};
use super::{RepositoryError, ThreadRepository};
use crate::DbPool;

const THREAD_COLUMNS: &str = "id,
    talent_id,
    brand_name,
    brand_email,
    subject_root,
    stage,
    stage_version,
    initial_offer,
    floor_rate,
    target_rate,
    deliverables_json,
    creator_tier,
    category,
    proposed_start,
    campaign_days,
    created_at,
    updated_at";

pub struct SqlThreadRepository {
    pool: DbPool,
}

impl SqlThreadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ThreadRepository for SqlThreadRepository {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<NegotiationThread>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM negotiation_thread WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(thread_from_row).transpose()
    }

    async fn list_by_stage(
        &self,
        stage: ThreadStage,
    ) -> Result<Vec<NegotiationThread>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM negotiation_thread
             WHERE stage = ?
             ORDER BY updated_at ASC, id ASC"
        ))
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(thread_from_row).collect()
    }

    async fn save(&self, thread: NegotiationThread) -> Result<(), RepositoryError> {
        let deliverables_json = serde_json::to_string(&thread.terms.deliverables)
            .map_err(|error| RepositoryError::Decode(format!("deliverables: {error}")))?;

        sqlx::query(
            "INSERT INTO negotiation_thread (
                id,
                talent_id,
                brand_name,
                brand_email,
                subject_root,
                stage,
                stage_version,
                initial_offer,
                floor_rate,
                target_rate,
                deliverables_json,
                creator_tier,
                category,
                proposed_start,
                campaign_days,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                talent_id = excluded.talent_id,
                brand_name = excluded.brand_name,
                brand_email = excluded.brand_email,
                subject_root = excluded.subject_root,
                stage = excluded.stage,
                stage_version = excluded.stage_version,
                initial_offer = excluded.initial_offer,
                floor_rate = excluded.floor_rate,
                target_rate = excluded.target_rate,
                deliverables_json = excluded.deliverables_json,
                creator_tier = excluded.creator_tier,
                category = excluded.category,
                proposed_start = excluded.proposed_start,
                campaign_days = excluded.campaign_days,
                updated_at = excluded.updated_at",
        )
        .bind(&thread.id.0)
        .bind(&thread.talent_id.0)
        .bind(&thread.brand_name)
        .bind(&thread.brand_email)
        .bind(&thread.subject_root)
        .bind(thread.stage.as_str())
        .bind(i64::from(thread.stage_version))
        .bind(thread.terms.initial_offer.map(|offer| offer.to_string()))
        .bind(thread.terms.floor_rate.to_string())
        .bind(thread.terms.target_rate.to_string())
        .bind(deliverables_json)
        .bind(&thread.terms.creator_tier)
        .bind(&thread.terms.category)
        .bind(thread.terms.proposed_start.map(encode_date))
        .bind(i64::from(thread.terms.campaign_days))
        .bind(encode_timestamp(thread.created_at))
        .bind(encode_timestamp(thread.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn compare_and_set_stage(
        &self,
        id: &ThreadId,
        expected: StageGuard,
        next: ThreadStage,
        now: DateTime<Utc>,
    ) -> Result<Option<StageGuard>, RepositoryError> {
        let next_version = expected.stage_version.saturating_add(1);
        let result = sqlx::query(
            "UPDATE negotiation_thread
             SET stage = ?, stage_version = ?, updated_at = ?
             WHERE id = ? AND stage = ? AND stage_version = ?",
        )
        .bind(next.as_str())
        .bind(i64::from(next_version))
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .bind(expected.stage.as_str())
        .bind(i64::from(expected.stage_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(StageGuard { stage: next, stage_version: next_version }))
        } else {
            Ok(None)
        }
    }
}

fn thread_from_row(row: SqliteRow) -> Result<NegotiationThread, RepositoryError> {
    let stage = parse_enum("thread stage", row.try_get("stage")?, ThreadStage::parse)?;
    let deliverables_raw = row.try_get::<String, _>("deliverables_json")?;
    let deliverables: Vec<String> = serde_json::from_str(&deliverables_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid deliverables_json `{deliverables_raw}` ({error})"))
    })?;

    Ok(NegotiationThread {
        id: ThreadId(row.try_get("id")?),
        talent_id: TalentId(row.try_get("talent_id")?),
        brand_name: row.try_get("brand_name")?,
        brand_email: row.try_get("brand_email")?,
        subject_root: row.try_get("subject_root")?,
        stage,
        stage_version: parse_u32("stage_version", row.try_get("stage_version")?)?,
        terms: DealTerms {
            initial_offer: parse_optional_decimal("initial_offer", row.try_get("initial_offer")?)?,
            floor_rate: parse_decimal("floor_rate", row.try_get("floor_rate")?)?,
            target_rate: parse_decimal("target_rate", row.try_get("target_rate")?)?,
            deliverables,
            creator_tier: row.try_get("creator_tier")?,
            category: row.try_get("category")?,
            proposed_start: parse_optional_date("proposed_start", row.try_get("proposed_start")?)?,
            campaign_days: parse_u32("campaign_days", row.try_get("campaign_days")?)?,
        },
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use parley_core::domain::thread::ThreadStage;

    use super::SqlThreadRepository;
    use crate::repositories::ThreadRepository;
    use crate::test_support::{sample_thread, setup_pool};

    #[tokio::test]
    async fn sql_thread_repo_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlThreadRepository::new(pool);
        let thread = sample_thread("T-SQL-001", "talent-1");

        repo.save(thread.clone()).await.expect("save thread");

        let found = repo.find_by_id(&thread.id).await.expect("find thread");
        assert_eq!(found, Some(thread.clone()));

        let open = repo.list_by_stage(ThreadStage::Open).await.expect("list open");
        assert_eq!(open.len(), 1);
        assert!(repo.list_by_stage(ThreadStage::Halted).await.expect("list halted").is_empty());
    }

    #[tokio::test]
    async fn stale_guard_never_overwrites_stage() {
        let pool = setup_pool().await;
        let repo = SqlThreadRepository::new(pool);
        let thread = sample_thread("T-SQL-002", "talent-1");
        repo.save(thread.clone()).await.expect("save thread");

        let guard = thread.guard();
        let later = Utc::now() + Duration::seconds(1);
        let advanced = repo
            .compare_and_set_stage(&thread.id, guard, ThreadStage::Simulated, later)
            .await
            .expect("cas")
            .expect("first writer wins");
        assert_eq!(advanced.stage, ThreadStage::Simulated);
        assert_eq!(advanced.stage_version, guard.stage_version + 1);

        let second = repo
            .compare_and_set_stage(&thread.id, guard, ThreadStage::Halted, later)
            .await
            .expect("cas");
        assert_eq!(second, None);

        let stored = repo.find_by_id(&thread.id).await.expect("find").expect("thread exists");
        assert_eq!(stored.stage, ThreadStage::Simulated);
        assert_eq!(stored.stage_version, advanced.stage_version);
    }
}
