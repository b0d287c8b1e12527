use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::commitment::{Commitment, CommitmentId};
use parley_core::domain::thread::TalentId;

use super::codec::{encode_date, parse_date, parse_decimal, parse_u32};
use super::{CommitmentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCommitmentRepository {
    pool: DbPool,
}

impl SqlCommitmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CommitmentRepository for SqlCommitmentRepository {
    async fn list_for_talent(
        &self,
        talent_id: &TalentId,
    ) -> Result<Vec<Commitment>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                talent_id,
                brand_name,
                category,
                start_date,
                end_date,
                exclusivity_buffer_days,
                rate
             FROM talent_commitment
             WHERE talent_id = ?
             ORDER BY start_date ASC, id ASC",
        )
        .bind(&talent_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(commitment_from_row).collect()
    }

    async fn save(&self, commitment: Commitment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO talent_commitment (
                id,
                talent_id,
                brand_name,
                category,
                start_date,
                end_date,
                exclusivity_buffer_days,
                rate
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                talent_id = excluded.talent_id,
                brand_name = excluded.brand_name,
                category = excluded.category,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                exclusivity_buffer_days = excluded.exclusivity_buffer_days,
                rate = excluded.rate",
        )
        .bind(&commitment.id.0)
        .bind(&commitment.talent_id.0)
        .bind(&commitment.brand_name)
        .bind(&commitment.category)
        .bind(encode_date(commitment.start_date))
        .bind(encode_date(commitment.end_date))
        .bind(i64::from(commitment.exclusivity_buffer_days))
        .bind(commitment.rate.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn commitment_from_row(row: SqliteRow) -> Result<Commitment, RepositoryError> {
    Ok(Commitment {
        id: CommitmentId(row.try_get("id")?),
        talent_id: TalentId(row.try_get("talent_id")?),
        brand_name: row.try_get("brand_name")?,
        category: row.try_get("category")?,
        start_date: parse_date("start_date", row.try_get("start_date")?)?,
        end_date: parse_date("end_date", row.try_get("end_date")?)?,
        exclusivity_buffer_days: parse_u32(
            "exclusivity_buffer_days",
            row.try_get("exclusivity_buffer_days")?,
        )?,
        rate: parse_decimal("rate", row.try_get("rate")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use parley_core::domain::commitment::{Commitment, CommitmentId};
    use parley_core::domain::thread::TalentId;

    use super::SqlCommitmentRepository;
    use crate::repositories::CommitmentRepository;
    use crate::test_support::setup_pool;

    fn commitment(id: &str, talent: &str, start: (i32, u32, u32)) -> Commitment {
        let start_date = NaiveDate::from_ymd_opt(start.0, start.1, start.2).expect("valid date");
        Commitment {
            id: CommitmentId(id.to_string()),
            talent_id: TalentId(talent.to_string()),
            brand_name: "Lumen".to_string(),
            category: "Beauty".to_string(),
            start_date,
            end_date: start_date + chrono::Duration::days(30),
            exclusivity_buffer_days: 7,
            rate: Decimal::new(185050, 2),
        }
    }

    #[tokio::test]
    async fn commitments_are_scoped_to_talent_and_ordered_by_start() {
        let pool = setup_pool().await;
        let repo = SqlCommitmentRepository::new(pool);

        let late = commitment("c-2", "talent-1", (2026, 6, 1));
        let early = commitment("c-1", "talent-1", (2026, 2, 1));
        repo.save(late.clone()).await.expect("save late");
        repo.save(early.clone()).await.expect("save early");
        repo.save(commitment("c-3", "talent-2", (2026, 1, 1))).await.expect("save other");

        let listed =
            repo.list_for_talent(&TalentId("talent-1".to_string())).await.expect("list");
        assert_eq!(listed, vec![early, late]);
    }
}
