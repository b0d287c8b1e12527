use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::policy::AgentPolicy;
use parley_core::domain::thread::TalentId;

use super::codec::{parse_decimal, parse_optional_decimal, parse_u32};
use super::{PolicyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PolicyRepository for SqlPolicyRepository {
    async fn find_for_talent(
        &self,
        talent_id: &TalentId,
    ) -> Result<Option<AgentPolicy>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                talent_id,
                sandbox_mode,
                auto_send_negotiation,
                required_margin_pct,
                exclusivity_buffer_days,
                negotiation_ceiling_pct,
                persona
             FROM agent_policy
             WHERE talent_id = ?",
        )
        .bind(&talent_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(policy_from_row).transpose()
    }

    async fn save(&self, policy: AgentPolicy) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_policy (
                talent_id,
                sandbox_mode,
                auto_send_negotiation,
                required_margin_pct,
                exclusivity_buffer_days,
                negotiation_ceiling_pct,
                persona
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(talent_id) DO UPDATE SET
                sandbox_mode = excluded.sandbox_mode,
                auto_send_negotiation = excluded.auto_send_negotiation,
                required_margin_pct = excluded.required_margin_pct,
                exclusivity_buffer_days = excluded.exclusivity_buffer_days,
                negotiation_ceiling_pct = excluded.negotiation_ceiling_pct,
                persona = excluded.persona",
        )
        .bind(&policy.talent_id.0)
        .bind(policy.sandbox_mode)
        .bind(policy.auto_send_negotiation)
        .bind(policy.required_margin_pct.to_string())
        .bind(i64::from(policy.exclusivity_buffer_days))
        .bind(policy.negotiation_ceiling_pct.map(|ceiling| ceiling.to_string()))
        .bind(policy.persona.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn policy_from_row(row: SqliteRow) -> Result<AgentPolicy, RepositoryError> {
    Ok(AgentPolicy {
        talent_id: TalentId(row.try_get("talent_id")?),
        sandbox_mode: row.try_get("sandbox_mode")?,
        auto_send_negotiation: row.try_get("auto_send_negotiation")?,
        required_margin_pct: parse_decimal(
            "required_margin_pct",
            row.try_get("required_margin_pct")?,
        )?,
        exclusivity_buffer_days: parse_u32(
            "exclusivity_buffer_days",
            row.try_get("exclusivity_buffer_days")?,
        )?,
        negotiation_ceiling_pct: parse_optional_decimal(
            "negotiation_ceiling_pct",
            row.try_get("negotiation_ceiling_pct")?,
        )?,
        persona: row.try_get("persona")?,
    })
}
