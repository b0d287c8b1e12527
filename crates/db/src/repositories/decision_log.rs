use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::decision::{DecisionId, DecisionLogEntry, DecisionType};
use parley_core::domain::scenario::ScenarioCandidate;
use parley_core::domain::thread::ThreadId;

use super::codec::{
    conflict_or_database, encode_timestamp, parse_enum, parse_timestamp, parse_u32,
};
use super::{DecisionLogRepository, RepositoryError};
use crate::DbPool;

const DECISION_COLUMNS: &str = "id,
    thread_id,
    sequence,
    decision_type,
    reasoning,
    chosen_candidate_json,
    generated_message,
    policy_compliant,
    prev_hash,
    entry_hash,
    created_at";

pub struct SqlDecisionLogRepository {
    pool: DbPool,
}

impl SqlDecisionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DecisionLogRepository for SqlDecisionLogRepository {
    async fn append(&self, entry: DecisionLogEntry) -> Result<(), RepositoryError> {
        let candidate_json = entry
            .chosen_candidate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| RepositoryError::Decode(format!("chosen_candidate: {error}")))?;

        sqlx::query(
            "INSERT INTO decision_log (
                id,
                thread_id,
                sequence,
                decision_type,
                reasoning,
                chosen_candidate_json,
                generated_message,
                policy_compliant,
                prev_hash,
                entry_hash,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.thread_id.0)
        .bind(i64::from(entry.sequence))
        .bind(entry.decision_type.as_str())
        .bind(&entry.reasoning)
        .bind(candidate_json)
        .bind(entry.generated_message.as_deref())
        .bind(entry.policy_compliant)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(encode_timestamp(entry.created_at))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            conflict_or_database(
                error,
                format!(
                    "decision log for thread {} already has sequence {}",
                    entry.thread_id, entry.sequence
                ),
            )
        })?;

        Ok(())
    }

    async fn latest_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<DecisionLogEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM decision_log
             WHERE thread_id = ?
             ORDER BY sequence DESC
             LIMIT 1"
        ))
        .bind(&thread_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decision_from_row).transpose()
    }

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<DecisionLogEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM decision_log
             WHERE thread_id = ?
             ORDER BY sequence ASC"
        ))
        .bind(&thread_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decision_from_row).collect()
    }
}

fn decision_from_row(row: SqliteRow) -> Result<DecisionLogEntry, RepositoryError> {
    let chosen_candidate = row
        .try_get::<Option<String>, _>("chosen_candidate_json")?
        .map(|raw| {
            serde_json::from_str::<ScenarioCandidate>(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid chosen_candidate_json ({error})"))
            })
        })
        .transpose()?;

    Ok(DecisionLogEntry {
        id: DecisionId(row.try_get("id")?),
        thread_id: ThreadId(row.try_get("thread_id")?),
        sequence: parse_u32("sequence", row.try_get("sequence")?)?,
        decision_type: parse_enum("decision type", row.try_get("decision_type")?, DecisionType::parse)?,
        reasoning: row.try_get("reasoning")?,
        chosen_candidate,
        generated_message: row.try_get("generated_message")?,
        policy_compliant: row.try_get("policy_compliant")?,
        prev_hash: row.try_get("prev_hash")?,
        entry_hash: row.try_get("entry_hash")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
