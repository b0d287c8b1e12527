use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::message::{MessageId, MessageSender, MessageStatus, NegotiationMessage};
use parley_core::domain::scenario::{Archetype, ScenarioCandidate};
use parley_core::domain::thread::ThreadId;

use super::codec::{encode_timestamp, parse_decimal, parse_enum, parse_timestamp, parse_u32};
use super::{CandidateRepository, MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn append(&self, message: NegotiationMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO negotiation_message (
                id,
                thread_id,
                sender,
                subject,
                body,
                status,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&message.thread_id.0)
        .bind(message.sender.as_str())
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(encode_timestamp(message.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<NegotiationMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, thread_id, sender, subject, body, status, created_at
             FROM negotiation_message
             WHERE thread_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&thread_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

pub struct SqlCandidateRepository {
    pool: DbPool,
}

impl SqlCandidateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CandidateRepository for SqlCandidateRepository {
    async fn replace_for_thread(
        &self,
        thread_id: &ThreadId,
        ranked: Vec<ScenarioCandidate>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM scenario_candidate WHERE thread_id = ?")
            .bind(&thread_id.0)
            .execute(&mut *tx)
            .await?;

        for (position, candidate) in ranked.iter().enumerate() {
            let rank_position = i64::try_from(position).unwrap_or(i64::MAX);
            sqlx::query(
                "INSERT INTO scenario_candidate (
                    thread_id,
                    archetype,
                    rank_position,
                    anchor_rate,
                    predicted_counter,
                    acceptance_likelihood,
                    predicted_close_days,
                    confidence,
                    script_stub,
                    degraded_reason,
                    score
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&thread_id.0)
            .bind(candidate.archetype.as_str())
            .bind(rank_position)
            .bind(candidate.anchor_rate.to_string())
            .bind(candidate.predicted_counter.to_string())
            .bind(candidate.acceptance_likelihood)
            .bind(i64::from(candidate.predicted_close_days))
            .bind(candidate.confidence)
            .bind(&candidate.script_stub)
            .bind(candidate.degraded_reason.as_deref())
            .bind(candidate.score)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<ScenarioCandidate>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                thread_id,
                archetype,
                anchor_rate,
                predicted_counter,
                acceptance_likelihood,
                predicted_close_days,
                confidence,
                script_stub,
                degraded_reason,
                score
             FROM scenario_candidate
             WHERE thread_id = ?
             ORDER BY rank_position ASC",
        )
        .bind(&thread_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(candidate_from_row).collect()
    }
}

fn message_from_row(row: SqliteRow) -> Result<NegotiationMessage, RepositoryError> {
    Ok(NegotiationMessage {
        id: MessageId(row.try_get("id")?),
        thread_id: ThreadId(row.try_get("thread_id")?),
        sender: parse_enum("message sender", row.try_get("sender")?, MessageSender::parse)?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        status: parse_enum("message status", row.try_get("status")?, MessageStatus::parse)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn candidate_from_row(row: SqliteRow) -> Result<ScenarioCandidate, RepositoryError> {
    Ok(ScenarioCandidate {
        thread_id: ThreadId(row.try_get("thread_id")?),
        archetype: parse_enum("archetype", row.try_get("archetype")?, Archetype::parse)?,
        anchor_rate: parse_decimal("anchor_rate", row.try_get("anchor_rate")?)?,
        predicted_counter: parse_decimal("predicted_counter", row.try_get("predicted_counter")?)?,
        acceptance_likelihood: row.try_get("acceptance_likelihood")?,
        predicted_close_days: parse_u32(
            "predicted_close_days",
            row.try_get("predicted_close_days")?,
        )?,
        confidence: row.try_get("confidence")?,
        script_stub: row.try_get("script_stub")?,
        degraded_reason: row.try_get("degraded_reason")?,
        score: row.try_get("score")?,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use parley_core::domain::message::{MessageId, MessageSender, MessageStatus, NegotiationMessage};
    use parley_core::domain::scenario::{Archetype, ScenarioCandidate};
    use parley_core::domain::thread::ThreadId;

    use super::{SqlCandidateRepository, SqlMessageRepository};
    use crate::repositories::{
        CandidateRepository, MessageRepository, SqlThreadRepository, ThreadRepository,
    };
    use crate::test_support::{parse_ts, sample_thread, setup_pool};

    fn candidate(thread_id: &ThreadId, archetype: Archetype, score: f64) -> ScenarioCandidate {
        ScenarioCandidate {
            thread_id: thread_id.clone(),
            archetype,
            anchor_rate: Decimal::new(1500, 0),
            predicted_counter: Decimal::new(1400, 0),
            acceptance_likelihood: 0.8,
            predicted_close_days: 7,
            confidence: 0.9,
            script_stub: "hold the rate".to_string(),
            degraded_reason: None,
            score,
        }
    }

    #[tokio::test]
    async fn messages_list_oldest_first() {
        let pool = setup_pool().await;
        let thread = sample_thread("T-MSG-001", "talent-1");
        SqlThreadRepository::new(pool.clone()).save(thread.clone()).await.expect("save thread");
        let repo = SqlMessageRepository::new(pool);

        for (id, at, sender) in [
            ("m-2", "2026-03-01T10:00:00Z", MessageSender::Ai),
            ("m-1", "2026-03-01T09:00:00Z", MessageSender::Brand),
        ] {
            repo.append(NegotiationMessage {
                id: MessageId(id.to_string()),
                thread_id: thread.id.clone(),
                sender,
                subject: "Spring campaign".to_string(),
                body: format!("body of {id}"),
                status: MessageStatus::Received,
                created_at: parse_ts(at),
            })
            .await
            .expect("append message");
        }

        let history = repo.list_for_thread(&thread.id).await.expect("list");
        let ids: Vec<_> = history.iter().map(|message| message.id.0.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
        assert_eq!(history[0].sender, MessageSender::Brand);
    }

    #[tokio::test]
    async fn replacing_candidates_discards_previous_cycle() {
        let pool = setup_pool().await;
        let thread = sample_thread("T-CAND-001", "talent-1");
        SqlThreadRepository::new(pool.clone()).save(thread.clone()).await.expect("save thread");
        let repo = SqlCandidateRepository::new(pool);

        repo.replace_for_thread(
            &thread.id,
            vec![
                candidate(&thread.id, Archetype::Aggressive, 80.0),
                candidate(&thread.id, Archetype::Balanced, 70.0),
                candidate(&thread.id, Archetype::Collaborative, 60.0),
            ],
        )
        .await
        .expect("first cycle");

        let mut degraded = candidate(&thread.id, Archetype::Balanced, 50.0);
        degraded.degraded_reason = Some("oracle timed out".to_string());
        repo.replace_for_thread(&thread.id, vec![degraded.clone()]).await.expect("second cycle");

        let stored = repo.list_for_thread(&thread.id).await.expect("list");
        assert_eq!(stored, vec![degraded]);
    }
}
