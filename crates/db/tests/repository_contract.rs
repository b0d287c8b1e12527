//! Runs the same behavioural contract against the SQLite and in-memory
//! repository sets.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use parley_core::domain::follow_up::{FollowUpId, ScheduledFollowUp};
use parley_core::domain::policy::AgentPolicy;
use parley_core::domain::thread::{
    DealTerms, NegotiationThread, TalentId, ThreadId, ThreadStage,
};
use parley_db::{connect_with_settings, migrations, RepositorySet};

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).map(|parsed| parsed.with_timezone(&Utc)).unwrap_or_default()
}

fn thread(id: &str) -> NegotiationThread {
    NegotiationThread {
        id: ThreadId(id.to_string()),
        talent_id: TalentId("talent-1".to_string()),
        brand_name: "Glow Co".to_string(),
        brand_email: "hello@glow.example".to_string(),
        subject_root: "Collab".to_string(),
        stage: ThreadStage::Open,
        stage_version: 0,
        terms: DealTerms {
            initial_offer: None,
            floor_rate: Decimal::new(1000, 0),
            target_rate: Decimal::new(1500, 0),
            deliverables: Vec::new(),
            creator_tier: "micro".to_string(),
            category: "beauty".to_string(),
            proposed_start: None,
            campaign_days: 7,
        },
        created_at: ts("2026-03-01T09:00:00Z"),
        updated_at: ts("2026-03-01T09:00:00Z"),
    }
}

async fn sql_set() -> ContractResult<RepositorySet> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| format!("connect: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrate: {error}"))?;
    Ok(RepositorySet::sql(pool))
}

async fn run_contract(repositories: RepositorySet) -> ContractResult {
    let subject = thread("T-CONTRACT-1");
    repositories.threads.save(subject.clone()).await.map_err(|error| error.to_string())?;

    // Missing policy stays missing; callers fall back to the safe default.
    let policy = repositories
        .policies
        .find_for_talent(&subject.talent_id)
        .await
        .map_err(|error| error.to_string())?;
    require!(policy.is_none());
    repositories
        .policies
        .save(AgentPolicy::safe_default(subject.talent_id.clone()))
        .await
        .map_err(|error| error.to_string())?;

    // Stage compare-and-set.
    let guard = subject.guard();
    let now = ts("2026-03-01T10:00:00Z");
    let moved = repositories
        .threads
        .compare_and_set_stage(&subject.id, guard, ThreadStage::Simulated, now)
        .await
        .map_err(|error| error.to_string())?;
    require!(moved.is_some(), "first compare-and-set should land");
    let stale = repositories
        .threads
        .compare_and_set_stage(&subject.id, guard, ThreadStage::Decided, now)
        .await
        .map_err(|error| error.to_string())?;
    require!(stale.is_none(), "stale guard should be rejected");

    // One active follow-up per thread, cancellable before it fires.
    let due_at = now + Duration::hours(48);
    let make = |id: &str| ScheduledFollowUp {
        id: FollowUpId(id.to_string()),
        thread_id: subject.id.clone(),
        due_at,
        cancelled_at: None,
        fired_at: None,
        created_at: now,
    };
    let first = repositories
        .follow_ups
        .schedule_if_absent(make("fu-a"))
        .await
        .map_err(|error| error.to_string())?;
    let second = repositories
        .follow_ups
        .schedule_if_absent(make("fu-b"))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(first.id, second.id);

    let cancelled = repositories
        .follow_ups
        .cancel_active(&subject.id, now + Duration::hours(1))
        .await
        .map_err(|error| error.to_string())?;
    require!(cancelled);
    let fired = repositories
        .follow_ups
        .mark_fired(&first.id, due_at)
        .await
        .map_err(|error| error.to_string())?;
    require!(!fired, "cancelled follow-up must not fire");
    let due = repositories
        .follow_ups
        .list_due(due_at + Duration::hours(1), 10)
        .await
        .map_err(|error| error.to_string())?;
    require!(due.is_empty());

    Ok(())
}

#[tokio::test]
async fn sql_repositories_honour_contract() -> ContractResult {
    run_contract(sql_set().await?).await
}

#[tokio::test]
async fn in_memory_repositories_honour_contract() -> ContractResult {
    run_contract(RepositorySet::in_memory()).await
}
