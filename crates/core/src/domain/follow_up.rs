use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::thread::ThreadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FollowUpId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledFollowUp {
    pub id: FollowUpId,
    pub thread_id: ThreadId,
    pub due_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledFollowUp {
    pub fn is_active(&self) -> bool {
        self.cancelled_at.is_none() && self.fired_at.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.due_at <= now
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{FollowUpId, ScheduledFollowUp};
    use crate::domain::thread::ThreadId;

    #[test]
    fn cancelled_follow_up_is_never_due() {
        let now = Utc::now();
        let mut follow_up = ScheduledFollowUp {
            id: FollowUpId("fu-1".to_string()),
            thread_id: ThreadId("T-1".to_string()),
            due_at: now - Duration::hours(1),
            cancelled_at: None,
            fired_at: None,
            created_at: now - Duration::hours(49),
        };
        assert!(follow_up.is_due(now));

        follow_up.cancelled_at = Some(now);
        assert!(!follow_up.is_active());
        assert!(!follow_up.is_due(now));
    }
}
