use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub ip: String,
    /// First non-empty of username, email, id and ip.
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameVersion {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub brand: String,
    pub family: String,
    pub model: String,
}

/// One replay as returned to API callers. Every field has a concrete value;
/// anything missing from the backend row is left at its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Replay {
    pub id: String,
    pub project_id: i64,
    pub trace_ids: Vec<String>,
    pub error_ids: Vec<String>,
    pub environment: String,
    pub tags: BTreeMap<String, BTreeSet<String>>,
    pub user: ReplayUser,
    pub sdk: NameVersion,
    pub os: NameVersion,
    pub browser: NameVersion,
    pub device: Device,
    pub urls: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Seconds between `started_at` and `finished_at`.
    pub duration: i64,
    pub count_errors: i64,
    pub count_warnings: i64,
    pub count_infos: i64,
    pub count_dead_clicks: i64,
    pub count_rage_clicks: i64,
    pub count_urls: i64,
    pub count_segments: i64,
    /// 1 to 10, weighted by errors and pages visited.
    pub activity: i64,
    pub is_archived: bool,
    pub releases: Vec<String>,
    pub platform: String,
    pub dist: String,
    pub replay_type: String,
    /// Users who have viewed the replay, ascending.
    pub viewed_by_ids: Vec<i64>,
    /// Whether the requesting user is in `viewed_by_ids`.
    pub has_viewed: bool,
}

impl Replay {
    /// What is left of a replay once it has been archived.
    pub fn archived(id: String) -> Self {
        Self {
            id,
            is_archived: true,
            ..Default::default()
        }
    }
}

/// Activity score: `(errors * 25 + urls * 5) / 10` clamped to `1..=10`.
pub fn activity_score(count_errors: i64, count_urls: i64) -> i64 {
    let weighted = count_errors.saturating_mul(25).saturating_add(count_urls.saturating_mul(5));
    (weighted / 10).clamp(1, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_score() {
        assert_eq!(activity_score(0, 0), 1);
        assert_eq!(activity_score(0, 3), 1);
        assert_eq!(activity_score(1, 2), 3);
        assert_eq!(activity_score(10, 10), 10);
    }

    #[test]
    fn test_archived_replay_is_bare() {
        let replay = Replay::archived("abc".to_string());
        assert_eq!(replay.id, "abc");
        assert!(replay.is_archived);
        assert_eq!(replay.count_segments, 0);
        assert!(replay.urls.is_empty());
        assert!(replay.viewed_by_ids.is_empty());
        assert_eq!(replay.started_at, DateTime::<Utc>::default());
    }
}
