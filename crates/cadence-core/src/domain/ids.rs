//! Domain identifiers.
//!
//! - `TaskName`: プロセス内で一意なタスク名（resolver のキー）
//! - `TaskInstanceId`: スケジュールされた 1 回の実行を識別する ID
//!
//! 最初のインスタンスの ID はタスク名そのもの（冪等な初回スケジュールのため）。
//! 以降のインスタンス（retry, 繰り返し）は ULID で新規採番する。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::ports::Clock;

/// Name of a registered task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one scheduled execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskInstanceId(String);

impl TaskInstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 初回インスタンスの決定的な ID（= タスク名）
    pub fn first_of(name: &TaskName) -> Self {
        Self(name.as_str().to_string())
    }

    /// Clock の時刻 + ランダム部分で ULID を生成
    ///
    /// FixedClock を使っても、ランダム部分があるので ID は毎回異なる
    pub fn fresh(clock: &dyn Clock) -> Self {
        let timestamp_ms = clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        Self(ulid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskInstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for TaskInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn first_instance_id_is_the_task_name() {
        let name = TaskName::from("nightly-report");
        assert_eq!(TaskInstanceId::first_of(&name).as_str(), "nightly-report");
    }

    #[test]
    fn fresh_ids_share_the_clock_timestamp_but_differ() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::new(fixed_time);

        let id1 = TaskInstanceId::fresh(&clock);
        let id2 = TaskInstanceId::fresh(&clock);
        assert_ne!(id1, id2);

        let ulid1 = Ulid::from_string(id1.as_str()).unwrap();
        let ulid2 = Ulid::from_string(id2.as_str()).unwrap();
        assert_eq!(ulid1.timestamp_ms(), ulid2.timestamp_ms());
        assert_eq!(ulid1.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn names_serialize_as_plain_strings() {
        let name = TaskName::from("t1");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"t1\"");
    }
}
