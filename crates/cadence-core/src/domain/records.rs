//! Lifecycle records shared by the repositories.
//!
//! State transitions (StatusEntry):
//! - SCHEDULED -> ENQUEUED -> STARTED -> COMPLETED
//! - SCHEDULED -> ENQUEUED -> STARTED -> FAILED
//! - SCHEDULED -> CANCELLED (claimed while the task name is cancelled)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{TaskInstanceId, TaskName};

/// Per-instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Scheduled,
    Enqueued,
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Scheduled,
        Status::Enqueued,
        Status::Started,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Status::Scheduled => 0,
            Status::Enqueued => 1,
            Status::Started => 2,
            Status::Completed | Status::Failed | Status::Cancelled => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Scheduled => "SCHEDULED",
            Status::Enqueued => "ENQUEUED",
            Status::Started => "STARTED",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

/// Coarse per-name execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Finished,
    Cancelled,
    Resumed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Finished => "FINISHED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Resumed => "RESUMED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ExecutionStatus::Running,
            ExecutionStatus::Finished,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Resumed,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown execution status: {s}"))
    }
}

/// Extra details attached to a status entry.
///
/// Fields are filled in once and never overwritten (see [`AdditionalInfo::merge`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl AdditionalInfo {
    pub fn failure(message: impl Into<String>, stack_trace: Vec<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            stack_trace: Some(stack_trace),
            elapsed_ms: None,
        }
    }

    pub fn elapsed(elapsed_ms: u64) -> Self {
        Self {
            elapsed_ms: Some(elapsed_ms),
            ..Self::default()
        }
    }

    /// Existing fields win; `other` only fills gaps.
    pub fn merge(self, other: AdditionalInfo) -> AdditionalInfo {
        AdditionalInfo {
            error_message: self.error_message.or(other.error_message),
            stack_trace: self.stack_trace.or(other.stack_trace),
            elapsed_ms: self.elapsed_ms.or(other.elapsed_ms),
        }
    }
}

/// The due-queue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTaskInstance {
    pub id: TaskInstanceId,
    pub name: TaskName,
    pub execution_time: DateTime<Utc>,
}

/// A claimed `(id, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskInstanceName {
    pub id: TaskInstanceId,
    pub name: TaskName,
}

/// Per-instance lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub instance: TaskInstanceId,
    pub task_name: TaskName,
    pub status: Status,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub additional_info: Option<AdditionalInfo>,
}

impl StatusEntry {
    pub fn scheduled(instance: &ScheduledTaskInstance, created_at: DateTime<Utc>) -> Self {
        Self {
            instance: instance.id.clone(),
            task_name: instance.name.clone(),
            status: Status::Scheduled,
            scheduled_for: instance.execution_time,
            created_at,
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            additional_info: None,
        }
    }

    /// Apply one status transition.
    ///
    /// - status は lifecycle の順にしか進まない（終端状態からは動かない）
    /// - その遷移のタイムスタンプだけを、未設定の場合に限りセットする
    /// - additional_info は merge（既存フィールドは上書きしない）
    ///
    /// Returns whether the status itself moved.
    pub fn advance(
        &mut self,
        status: Status,
        moment: DateTime<Utc>,
        info: Option<AdditionalInfo>,
    ) -> bool {
        if let Some(info) = info {
            self.additional_info = Some(match self.additional_info.take() {
                Some(existing) => existing.merge(info),
                None => info,
            });
        }

        if self.status.is_terminal() || status.rank() <= self.status.rank() {
            return false;
        }

        let slot = match status {
            Status::Scheduled => None,
            Status::Enqueued => Some(&mut self.enqueued_at),
            Status::Started => Some(&mut self.started_at),
            Status::Completed | Status::Failed | Status::Cancelled => Some(&mut self.finished_at),
        };
        if let Some(slot) = slot {
            slot.get_or_insert(moment);
        }
        self.status = status;
        true
    }
}

/// Per-name execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub name: TaskName,
    pub current_instance: TaskInstanceId,
    pub status: ExecutionStatus,
    pub retry_count: u32,
    pub cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ExecutionEntry {
    pub fn new(name: TaskName, current_instance: TaskInstanceId, status: ExecutionStatus) -> Self {
        Self {
            name,
            current_instance,
            status,
            retry_count: 0,
            cancelled: false,
            cancelled_at: None,
        }
    }

    /// RUNNING は常に受け付けて current_instance を差し替える。
    /// FINISHED は current_instance が一致する場合のみ（stale-writer guard）。
    /// Returns whether the entry changed.
    pub fn apply(&mut self, instance: &TaskInstanceId, status: ExecutionStatus) -> bool {
        match status {
            ExecutionStatus::Running => {
                self.current_instance = instance.clone();
                self.status = ExecutionStatus::Running;
                true
            }
            ExecutionStatus::Finished if &self.current_instance == instance => {
                self.status = ExecutionStatus::Finished;
                true
            }
            _ => false,
        }
    }

    /// Sets the cancel flag unless it is already set.
    pub fn cancel(&mut self, moment: DateTime<Utc>) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.cancelled_at = Some(moment);
        true
    }

    /// Compare-and-set from FINISHED/CANCELLED to RESUMED.
    pub fn try_resume(&mut self) -> bool {
        if !matches!(
            self.status,
            ExecutionStatus::Finished | ExecutionStatus::Cancelled
        ) {
            return false;
        }
        self.force_resume();
        true
    }

    pub fn force_resume(&mut self) {
        self.status = ExecutionStatus::Resumed;
        self.cancelled = false;
        self.cancelled_at = None;
    }
}
