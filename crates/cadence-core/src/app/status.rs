//! Status - 管理・参照用のクエリ
//!
//! ダッシュボードや HTTP 層から使う読み取りモデルと、cancel / resume の操作。
//! トランスポートは持たない。結果はすべて serde で Serialize できる。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::manager::{CancelOutcome, TaskManager};
use crate::domain::schedule::add_duration;
use crate::domain::{ExecutionStatus, Status, StatusEntry, StoreError, TaskInstanceId, TaskName};
use crate::ports::TransactionManager;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("task not found: {0}")]
    NotFound(TaskName),

    #[error("task {task}: {reason}")]
    Conflict { task: TaskName, reason: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTaskInfo {
    pub id: TaskInstanceId,
    pub name: TaskName,
    pub execution_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTaskInfo {
    pub name: TaskName,
    pub last_failure: DateTime<Utc>,
    /// The most recent finished instance completed.
    pub recovered: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub name: TaskName,
    pub success_count: usize,
    pub failure_count: usize,
    pub last_execution: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailedTaskInfo {
    pub name: TaskName,
    pub execution_status: Option<ExecutionStatus>,
    pub cancelled: bool,
    /// Newest first.
    pub history: Vec<StatusEntry>,
}

/// Filter for [`TaskStatusService::tasks`]; the window applies to `scheduled_for`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub name: Option<TaskName>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub status: Option<Status>,
}

#[derive(Clone)]
pub struct TaskStatusService {
    manager: Arc<TaskManager>,
}

impl TaskStatusService {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }

    fn due_limit(&self, due_within: Option<Duration>) -> Option<DateTime<Utc>> {
        due_within.map(|window| add_duration(self.manager.now(), window))
    }

    /// Unclaimed instances due within the window (all when `None`), earliest first.
    pub fn scheduled_tasks(
        &self,
        due_within: Option<Duration>,
    ) -> Result<Vec<ScheduledTaskInfo>, StoreError> {
        let limit = self.due_limit(due_within);
        let due = self.manager.store().transaction(|tx| tx.list_due(limit))?;
        Ok(due
            .into_iter()
            .map(|row| ScheduledTaskInfo {
                id: row.id,
                name: row.name,
                execution_time: row.execution_time,
            })
            .collect())
    }

    pub fn count_scheduled(&self, due_within: Option<Duration>) -> Result<usize, StoreError> {
        let limit = self.due_limit(due_within);
        self.manager.store().transaction(|tx| tx.count_due(limit))
    }

    /// Every task name that has failed at least once, newest failure first.
    pub fn failed_tasks(&self) -> Result<Vec<FailedTaskInfo>, StoreError> {
        let finished = self.manager.store().transaction(|tx| tx.finished_tasks())?;

        let mut by_name: BTreeMap<TaskName, Vec<StatusEntry>> = BTreeMap::new();
        for entry in finished {
            by_name.entry(entry.task_name.clone()).or_default().push(entry);
        }

        let mut failed: Vec<FailedTaskInfo> = by_name
            .into_iter()
            .filter_map(|(name, entries)| {
                let last_failed = entries
                    .iter()
                    .filter(|e| e.status == Status::Failed)
                    .max_by_key(|e| e.finished_at)?;
                let latest = entries.iter().max_by_key(|e| e.finished_at)?;
                Some(FailedTaskInfo {
                    name,
                    last_failure: last_failed.finished_at.unwrap_or(last_failed.created_at),
                    recovered: latest.status == Status::Completed,
                    error_message: last_failed
                        .additional_info
                        .as_ref()
                        .and_then(|info| info.error_message.clone()),
                })
            })
            .collect();
        failed.sort_by(|a, b| b.last_failure.cmp(&a.last_failure));
        Ok(failed)
    }

    /// Per-name success/failure counts and last start time.
    pub fn tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskSummary>, StoreError> {
        let entries = self.manager.store().transaction(|tx| match &filter.name {
            Some(name) => tx.task_history(name, filter.from, filter.to),
            None => tx.history(filter.from, filter.to),
        })?;

        let mut summaries: BTreeMap<TaskName, TaskSummary> = BTreeMap::new();
        for entry in entries
            .into_iter()
            .filter(|e| filter.status.is_none_or(|status| e.status == status))
        {
            let summary = summaries
                .entry(entry.task_name.clone())
                .or_insert_with(|| TaskSummary {
                    name: entry.task_name.clone(),
                    success_count: 0,
                    failure_count: 0,
                    last_execution: None,
                });
            match entry.status {
                Status::Completed => summary.success_count += 1,
                Status::Failed => summary.failure_count += 1,
                _ => {}
            }
            summary.last_execution = summary.last_execution.max(entry.started_at);
        }
        Ok(summaries.into_values().collect())
    }

    pub fn task_history(&self, name: &TaskName) -> Result<DetailedTaskInfo, ControlError> {
        let (mut history, execution) = self
            .manager
            .store()
            .transaction(|tx| Ok((tx.task_history(name, None, None)?, tx.execution(name)?)))?;
        if history.is_empty() && execution.is_none() {
            return Err(ControlError::NotFound(name.clone()));
        }
        history.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.scheduled_for.cmp(&a.scheduled_for))
        });
        Ok(DetailedTaskInfo {
            name: name.clone(),
            execution_status: execution.as_ref().map(|e| e.status),
            cancelled: execution.is_some_and(|e| e.cancelled),
            history,
        })
    }

    pub fn cancel(&self, name: &TaskName) -> Result<(), ControlError> {
        match self.manager.cancel(name)? {
            CancelOutcome::Cancelled => Ok(()),
            CancelOutcome::AlreadyCancelled => Err(ControlError::Conflict {
                task: name.clone(),
                reason: "already cancelled",
            }),
            CancelOutcome::AlreadyFinished => Err(ControlError::Conflict {
                task: name.clone(),
                reason: "already finished",
            }),
            CancelOutcome::Unknown => Err(ControlError::NotFound(name.clone())),
        }
    }

    pub fn resume(&self, name: &TaskName) -> Result<(), ControlError> {
        if self.manager.resume(name)? {
            return Ok(());
        }
        let known = self
            .manager
            .store()
            .transaction(|tx| tx.status_and_cancelled(name))?
            .is_some();
        if known {
            Err(ControlError::Conflict {
                task: name.clone(),
                reason: "already running or resumed",
            })
        } else {
            Err(ControlError::NotFound(name.clone()))
        }
    }

    pub fn force_resume(&self, name: &TaskName) -> Result<(), ControlError> {
        if self.manager.force_resume(name)? {
            Ok(())
        } else {
            Err(ControlError::NotFound(name.clone()))
        }
    }
}
