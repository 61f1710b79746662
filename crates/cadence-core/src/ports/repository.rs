//! Repository contracts.
//!
//! 3 つの repository（Tasks / Status / Executions）はトランザクションの中でしか触らない。
//! `TransactionManager::transaction` に渡した block がエラーを返したら、
//! その block 内の変更はすべてロールバックされる。
//!
//! トランザクションハンドルは `&mut dyn Repositories` として明示的に渡す
//! （スレッドローカルな暗黙の状態は持たない）。

use chrono::{DateTime, Utc};

use crate::domain::{
    AdditionalInfo, ExecutionEntry, ExecutionStatus, ScheduledTaskInstance, Status, StatusEntry,
    StoreError, TaskInstanceId, TaskInstanceName, TaskName,
};

/// The due-queue.
pub trait TasksRepository {
    /// Idempotent insert; `false` when the id already exists (claimed or not).
    fn add_instance(&mut self, instance: &ScheduledTaskInstance) -> Result<bool, StoreError>;

    /// Atomically select and mark claimed every unclaimed row due at `now`.
    ///
    /// No two concurrent callers (same or different process) receive the same row.
    fn pick_due(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskInstanceName>, StoreError>;

    /// Unclaimed rows due at `moment` (all unclaimed rows when `None`), earliest first.
    fn list_due(
        &mut self,
        moment: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScheduledTaskInstance>, StoreError>;

    fn count_due(&mut self, moment: Option<DateTime<Utc>>) -> Result<usize, StoreError> {
        Ok(self.list_due(moment)?.len())
    }
}

/// Per-instance lifecycle records.
pub trait StatusRepository {
    /// Insert the SCHEDULED entry; an existing entry for the id is left untouched.
    fn insert_status(
        &mut self,
        instance: &ScheduledTaskInstance,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Apply one transition via [`StatusEntry::advance`]. `false` if nothing moved.
    fn update_status(
        &mut self,
        status: Status,
        instance: &TaskInstanceId,
        moment: DateTime<Utc>,
        info: Option<AdditionalInfo>,
    ) -> Result<bool, StoreError>;

    fn status_of(&mut self, instance: &TaskInstanceId) -> Result<Option<StatusEntry>, StoreError>;

    /// Entries of one task whose `scheduled_for` lies in `[from, to]`.
    fn task_history(
        &mut self,
        name: &TaskName,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>, StoreError>;

    /// All entries whose `scheduled_for` lies in `[from, to]`.
    fn history(
        &mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>, StoreError>;

    /// COMPLETED and FAILED entries.
    fn finished_tasks(&mut self) -> Result<Vec<StatusEntry>, StoreError>;
}

/// Per-name execution records.
pub trait ExecutionsRepository {
    fn execution(&mut self, name: &TaskName) -> Result<Option<ExecutionEntry>, StoreError>;

    /// 0 when the name has no execution entry yet.
    fn retry_count(&mut self, name: &TaskName) -> Result<u32, StoreError>;

    fn set_retry_count(&mut self, name: &TaskName, count: u32) -> Result<(), StoreError>;

    fn add_retry_count(&mut self, name: &TaskName, delta: u32) -> Result<(), StoreError>;

    /// RUNNING upserts and takes over `current_instance`; FINISHED is discarded
    /// when `instance` is no longer current. Other statuses are rejected.
    fn update_execution(
        &mut self,
        name: &TaskName,
        instance: &TaskInstanceId,
        status: ExecutionStatus,
    ) -> Result<bool, StoreError>;

    /// Set the cancel flag; `false` if already cancelled or unknown.
    fn cancel(&mut self, name: &TaskName, moment: DateTime<Utc>) -> Result<bool, StoreError>;

    /// If the name is cancelled, flip its status to CANCELLED and return the cancel time.
    fn when_cancelled(&mut self, name: &TaskName) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// FINISHED/CANCELLED -> RESUMED (clears the cancel flag).
    fn try_resume(&mut self, name: &TaskName) -> Result<bool, StoreError>;

    /// Unconditional RESUMED; `false` only for unknown names.
    fn force_resume(&mut self, name: &TaskName) -> Result<bool, StoreError>;

    fn status_and_cancelled(
        &mut self,
        name: &TaskName,
    ) -> Result<Option<(ExecutionStatus, bool)>, StoreError>;
}

pub trait Repositories: TasksRepository + StatusRepository + ExecutionsRepository {}

impl<T> Repositories for T where T: TasksRepository + StatusRepository + ExecutionsRepository {}

pub trait TransactionManager: Send + Sync {
    fn transaction<T, F>(&self, block: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Repositories) -> Result<T, StoreError>;
}
