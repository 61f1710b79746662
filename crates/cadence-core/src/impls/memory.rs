//! InMemoryStore - 開発・テスト用のストア
//!
//! # 実装詳細
//! - 1 つの Mutex で全状態を保護し、トランザクション中はロックを保持し続ける（直列化）
//! - 変更前の値を undo journal に積み、block がエラーを返したら逆順に戻す
//! - claim 済みの行も残しておく（重複 ID の検出のため）

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::domain::{
    AdditionalInfo, ExecutionEntry, ExecutionStatus, ScheduledTaskInstance, Status, StatusEntry,
    StoreError, TaskInstanceId, TaskInstanceName, TaskName,
};
use crate::ports::{
    ExecutionsRepository, Repositories, StatusRepository, TasksRepository, TransactionManager,
};

#[derive(Debug, Clone)]
struct TaskRow {
    instance: ScheduledTaskInstance,
    claimed: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: BTreeMap<TaskInstanceId, TaskRow>,
    statuses: HashMap<TaskInstanceId, StatusEntry>,
    executions: HashMap<TaskName, ExecutionEntry>,
}

/// Prior value of a touched row.
enum Undo {
    Task(TaskInstanceId, Option<TaskRow>),
    Status(TaskInstanceId, Option<StatusEntry>),
    Execution(TaskName, Option<ExecutionEntry>),
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionManager for InMemoryStore {
    fn transaction<T, F>(&self, block: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Repositories) -> Result<T, StoreError>,
    {
        let mut guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut tx = MemoryTx {
            state: &mut *guard,
            journal: Vec::new(),
        };
        let result = block(&mut tx);
        if result.is_err() {
            tx.rollback();
        }
        result
    }
}

struct MemoryTx<'a> {
    state: &'a mut MemoryState,
    journal: Vec<Undo>,
}

impl MemoryTx<'_> {
    fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Task(id, Some(row)) => {
                    self.state.tasks.insert(id, row);
                }
                Undo::Task(id, None) => {
                    self.state.tasks.remove(&id);
                }
                Undo::Status(id, Some(entry)) => {
                    self.state.statuses.insert(id, entry);
                }
                Undo::Status(id, None) => {
                    self.state.statuses.remove(&id);
                }
                Undo::Execution(name, Some(entry)) => {
                    self.state.executions.insert(name, entry);
                }
                Undo::Execution(name, None) => {
                    self.state.executions.remove(&name);
                }
            }
        }
    }

    fn remember_task(&mut self, id: &TaskInstanceId) {
        let prior = self.state.tasks.get(id).cloned();
        self.journal.push(Undo::Task(id.clone(), prior));
    }

    fn remember_status(&mut self, id: &TaskInstanceId) {
        let prior = self.state.statuses.get(id).cloned();
        self.journal.push(Undo::Status(id.clone(), prior));
    }

    fn remember_execution(&mut self, name: &TaskName) {
        let prior = self.state.executions.get(name).cloned();
        self.journal.push(Undo::Execution(name.clone(), prior));
    }

    /// Journal the entry, then mutate it in place. `None` for unknown names.
    fn with_execution<R>(
        &mut self,
        name: &TaskName,
        f: impl FnOnce(&mut ExecutionEntry) -> R,
    ) -> Option<R> {
        if !self.state.executions.contains_key(name) {
            return None;
        }
        self.remember_execution(name);
        self.state.executions.get_mut(name).map(f)
    }

    fn unclaimed_due(&self, moment: Option<DateTime<Utc>>) -> Vec<ScheduledTaskInstance> {
        let mut due: Vec<ScheduledTaskInstance> = self
            .state
            .tasks
            .values()
            .filter(|row| !row.claimed)
            .filter(|row| moment.is_none_or(|m| row.instance.execution_time <= m))
            .map(|row| row.instance.clone())
            .collect();
        due.sort_by(|a, b| a.execution_time.cmp(&b.execution_time).then(a.id.cmp(&b.id)));
        due
    }

    fn statuses_where(&self, keep: impl Fn(&StatusEntry) -> bool) -> Vec<StatusEntry> {
        let mut out: Vec<StatusEntry> = self
            .state
            .statuses
            .values()
            .filter(|e| keep(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.instance.cmp(&b.instance))
        });
        out
    }
}

fn in_window(at: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.is_none_or(|from| at >= from) && to.is_none_or(|to| at <= to)
}

impl TasksRepository for MemoryTx<'_> {
    fn add_instance(&mut self, instance: &ScheduledTaskInstance) -> Result<bool, StoreError> {
        if self.state.tasks.contains_key(&instance.id) {
            return Ok(false);
        }
        self.remember_task(&instance.id);
        self.state.tasks.insert(
            instance.id.clone(),
            TaskRow {
                instance: instance.clone(),
                claimed: false,
            },
        );
        Ok(true)
    }

    fn pick_due(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskInstanceName>, StoreError> {
        let due = self.unclaimed_due(Some(now));
        let mut picked = Vec::with_capacity(due.len());
        for instance in due {
            self.remember_task(&instance.id);
            if let Some(row) = self.state.tasks.get_mut(&instance.id) {
                row.claimed = true;
            }
            picked.push(TaskInstanceName {
                id: instance.id,
                name: instance.name,
            });
        }
        Ok(picked)
    }

    fn list_due(
        &mut self,
        moment: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScheduledTaskInstance>, StoreError> {
        Ok(self.unclaimed_due(moment))
    }
}

impl StatusRepository for MemoryTx<'_> {
    fn insert_status(
        &mut self,
        instance: &ScheduledTaskInstance,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.state.statuses.contains_key(&instance.id) {
            self.remember_status(&instance.id);
            self.state.statuses.insert(
                instance.id.clone(),
                StatusEntry::scheduled(instance, created_at),
            );
        }
        Ok(())
    }

    fn update_status(
        &mut self,
        status: Status,
        instance: &TaskInstanceId,
        moment: DateTime<Utc>,
        info: Option<AdditionalInfo>,
    ) -> Result<bool, StoreError> {
        if !self.state.statuses.contains_key(instance) {
            return Ok(false);
        }
        self.remember_status(instance);
        Ok(self
            .state
            .statuses
            .get_mut(instance)
            .is_some_and(|entry| entry.advance(status, moment, info)))
    }

    fn status_of(&mut self, instance: &TaskInstanceId) -> Result<Option<StatusEntry>, StoreError> {
        Ok(self.state.statuses.get(instance).cloned())
    }

    fn task_history(
        &mut self,
        name: &TaskName,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>, StoreError> {
        Ok(self.statuses_where(|e| &e.task_name == name && in_window(e.scheduled_for, from, to)))
    }

    fn history(
        &mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>, StoreError> {
        Ok(self.statuses_where(|e| in_window(e.scheduled_for, from, to)))
    }

    fn finished_tasks(&mut self) -> Result<Vec<StatusEntry>, StoreError> {
        Ok(self.statuses_where(|e| matches!(e.status, Status::Completed | Status::Failed)))
    }
}

impl ExecutionsRepository for MemoryTx<'_> {
    fn execution(&mut self, name: &TaskName) -> Result<Option<ExecutionEntry>, StoreError> {
        Ok(self.state.executions.get(name).cloned())
    }

    fn retry_count(&mut self, name: &TaskName) -> Result<u32, StoreError> {
        Ok(self
            .state
            .executions
            .get(name)
            .map_or(0, |e| e.retry_count))
    }

    fn set_retry_count(&mut self, name: &TaskName, count: u32) -> Result<(), StoreError> {
        self.with_execution(name, |e| e.retry_count = count);
        Ok(())
    }

    fn add_retry_count(&mut self, name: &TaskName, delta: u32) -> Result<(), StoreError> {
        self.with_execution(name, |e| e.retry_count = e.retry_count.saturating_add(delta));
        Ok(())
    }

    fn update_execution(
        &mut self,
        name: &TaskName,
        instance: &TaskInstanceId,
        status: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        if let Some(changed) = self.with_execution(name, |e| e.apply(instance, status)) {
            return Ok(changed);
        }
        if status != ExecutionStatus::Running {
            return Ok(false);
        }
        self.remember_execution(name);
        self.state.executions.insert(
            name.clone(),
            ExecutionEntry::new(name.clone(), instance.clone(), status),
        );
        Ok(true)
    }

    fn cancel(&mut self, name: &TaskName, moment: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.with_execution(name, |e| e.cancel(moment)).unwrap_or(false))
    }

    fn when_cancelled(&mut self, name: &TaskName) -> Result<Option<DateTime<Utc>>, StoreError> {
        let cancelled = self
            .state
            .executions
            .get(name)
            .is_some_and(|e| e.cancelled);
        if !cancelled {
            return Ok(None);
        }
        Ok(self
            .with_execution(name, |e| {
                e.status = ExecutionStatus::Cancelled;
                e.cancelled_at
            })
            .flatten())
    }

    fn try_resume(&mut self, name: &TaskName) -> Result<bool, StoreError> {
        Ok(self.with_execution(name, |e| e.try_resume()).unwrap_or(false))
    }

    fn force_resume(&mut self, name: &TaskName) -> Result<bool, StoreError> {
        Ok(self.with_execution(name, |e| e.force_resume()).is_some())
    }

    fn status_and_cancelled(
        &mut self,
        name: &TaskName,
    ) -> Result<Option<(ExecutionStatus, bool)>, StoreError> {
        Ok(self
            .state
            .executions
            .get(name)
            .map(|e| (e.status, e.cancelled)))
    }
}
