//! TaskManager - タスクインスタンスのライフサイクルを動かす
//!
//! StatusEntry / ExecutionEntry を書き換えるのはこのモジュールだけ。
//! 変更を伴う操作はそれぞれ 1 つのトランザクションの中で行う。

use chrono::{DateTime, Utc};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::resolver::TaskResolver;
use crate::domain::{
    AdditionalInfo, ExecutionStatus, ScheduledTaskInstance, Status, StoreError, TaskInstanceId,
    TaskName,
};
use crate::impls::Store;
use crate::ports::{Clock, Repositories, TransactionManager};
use crate::task::{Task, TaskInstance, TaskResult};

/// Result of [`TaskManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    AlreadyFinished,
    /// The name has never been scheduled.
    Unknown,
}

pub struct TaskManager {
    store: Store,
    resolver: Arc<TaskResolver>,
    clock: Arc<dyn Clock>,
}

impl TaskManager {
    pub fn new(store: Store, resolver: Arc<TaskResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            resolver,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<TaskResolver> {
        &self.resolver
    }

    /// Schedule an instance of a registered task.
    ///
    /// Returns `false` (and logs) when `instance` already exists.
    pub fn schedule_instance(
        &self,
        name: &TaskName,
        moment: DateTime<Utc>,
        is_retry: bool,
        instance: TaskInstanceId,
    ) -> Result<bool, StoreError> {
        let now = self.now();
        self.store
            .transaction(|tx| schedule_in(tx, name, moment, is_retry, instance, now))
    }

    /// New, non-retry instance with a fresh id (recurrences, continuations).
    pub fn schedule(&self, name: &TaskName, moment: DateTime<Utc>) -> Result<bool, StoreError> {
        let id = TaskInstanceId::fresh(self.clock.as_ref());
        self.schedule_instance(name, moment, false, id)
    }

    pub fn schedule_retry(
        &self,
        name: &TaskName,
        moment: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = TaskInstanceId::fresh(self.clock.as_ref());
        self.schedule_instance(name, moment, true, id)
    }

    /// First-time scheduling: register `task`, then schedule it under the
    /// deterministic first instance id.
    pub fn schedule_task(&self, task: Task, moment: DateTime<Utc>) -> Result<bool, StoreError> {
        let name = task.name().clone();
        self.resolver.register(task);
        self.schedule_instance(&name, moment, false, TaskInstanceId::first_of(&name))
    }

    /// Claim everything due now.
    ///
    /// - cancel 済みの名前: CANCELLED にして返さない（本体は実行しない）
    /// - resolver に無い名前: ログを出して捨てる（claim 済みのまま、ステータスも触らない）
    /// - それ以外: ENQUEUED にして返す
    pub fn pick_due_now(&self) -> Result<Vec<TaskInstance>, StoreError> {
        let now = self.now();
        self.store.transaction(|tx| {
            let picked = tx.pick_due(now)?;
            let mut runnable = Vec::with_capacity(picked.len());
            for claimed in picked {
                if let Some(cancelled_at) = tx.when_cancelled(&claimed.name)? {
                    tx.update_status(Status::Cancelled, &claimed.id, now, None)?;
                    info!(
                        task = %claimed.name,
                        instance = %claimed.id,
                        %cancelled_at,
                        "skipping cancelled task"
                    );
                    continue;
                }
                let Some(task) = self.resolver.get(&claimed.name) else {
                    continue;
                };
                tx.update_status(Status::Enqueued, &claimed.id, now, None)?;
                debug!(task = %claimed.name, instance = %claimed.id, "claimed");
                runnable.push(TaskInstance::new(claimed.id, task));
            }
            Ok(runnable)
        })
    }

    pub fn update_task_status_started(
        &self,
        _name: &TaskName,
        instance: &TaskInstanceId,
    ) -> Result<(), StoreError> {
        let now = self.now();
        self.store.transaction(|tx| {
            tx.update_status(Status::Started, instance, now, None)?;
            Ok(())
        })
    }

    pub fn update_task_status_finished(
        &self,
        name: &TaskName,
        instance: &TaskInstanceId,
        result: &TaskResult,
    ) -> Result<(), StoreError> {
        let now = self.now();
        let (status, info) = match result {
            TaskResult::Success(elapsed) => (
                Status::Completed,
                AdditionalInfo::elapsed(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
            ),
            TaskResult::Failed(failure) => (
                Status::Failed,
                AdditionalInfo::failure(failure.message.clone(), failure.causes.clone()),
            ),
        };
        self.store.transaction(|tx| {
            tx.update_status(status, instance, now, Some(info))?;
            // 後続のインスタンスに current が移っていれば無視される
            tx.update_execution(name, instance, ExecutionStatus::Finished)?;
            Ok(())
        })
    }

    /// Current retry counter of `name`.
    pub fn failed_count(&self, name: &TaskName) -> Result<u32, StoreError> {
        self.store.transaction(|tx| tx.retry_count(name))
    }

    /// FINISHED/CANCELLED -> RESUMED, then schedule a fresh instance now.
    ///
    /// `false` if the task is RUNNING or already RESUMED; nothing is scheduled then.
    pub fn resume(&self, name: &TaskName) -> Result<bool, StoreError> {
        let now = self.now();
        let id = TaskInstanceId::fresh(self.clock.as_ref());
        let resumed = self.store.transaction(|tx| {
            if !tx.try_resume(name)? {
                return Ok(false);
            }
            schedule_in(tx, name, now, false, id, now)?;
            Ok(true)
        })?;
        if resumed {
            info!(task = %name, "task resumed");
        }
        Ok(resumed)
    }

    /// Administrative override: resume regardless of the current status.
    pub fn force_resume(&self, name: &TaskName) -> Result<bool, StoreError> {
        let now = self.now();
        let id = TaskInstanceId::fresh(self.clock.as_ref());
        let resumed = self.store.transaction(|tx| {
            if !tx.force_resume(name)? {
                return Ok(false);
            }
            schedule_in(tx, name, now, false, id, now)?;
            Ok(true)
        })?;
        if resumed {
            warn!(task = %name, "task force-resumed");
        }
        Ok(resumed)
    }

    /// Flag `name` as cancelled; checked when its next instance is claimed.
    pub fn cancel(&self, name: &TaskName) -> Result<CancelOutcome, StoreError> {
        let now = self.now();
        let outcome = self.store.transaction(|tx| {
            Ok(match tx.status_and_cancelled(name)? {
                None => CancelOutcome::Unknown,
                Some((_, true)) | Some((ExecutionStatus::Cancelled, _)) => {
                    CancelOutcome::AlreadyCancelled
                }
                Some((ExecutionStatus::Finished, _)) => CancelOutcome::AlreadyFinished,
                Some(_) => {
                    if tx.cancel(name, now)? {
                        CancelOutcome::Cancelled
                    } else {
                        CancelOutcome::AlreadyCancelled
                    }
                }
            })
        })?;
        if outcome == CancelOutcome::Cancelled {
            info!(task = %name, "task cancelled");
        }
        Ok(outcome)
    }
}

fn schedule_in(
    tx: &mut dyn Repositories,
    name: &TaskName,
    moment: DateTime<Utc>,
    is_retry: bool,
    id: TaskInstanceId,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let instance = ScheduledTaskInstance {
        id,
        name: name.clone(),
        execution_time: moment,
    };
    if !tx.add_instance(&instance)? {
        warn!(task = %name, instance = %instance.id, "instance already scheduled; ignoring");
        return Ok(false);
    }
    tx.insert_status(&instance, now)?;
    tx.update_execution(name, &instance.id, ExecutionStatus::Running)?;
    if is_retry {
        tx.add_retry_count(name, 1)?;
    } else {
        tx.set_retry_count(name, 0)?;
    }
    debug!(task = %name, instance = %instance.id, at = %moment, is_retry, "scheduled");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::impls::{InMemoryStore, SqliteStore};
    use crate::ports::FixedClock;
    use chrono::{TimeDelta, TimeZone};
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn manager(store: Store) -> (TaskManager, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let manager = TaskManager::new(store, Arc::new(TaskResolver::new()), clock.clone());
        (manager, clock)
    }

    fn stores() -> Vec<Store> {
        vec![
            Store::from(InMemoryStore::new()),
            Store::from(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    fn history(manager: &TaskManager, name: &str) -> Vec<crate::domain::StatusEntry> {
        manager
            .store()
            .transaction(|tx| tx.task_history(&name.into(), None, None))
            .unwrap()
    }

    fn execution(manager: &TaskManager, name: &str) -> crate::domain::ExecutionEntry {
        manager
            .store()
            .transaction(|tx| tx.execution(&name.into()))
            .unwrap()
            .unwrap()
    }

    #[rstest]
    #[case::memory(0)]
    #[case::sqlite(1)]
    fn scheduling_the_same_instance_twice_is_a_no_op(#[case] which: usize) {
        let (manager, _) = manager(stores().remove(which));
        let task = Task::new("t1", || Ok(()));
        assert!(manager.schedule_task(task.clone(), t0()).unwrap());
        assert!(!manager.schedule_task(task, t0()).unwrap());
        assert_eq!(history(&manager, "t1").len(), 1);
    }

    #[rstest]
    #[case::memory(0)]
    #[case::sqlite(1)]
    fn success_runs_through_the_whole_lifecycle(#[case] which: usize) {
        let (manager, clock) = manager(stores().remove(which));
        manager
            .schedule_task(Task::new("t1", || Ok(())), t0())
            .unwrap();

        assert_eq!(history(&manager, "t1")[0].status, Status::Scheduled);
        let due = manager.pick_due_now().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(history(&manager, "t1")[0].status, Status::Enqueued);

        clock.advance(TimeDelta::seconds(1));
        due[0].exec(&manager).unwrap();

        let entry = &history(&manager, "t1")[0];
        assert_eq!(entry.status, Status::Completed);
        assert_eq!(entry.enqueued_at, Some(t0()));
        assert_eq!(entry.started_at, Some(t0() + TimeDelta::seconds(1)));
        assert!(entry.additional_info.as_ref().unwrap().elapsed_ms.is_some());
        let exec = execution(&manager, "t1");
        assert_eq!(exec.status, ExecutionStatus::Finished);
        assert_eq!(exec.retry_count, 0);
    }

    #[test]
    fn failures_retry_then_fail_with_details() {
        let (manager, clock) = manager(Store::memory());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let task = Task::new("flaky", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("nope")
        })
        .with_retry_policy(RetryPolicy::fixed_delay(1, Duration::from_secs(3)));
        manager.schedule_task(task, t0()).unwrap();

        for instance in manager.pick_due_now().unwrap() {
            instance.exec(&manager).unwrap();
        }
        assert_eq!(manager.failed_count(&"flaky".into()).unwrap(), 1);
        assert!(manager.pick_due_now().unwrap().is_empty());

        clock.advance(TimeDelta::seconds(3));
        for instance in manager.pick_due_now().unwrap() {
            instance.exec(&manager).unwrap();
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let entries = history(&manager, "flaky");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == Status::Failed));
        let info = entries[1].additional_info.clone().unwrap();
        assert_eq!(info.error_message.as_deref(), Some("nope"));
        assert_eq!(execution(&manager, "flaky").status, ExecutionStatus::Finished);
    }

    #[test]
    fn panicking_bodies_are_contained() {
        let (manager, _) = manager(Store::memory());
        manager
            .schedule_task(Task::new("boom", || panic!("kaboom")), t0())
            .unwrap();
        for instance in manager.pick_due_now().unwrap() {
            instance.exec(&manager).unwrap();
        }
        let entry = &history(&manager, "boom")[0];
        assert_eq!(entry.status, Status::Failed);
        assert_eq!(
            entry.additional_info.as_ref().unwrap().error_message.as_deref(),
            Some("task panicked: kaboom")
        );
    }

    #[test]
    fn unresolvable_names_are_dropped_without_status_update() {
        let (manager, _) = manager(Store::memory());
        manager
            .schedule_instance(&"ghost".into(), t0(), false, "g1".into())
            .unwrap();
        assert!(manager.pick_due_now().unwrap().is_empty());
        assert_eq!(history(&manager, "ghost")[0].status, Status::Scheduled);
        assert!(manager.pick_due_now().unwrap().is_empty());
    }

    #[rstest]
    #[case::memory(0)]
    #[case::sqlite(1)]
    fn cancelled_tasks_never_run(#[case] which: usize) {
        let (manager, _) = manager(stores().remove(which));
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let task = Task::new("c", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.schedule_task(task, t0()).unwrap();

        assert_eq!(manager.cancel(&"c".into()).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            manager.cancel(&"c".into()).unwrap(),
            CancelOutcome::AlreadyCancelled
        );
        assert!(manager.pick_due_now().unwrap().is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(history(&manager, "c")[0].status, Status::Cancelled);
        assert_eq!(execution(&manager, "c").status, ExecutionStatus::Cancelled);

        // resume clears the flag and schedules one new instance
        assert!(manager.resume(&"c".into()).unwrap());
        let due = manager.pick_due_now().unwrap();
        assert_eq!(due.len(), 1);
        due[0].exec(&manager).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resume_only_from_finished_or_cancelled() {
        let (manager, _) = manager(Store::memory());
        let name: TaskName = "r".into();
        assert_eq!(manager.cancel(&name).unwrap(), CancelOutcome::Unknown);
        manager.schedule_task(Task::new("r", || Ok(())), t0()).unwrap();

        // RUNNING
        assert!(!manager.resume(&name).unwrap());
        assert_eq!(history(&manager, "r").len(), 1);

        for instance in manager.pick_due_now().unwrap() {
            instance.exec(&manager).unwrap();
        }
        assert_eq!(manager.cancel(&name).unwrap(), CancelOutcome::AlreadyFinished);
        assert!(manager.resume(&name).unwrap());
        assert_eq!(history(&manager, "r").len(), 2);
        // RESUMED then RUNNING again: a second resume is refused
        assert!(!manager.resume(&name).unwrap());
        assert_eq!(history(&manager, "r").len(), 2);

        assert!(manager.force_resume(&name).unwrap());
        assert_eq!(history(&manager, "r").len(), 3);
        assert!(!manager.force_resume(&"nobody".into()).unwrap());
    }

    #[test]
    fn non_retry_schedule_resets_the_retry_counter() {
        let (manager, _) = manager(Store::memory());
        let name: TaskName = "n".into();
        manager.schedule(&name, t0()).unwrap();
        manager.schedule_retry(&name, t0()).unwrap();
        manager.schedule_retry(&name, t0()).unwrap();
        assert_eq!(manager.failed_count(&name).unwrap(), 2);
        manager.schedule(&name, t0()).unwrap();
        assert_eq!(manager.failed_count(&name).unwrap(), 0);
    }

    #[test]
    fn stale_finish_does_not_override_a_newer_instance() {
        let (manager, _) = manager(Store::memory());
        let name: TaskName = "s".into();
        manager
            .schedule_instance(&name, t0(), false, "old".into())
            .unwrap();
        manager
            .schedule_instance(&name, t0(), false, "new".into())
            .unwrap();
        manager
            .update_task_status_finished(
                &name,
                &"old".into(),
                &TaskResult::Success(Duration::from_millis(1)),
            )
            .unwrap();
        let exec = execution(&manager, "s");
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.current_instance.as_str(), "new");
    }

    #[rstest]
    #[case::memory(0)]
    #[case::sqlite(1)]
    fn failing_success_handler_still_finishes_the_execution(#[case] which: usize) {
        let (manager, _) = manager(stores().remove(which));
        let task = Task::new("h", || Ok(()))
            .on_success(|_| Err(StoreError::Corrupt("handler broke".into())));
        manager.schedule_task(task, t0()).unwrap();

        let due = manager.pick_due_now().unwrap();
        assert!(matches!(due[0].exec(&manager), Err(StoreError::Corrupt(_))));

        let entry = &history(&manager, "h")[0];
        assert_eq!(entry.status, Status::Failed);
        let message = entry
            .additional_info
            .as_ref()
            .and_then(|info| info.error_message.clone())
            .unwrap();
        assert!(message.starts_with("handler failed"), "{message}");
        assert_eq!(execution(&manager, "h").status, ExecutionStatus::Finished);
        assert!(manager.resume(&"h".into()).unwrap());
    }

    #[rstest]
    #[case::memory(0)]
    #[case::sqlite(1)]
    fn failing_exception_handler_keeps_the_body_error(#[case] which: usize) {
        let (manager, _) = manager(stores().remove(which));
        let task = Task::new("h", || anyhow::bail!("body broke"))
            .on_exception(|_, _| Err(StoreError::Corrupt("handler broke".into())));
        manager.schedule_task(task, t0()).unwrap();

        let due = manager.pick_due_now().unwrap();
        assert!(due[0].exec(&manager).is_err());

        let entry = &history(&manager, "h")[0];
        assert_eq!(entry.status, Status::Failed);
        let info = entry.additional_info.as_ref().unwrap();
        assert_eq!(info.error_message.as_deref(), Some("body broke"));
        let causes = info.stack_trace.as_ref().unwrap();
        assert!(causes.iter().any(|c| c.starts_with("handler failed")));
        assert_eq!(execution(&manager, "h").status, ExecutionStatus::Finished);
    }
}
