//! Scheduler - polling loop と公開スケジュール API
//!
//! # 構成
//! - poller: 1 本の tokio タスク。`pick_due_now` を回し、取れたインスタンスをワーカーに渡す
//! - ワーカー: インスタンスごとに spawn し、Semaphore（N permits）で同時実行数を制限する。
//!   タスク本体はブロッキングしてよいので `spawn_blocking` で実行する
//! - shutdown: watch チャネル。`stop()` は poller を止めて join し、in_flight が 0 になるまで待つ
//!
//! Tokio ランタイムの中で `start()` / `stop()` を呼ぶこと。

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::manager::{CancelOutcome, TaskManager};
use super::status::TaskStatusService;
use super::waiter::Waiter;
use crate::domain::schedule::add_duration;
use crate::domain::{
    CronSchedule, CronZone, RecurringSchedule, SchedulerError, TaskInstanceId, TaskName,
};
use crate::task::{Chain, Task, TaskInstance};

pub struct Scheduler {
    manager: Arc<TaskManager>,
    waiter: Arc<Waiter>,
    in_flight: Arc<AtomicUsize>,
    workers: Arc<Semaphore>,
    drained: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    poller: Mutex<PollerState>,
    cron_zone: CronZone,
}

enum PollerState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

impl Scheduler {
    pub fn new(manager: Arc<TaskManager>, waiter: Waiter) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let pool_size = waiter.pool_size();
        Self {
            manager,
            workers: Arc::new(Semaphore::new(pool_size)),
            waiter: Arc::new(waiter),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            shutdown_tx,
            poller: Mutex::new(PollerState::Idle),
            cron_zone: CronZone::UTC,
        }
    }

    /// Zone that [`Scheduler::schedule_cron`] evaluates expressions in.
    pub fn with_cron_zone(mut self, zone: CronZone) -> Self {
        self.cron_zone = zone;
        self
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn status_service(&self) -> TaskStatusService {
        TaskStatusService::new(Arc::clone(&self.manager))
    }

    /// Executions submitted to the pool and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the polling loop on the current Tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*poller, PollerState::Idle) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let poll_loop = PollLoop {
            manager: Arc::clone(&self.manager),
            waiter: Arc::clone(&self.waiter),
            in_flight: Arc::clone(&self.in_flight),
            workers: Arc::clone(&self.workers),
            drained: Arc::clone(&self.drained),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        *poller = PollerState::Running(tokio::spawn(poll_loop.run()));
        info!(pool_size = self.waiter.pool_size(), "scheduler started");
        Ok(())
    }

    /// Stop polling and wait for in-flight executions to drain.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let handle = {
            let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *poller, PollerState::Stopped) {
                PollerState::Running(handle) => Some(handle),
                PollerState::Idle | PollerState::Stopped => None,
            }
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        // ignore send error: the poller may already be gone
        let _ = self.shutdown_tx.send(true);
        self.waiter.wake_poller();
        handle.await?;

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.drained.notified().await;
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Register `task` and run it once at `at` (past times run on the next poll).
    pub fn schedule_at(&self, task: Task, at: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let now = self.manager.now();
        if at < now {
            warn!(task = %task.name(), %at, %now, "scheduling a task in the past");
        }
        Ok(self.manager.schedule_task(task, at)?)
    }

    pub fn schedule_after(&self, task: Task, delay: Duration) -> Result<bool, SchedulerError> {
        let at = add_duration(self.manager.now(), delay);
        self.schedule_at(task, at)
    }

    /// Run every `period`, first at `now + period`.
    pub fn schedule_recurring(&self, task: Task, period: Duration) -> Result<bool, SchedulerError> {
        let schedule = RecurringSchedule::every(period);
        let first = add_duration(self.manager.now(), period);
        Ok(self.manager.schedule_task(task.recurring(schedule), first)?)
    }

    /// Run on a cron expression in the scheduler's zone, first at its next fire time.
    pub fn schedule_cron(&self, task: Task, expression: &str) -> Result<bool, SchedulerError> {
        let cron = CronSchedule::parse(expression)?.in_zone(self.cron_zone);
        self.schedule_cron_schedule(task, cron)
    }

    /// Same as [`Scheduler::schedule_cron`] with a pre-built expression and its own zone.
    pub fn schedule_cron_schedule(
        &self,
        task: Task,
        cron: CronSchedule,
    ) -> Result<bool, SchedulerError> {
        let first = cron
            .next_after(self.manager.now())
            .ok_or_else(|| SchedulerError::NoFireTime(cron.expression().to_string()))?;
        let task = task.recurring(RecurringSchedule::Cron(cron));
        Ok(self.manager.schedule_task(task, first)?)
    }

    /// Register every member of `chain` and schedule its head at `at`.
    pub fn schedule_chain(&self, chain: Chain, at: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let now = self.manager.now();
        if at < now {
            warn!(head = %chain.head(), %at, %now, "scheduling a chain in the past");
        }
        chain.register(self.manager.resolver());
        let head = chain.head().clone();
        Ok(self.manager.schedule_instance(
            &head,
            at,
            false,
            TaskInstanceId::first_of(&head),
        )?)
    }

    pub fn cancel(&self, name: &TaskName) -> Result<CancelOutcome, SchedulerError> {
        Ok(self.manager.cancel(name)?)
    }

    pub fn resume(&self, name: &TaskName) -> Result<bool, SchedulerError> {
        Ok(self.manager.resume(name)?)
    }
}

struct PollLoop {
    manager: Arc<TaskManager>,
    waiter: Arc<Waiter>,
    in_flight: Arc<AtomicUsize>,
    workers: Arc<Semaphore>,
    drained: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PollLoop {
    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let instances = self.pick().await;
            if instances.is_empty() {
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        // sender dropped: nobody can stop us any more
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.waiter.sleep_polling_interval() => {}
                }
                continue;
            }

            for instance in instances {
                self.submit(instance);
            }

            if self.waiter.is_busy(self.in_flight.load(Ordering::SeqCst)) {
                let waiter = Arc::clone(&self.waiter);
                let in_flight = Arc::clone(&self.in_flight);
                debug!("pool is busy; parking the poller");
                if let Err(e) =
                    tokio::task::spawn_blocking(move || waiter.wait_light_load(&in_flight)).await
                {
                    error!(error = %e, "poller wait failed");
                }
            }
        }
        debug!("polling loop exited");
    }

    /// Storage failures are logged; the cycle is retried after the polling interval.
    async fn pick(&self) -> Vec<TaskInstance> {
        let manager = Arc::clone(&self.manager);
        match tokio::task::spawn_blocking(move || manager.pick_due_now()).await {
            Ok(Ok(instances)) => instances,
            Ok(Err(e)) => {
                error!(error = %e, "failed to claim due task instances");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "claim task panicked");
                Vec::new()
            }
        }
    }

    fn submit(&self, instance: TaskInstance) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let manager = Arc::clone(&self.manager);
        let waiter = Arc::clone(&self.waiter);
        let in_flight = Arc::clone(&self.in_flight);
        let workers = Arc::clone(&self.workers);
        let drained = Arc::clone(&self.drained);

        tokio::spawn(async move {
            let task = instance.name().clone();
            let id = instance.id().clone();
            match workers.acquire_owned().await {
                Ok(permit) => {
                    let outcome = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        instance.exec(&manager)
                    })
                    .await;
                    match outcome {
                        Ok(Ok(())) => debug!(%task, instance = %id, "execution finished"),
                        Ok(Err(e)) => {
                            error!(%task, instance = %id, error = %e, "failed to record execution")
                        }
                        Err(e) => error!(%task, instance = %id, error = %e, "execution aborted"),
                    }
                }
                Err(e) => error!(%task, instance = %id, error = %e, "worker pool closed"),
            }
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_one();
            }
            waiter.wake_poller();
        });
    }
}
