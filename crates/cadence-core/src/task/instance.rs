//! TaskInstance - 1 回分の実行
//!
//! exec の流れ:
//! 1. STARTED にする
//! 2. 本体を実行し、経過時間を測る
//! 3. 成功: success ハンドラを順に呼び、COMPLETED（経過時間つき）
//! 4. 失敗: exception ハンドラ → RetryPolicy で判定
//!    - delay あり: now + delay に retry インスタンスを登録
//!    - delay なし: failure ハンドラを呼ぶ
//!    いずれも最後に FAILED
//!
//! 本体のエラーや panic は外に漏らさない。ストレージのエラーだけが呼び出し側に返る。

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::definition::{Task, TaskFailure, TaskResult};
use crate::app::TaskManager;
use crate::domain::schedule::add_duration;
use crate::domain::{StoreError, TaskInstanceId, TaskName};

#[derive(Debug, Clone)]
pub struct TaskInstance {
    id: TaskInstanceId,
    task: Arc<Task>,
}

impl TaskInstance {
    pub fn new(id: TaskInstanceId, task: Arc<Task>) -> Self {
        Self { id, task }
    }

    pub fn id(&self) -> &TaskInstanceId {
        &self.id
    }

    pub fn name(&self) -> &TaskName {
        self.task.name()
    }

    pub fn exec(&self, manager: &TaskManager) -> Result<(), StoreError> {
        let name = self.task.name();
        manager.update_task_status_started(name, &self.id)?;

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.task.run_body()));
        let elapsed = started.elapsed();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(TaskFailure::from_error(&err)),
            Err(payload) => Some(TaskFailure::from_panic(payload)),
        };

        let (result, handler_error) = match failure {
            None => {
                let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                debug!(task = %name, instance = %self.id, elapsed_ms, "task completed");
                match self.run_success_handlers(manager) {
                    Ok(()) => (TaskResult::Success(elapsed), None),
                    Err(e) => (TaskResult::Failed(TaskFailure::from_handler(&e)), Some(e)),
                }
            }
            Some(failure) => {
                error!(task = %name, instance = %self.id, error = %failure, "task attempt failed");
                match self.handle_failure(manager, &failure) {
                    Ok(()) => (TaskResult::Failed(failure), None),
                    Err(e) => (TaskResult::Failed(failure.with_handler_error(&e)), Some(e)),
                }
            }
        };

        // ハンドラが失敗しても終端状態は必ず書く
        let finished = manager.update_task_status_finished(name, &self.id, &result);
        match handler_error {
            Some(e) => {
                if let Err(finish_error) = finished {
                    error!(
                        task = %name,
                        instance = %self.id,
                        error = %finish_error,
                        "failed to record finish"
                    );
                }
                Err(e)
            }
            None => finished,
        }
    }

    fn run_success_handlers(&self, manager: &TaskManager) -> Result<(), StoreError> {
        for handler in self.task.success_handlers() {
            handler(manager)?;
        }
        Ok(())
    }

    fn handle_failure(
        &self,
        manager: &TaskManager,
        failure: &TaskFailure,
    ) -> Result<(), StoreError> {
        let name = self.task.name();
        for handler in self.task.exception_handlers() {
            handler(failure, manager)?;
        }

        let failed_count = manager.failed_count(name)?;
        let delay = self
            .task
            .retry_policy()
            .and_then(|policy| policy.next_delay(failed_count));

        match delay {
            Some(delay) => {
                let at = add_duration(manager.now(), delay);
                info!(task = %name, attempt = failed_count + 1, retry_at = %at, "scheduling retry");
                manager.schedule_retry(name, at)?;
            }
            None => {
                if self.task.retry_policy().is_some() {
                    warn!(task = %name, retries = failed_count, "retries exhausted");
                }
                for handler in self.task.failure_handlers() {
                    handler(failure, manager)?;
                }
            }
        }
        Ok(())
    }
}
