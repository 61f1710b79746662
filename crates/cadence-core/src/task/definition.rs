//! Task definitions.
//!
//! ハンドラの追加は「新しい Task を返す」builder ステップ。既存の定義を
//! その場で書き換えることはないので、Chain のノード間でハンドラが共有されない。

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::app::TaskManager;
use crate::domain::{RecurringSchedule, RetryPolicy, StoreError, TaskName};

type Body = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type SuccessHandler = Arc<dyn Fn(&TaskManager) -> Result<(), StoreError> + Send + Sync>;
type FailureHandler =
    Arc<dyn Fn(&TaskFailure, &TaskManager) -> Result<(), StoreError> + Send + Sync>;

/// A named unit of work plus its continuation handlers.
#[derive(Clone)]
pub struct Task {
    name: TaskName,
    body: Body,
    retry_policy: Option<RetryPolicy>,
    on_success: Vec<SuccessHandler>,
    on_exception: Vec<FailureHandler>,
    on_failure: Vec<FailureHandler>,
}

impl Task {
    pub fn new<F>(name: impl Into<TaskName>, body: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
            retry_policy: None,
            on_success: Vec::new(),
            on_exception: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Runs after a successful body, in registration order.
    pub fn on_success<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskManager) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.on_success.push(Arc::new(handler));
        self
    }

    /// Runs after every failed attempt, before the retry decision.
    pub fn on_exception<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskFailure, &TaskManager) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.on_exception.push(Arc::new(handler));
        self
    }

    /// Runs once retries are exhausted (or there is no retry policy).
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TaskFailure, &TaskManager) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.on_failure.push(Arc::new(handler));
        self
    }

    /// 成功時に次回分を登録するハンドラを末尾に追加する
    pub fn recurring(self, schedule: RecurringSchedule) -> Self {
        let name = self.name.clone();
        self.on_success(move |manager| {
            match schedule.next_execution(manager.now()) {
                Some(next) => {
                    manager.schedule(&name, next)?;
                }
                None => warn!(task = %name, "recurring schedule has no further execution time"),
            }
            Ok(())
        })
    }

    /// `other` の配線をこの定義に足す（同じハンドラは二重に足さない）
    pub(crate) fn absorb_handlers(&mut self, other: &Task) {
        append_missing(&mut self.on_success, &other.on_success);
        append_missing(&mut self.on_exception, &other.on_exception);
        append_missing(&mut self.on_failure, &other.on_failure);
        if self.retry_policy.is_none() {
            self.retry_policy = other.retry_policy;
        }
    }

    pub(crate) fn run_body(&self) -> anyhow::Result<()> {
        (self.body)()
    }

    pub(crate) fn success_handlers(&self) -> &[SuccessHandler] {
        &self.on_success
    }

    pub(crate) fn exception_handlers(&self) -> &[FailureHandler] {
        &self.on_exception
    }

    pub(crate) fn failure_handlers(&self) -> &[FailureHandler] {
        &self.on_failure
    }
}

fn append_missing<H: ?Sized>(into: &mut Vec<Arc<H>>, from: &[Arc<H>]) {
    for handler in from {
        if !into.iter().any(|existing| Arc::ptr_eq(existing, handler)) {
            into.push(Arc::clone(handler));
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .field("on_success", &self.on_success.len())
            .field("on_exception", &self.on_exception.len())
            .field("on_failure", &self.on_failure.len())
            .finish()
    }
}

/// Why one attempt failed: the top-level message plus the cause chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
    pub causes: Vec<String>,
}

impl TaskFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            causes: err.chain().map(|cause| cause.to_string()).collect(),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let message = format!("task panicked: {detail}");
        Self {
            causes: vec![message.clone()],
            message,
        }
    }
}

impl TaskFailure {
    /// A continuation handler failed after the body succeeded.
    pub fn from_handler(err: &StoreError) -> Self {
        let message = format!("handler failed: {err}");
        Self {
            causes: vec![message.clone()],
            message,
        }
    }

    /// Keep the body's failure, recording the handler error as an extra cause.
    pub fn with_handler_error(mut self, err: &StoreError) -> Self {
        self.causes.push(format!("handler failed: {err}"));
        self
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of running a task body once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Success(Duration),
    Failed(TaskFailure),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn builder_steps_return_new_definitions() {
        let base = Task::new("t", || Ok(()));
        let extended = base.clone().on_success(|_| Ok(())).on_success(|_| Ok(()));
        assert_eq!(base.success_handlers().len(), 0);
        assert_eq!(extended.success_handlers().len(), 2);
        assert_eq!(extended.name().as_str(), "t");
    }

    #[test]
    fn failure_keeps_the_cause_chain() {
        let err = Err::<(), _>(anyhow!("disk full"))
            .context("writing report")
            .unwrap_err();
        let failure = TaskFailure::from_error(&err);
        assert_eq!(failure.message, "writing report");
        assert_eq!(failure.causes, vec!["writing report", "disk full"]);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let failure = TaskFailure::from_panic(Box::new("oops"));
        assert_eq!(failure.message, "task panicked: oops");
        let failure = TaskFailure::from_panic(Box::new(String::from("owned")));
        assert_eq!(failure.message, "task panicked: owned");
    }
}
