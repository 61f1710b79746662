//! TaskResolver - タスク名から Task を引く登録簿
//!
//! 起動時に一度作り、Scheduler とワーカーに参照で渡す（グローバルな状態は持たない）。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use crate::domain::TaskName;
use crate::task::Task;

#[derive(Debug, Default)]
pub struct TaskResolver {
    tasks: RwLock<HashMap<TaskName, Arc<Task>>>,
}

impl TaskResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a task definition under its name.
    pub fn register(&self, task: Task) {
        let name = task.name().clone();
        let replaced = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(task))
            .is_some();
        debug!(task = %name, replaced, "task registered");
    }

    /// Unknown names are logged and return `None`.
    pub fn get(&self, name: &TaskName) -> Option<Arc<Task>> {
        let task = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if task.is_none() {
            error!(task = %name, "no task registered under this name");
        }
        task
    }

    pub fn contains(&self, name: &TaskName) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<TaskName> {
        let mut names: Vec<TaskName> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
