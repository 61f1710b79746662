//! Chain - 成功 / 失敗の継続でタスクをつなぐ
//!
//! ```ignore
//! let chain = Chain::new(extract)
//!     .and_then(Chain::new(load), Duration::ZERO)
//!     .or_else(Chain::new(alert), Duration::from_secs(5));
//! scheduler.schedule_chain(chain, now)?;
//! ```
//!
//! 合成しても head（最初のタスク名）は変わらない。すべてのメンバーは
//! スケジュール前に resolver へ登録しておく必要がある。
//!
//! 同名のメンバーは 1 つの定義にまとめられ、両方の配線（ハンドラ）を持つ。

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::Duration;

use super::definition::Task;
use crate::app::{TaskManager, TaskResolver};
use crate::domain::schedule::add_duration;
use crate::domain::{StoreError, TaskName};

#[derive(Debug, Clone)]
pub struct Chain {
    head: TaskName,
    tail: TaskName,
    members: BTreeMap<TaskName, Task>,
}

impl Chain {
    pub fn new(task: Task) -> Self {
        let name = task.name().clone();
        Self {
            head: name.clone(),
            tail: name.clone(),
            members: BTreeMap::from([(name, task)]),
        }
    }

    pub fn head(&self) -> &TaskName {
        &self.head
    }

    pub fn tail(&self) -> &TaskName {
        &self.tail
    }

    pub fn members(&self) -> impl Iterator<Item = &Task> {
        self.members.values()
    }

    /// On success of the current tail, schedule `next`'s head after `delay`.
    pub fn and_then(self, next: Chain, delay: Duration) -> Self {
        self.link(next, delay, |task, target, delay| {
            task.on_success(move |manager| schedule_continuation(manager, &target, delay))
        })
    }

    /// On final failure of the current tail, schedule `alt`'s head after `delay`.
    pub fn or_else(self, alt: Chain, delay: Duration) -> Self {
        self.link(alt, delay, |task, target, delay| {
            task.on_failure(move |_, manager| schedule_continuation(manager, &target, delay))
        })
    }

    /// Union of both chains' members, keeping this chain's head and tail.
    ///
    /// ```ignore
    /// let chain = Chain::new(fetch.clone())
    ///     .and_then(Chain::new(store), Duration::ZERO)
    ///     .merge(Chain::new(fetch).or_else(Chain::new(alert), Duration::ZERO));
    /// ```
    pub fn merge(mut self, other: Chain) -> Self {
        self.absorb(other.members);
        self
    }

    /// `and_then(self, delay)`: the tail reschedules the head after every success.
    pub fn repeat(self, delay: Duration) -> Self {
        let again = self.clone();
        self.and_then(again, delay)
    }

    fn link(
        mut self,
        next: Chain,
        delay: Duration,
        attach: impl FnOnce(Task, TaskName, Duration) -> Task,
    ) -> Self {
        if let Some(tail) = self.members.remove(&self.tail) {
            let linked = attach(tail, next.head.clone(), delay);
            self.members.insert(self.tail.clone(), linked);
        }
        self.absorb(next.members);
        self.tail = next.tail;
        self
    }

    fn absorb(&mut self, members: BTreeMap<TaskName, Task>) {
        for (name, task) in members {
            match self.members.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(task);
                }
                Entry::Occupied(mut slot) => slot.get_mut().absorb_handlers(&task),
            }
        }
    }

    /// Register every member with the resolver.
    pub fn register(&self, resolver: &TaskResolver) {
        for task in self.members.values() {
            resolver.register(task.clone());
        }
    }
}

fn schedule_continuation(
    manager: &TaskManager,
    target: &TaskName,
    delay: Duration,
) -> Result<(), StoreError> {
    manager.schedule(target, add_duration(manager.now(), delay))?;
    Ok(())
}
