//! SchedulerBuilder - Scheduler の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - expect_tasks() で期待されるタスク名を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返す

use std::sync::Arc;
use std::time::Duration;

use super::manager::TaskManager;
use super::resolver::TaskResolver;
use super::scheduler::Scheduler;
use super::waiter::Waiter;
use crate::config::{SchedulerConfig, default_pool_size};
use crate::domain::{CronZone, StoreError};
use crate::impls::Store;
use crate::ports::{Clock, SystemClock};
use crate::task::{Chain, Task};

/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .execution_threads(4)
///     .register(Task::new("report", build_report))
///     .expect_tasks(&["report"])
///     .build()?;
/// scheduler.start()?;
/// ```
pub struct SchedulerBuilder {
    store: Store,
    clock: Arc<dyn Clock>,
    pool_size: Option<usize>,
    polling_interval: Duration,
    busy_ratio: f64,
    cron_zone: CronZone,
    resolver: TaskResolver,
    expected_tasks: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing tasks: {0:?}. These tasks were expected but not registered.")]
    MissingTasks(Vec<String>),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            store: Store::memory(),
            clock: Arc::new(SystemClock),
            pool_size: None,
            polling_interval: defaults.polling_interval(),
            busy_ratio: defaults.busy_ratio,
            cron_zone: defaults.cron_zone,
            resolver: TaskResolver::new(),
            expected_tasks: None,
        }
    }

    /// Open the configured store and apply the tuning values.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, StoreError> {
        Ok(Self::new()
            .store(Store::from_config(&config.store)?)
            .execution_threads(config.pool_size())
            .polling_interval(config.polling_interval())
            .busy_ratio(config.busy_ratio)
            .cron_zone(config.cron_zone))
    }

    pub fn store(mut self, store: impl Into<Store>) -> Self {
        self.store = store.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn execution_threads(mut self, n: usize) -> Self {
        self.pool_size = Some(n);
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn busy_ratio(mut self, ratio: f64) -> Self {
        self.busy_ratio = ratio;
        self
    }

    pub fn cron_zone(mut self, zone: CronZone) -> Self {
        self.cron_zone = zone;
        self
    }

    /// Pre-register a task so instances persisted by an earlier run can resolve it.
    pub fn register(self, task: Task) -> Self {
        self.resolver.register(task);
        self
    }

    pub fn register_chain(self, chain: &Chain) -> Self {
        chain.register(&self.resolver);
        self
    }

    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered: Vec<String> = self
                .resolver
                .registered_names()
                .into_iter()
                .map(|name| name.to_string())
                .collect();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTasks(missing_tasks));
            }
        }

        let pool_size = self.pool_size.unwrap_or_else(default_pool_size).max(1);
        let manager = TaskManager::new(self.store, Arc::new(self.resolver), self.clock);
        Ok(Scheduler::new(
            Arc::new(manager),
            Waiter::new(pool_size, self.polling_interval, self.busy_ratio),
        )
        .with_cron_zone(self.cron_zone))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::ports::FixedClock;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    #[test]
    fn test_build_success() {
        let scheduler = SchedulerBuilder::new()
            .register(Task::new("a", || Ok(())))
            .expect_tasks(&["a"])
            .build();
        assert!(scheduler.is_ok());
    }

    #[test]
    fn test_build_missing_tasks() {
        let scheduler = SchedulerBuilder::new()
            .register(Task::new("a", || Ok(())))
            .expect_tasks(&["a", "b"])
            .build();
        assert!(matches!(
            scheduler,
            Err(BuildError::MissingTasks(missing)) if missing == vec!["b".to_string()]
        ));
    }

    #[test]
    fn test_chain_members_count_as_registered() {
        let chain = Chain::new(Task::new("one", || Ok(())))
            .and_then(Chain::new(Task::new("two", || Ok(()))), Duration::ZERO);
        let scheduler = SchedulerBuilder::new()
            .register_chain(&chain)
            .expect_tasks(&["one", "two"])
            .build();
        assert!(scheduler.is_ok());
    }

    #[test]
    fn test_from_config_opens_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            execution_threads: Some(3),
            store: StoreConfig::Sqlite {
                path: dir.path().join("cadence.db"),
            },
            ..SchedulerConfig::default()
        };
        let scheduler = SchedulerBuilder::from_config(&config)
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(scheduler.manager().store(), Store::Sqlite(_)));
        assert!(dir.path().join("cadence.db").exists());
    }

    #[test]
    fn test_cron_zone_applies_to_named_expressions() {
        let now: DateTime<Utc> = "2024-01-01T00:30:00Z".parse().unwrap();
        let config = SchedulerConfig {
            cron_zone: "Asia/Tokyo".parse().unwrap(),
            ..SchedulerConfig::default()
        };
        let scheduler = SchedulerBuilder::from_config(&config)
            .unwrap()
            .clock(Arc::new(FixedClock::new(now)))
            .build()
            .unwrap();
        scheduler
            .schedule_cron(Task::new("morning", || Ok(())), "0 0 9 * * ?")
            .unwrap();

        let scheduled = scheduler.status_service().scheduled_tasks(None).unwrap();
        // 09:00 in Tokyo is 00:00Z; today's has passed
        assert_eq!(
            scheduled[0].execution_time,
            "2024-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
