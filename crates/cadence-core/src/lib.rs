//! cadence-core
//!
//! 埋め込み型タスクスケジューラのコア。
//!
//! # モジュール構成
//! - **domain**: 値型（ids, retry, schedule, cron, records, errors）
//! - **ports**: 抽象化レイヤー（Clock, Repositories, TransactionManager, Store）
//! - **impls**: ストア実装（InMemoryStore, SqliteStore）
//! - **task**: Task 定義、TaskInstance の実行、Chain
//! - **app**: TaskResolver, TaskManager, Waiter, Scheduler, SchedulerBuilder, TaskStatusService
//! - **config**: serde で読み込む SchedulerConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod task;

pub use app::{
    CancelOutcome, Scheduler, SchedulerBuilder, TaskManager, TaskResolver, TaskStatusService,
};
pub use config::{SchedulerConfig, StoreConfig};
pub use domain::{
    CronSchedule, CronZone, RecurringSchedule, RetryPolicy, SchedulerError, Status, StoreError,
    TaskInstanceId, TaskName,
};
pub use task::{Chain, Task, TaskInstance};
