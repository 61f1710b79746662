//! App - アプリケーション層
//!
//! # 主要コンポーネント
//! - **TaskResolver**: タスク名 → Task の登録簿
//! - **TaskManager**: スケジュール、claim、ステータス遷移、retry 回数、cancel / resume
//! - **Waiter**: polling loop のバックプレッシャー制御
//! - **Scheduler**: polling loop + ワーカープール + 公開スケジュール API
//! - **SchedulerBuilder**: 構築とワイヤリング（Fail-fast 検証つき）
//! - **TaskStatusService**: 管理・参照用のクエリ

pub mod builder;
pub mod manager;
pub mod resolver;
pub mod scheduler;
pub mod status;
pub mod waiter;

pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::manager::{CancelOutcome, TaskManager};
pub use self::resolver::TaskResolver;
pub use self::scheduler::Scheduler;
pub use self::status::{
    ControlError, DetailedTaskInfo, FailedTaskInfo, ScheduledTaskInfo, TaskFilter,
    TaskStatusService, TaskSummary,
};
pub use self::waiter::Waiter;
