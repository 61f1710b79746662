//! Errors - エラー型と分類
//!
//! - `StoreError`: ストレージ層（トランザクション失敗など）。呼び出し側で一時的なものとして扱う
//! - `SchedulerError`: スケジューラ API の失敗
//!
//! タスク本体のエラーはここには現れない（retry / FAILED の経路に変換される）。

use thiserror::Error;

use super::cron::CronParseError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cron(#[from] CronParseError),

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("cron expression '{0}' has no future fire time")]
    NoFireTime(String),

    #[error("background task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        SchedulerError::Join(err.to_string())
    }
}
