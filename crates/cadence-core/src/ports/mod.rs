//! Ports - 抽象化レイヤー
//!
//! ストレージと時刻への依存をここで trait として切り出す。
//! 実装は `impls`（InMemoryStore, SqliteStore）にある。

pub mod clock;
pub mod repository;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::repository::{
    ExecutionsRepository, Repositories, StatusRepository, TasksRepository, TransactionManager,
};
