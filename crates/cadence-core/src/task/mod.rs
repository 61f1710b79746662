//! Task model: definitions, per-instance execution, chains.

pub mod chain;
pub mod definition;
pub mod instance;

pub use self::chain::Chain;
pub use self::definition::{Task, TaskFailure, TaskResult};
pub use self::instance::TaskInstance;
