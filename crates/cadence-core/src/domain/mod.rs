//! Domain model (ids, policies, schedules, lifecycle records, errors).

pub mod cron;
pub mod errors;
pub mod ids;
pub mod records;
pub mod retry;
pub mod schedule;

pub use self::cron::{CronParseError, CronSchedule, CronZone};
pub use self::errors::{SchedulerError, StoreError};
pub use self::ids::{TaskInstanceId, TaskName};
pub use self::records::{
    AdditionalInfo, ExecutionEntry, ExecutionStatus, ScheduledTaskInstance, Status, StatusEntry,
    TaskInstanceName,
};
pub use self::retry::RetryPolicy;
pub use self::schedule::RecurringSchedule;
