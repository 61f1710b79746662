//! Scheduler configuration (serde).
//!
//! ```toml
//! execution_threads = 4
//! polling_interval_ms = 100
//! busy_ratio = 2.7
//! cron_zone = "Europe/Paris"
//!
//! [store]
//! kind = "sqlite"
//! path = "cadence.db"
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::CronZone;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size. Defaults to the available parallelism.
    pub execution_threads: Option<usize>,
    pub polling_interval_ms: u64,
    pub busy_ratio: f64,
    /// Zone for cron expressions scheduled by name.
    pub cron_zone: CronZone,
    pub store: StoreConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            execution_threads: None,
            polling_interval_ms: 100,
            busy_ratio: 2.7,
            cron_zone: CronZone::UTC,
            store: StoreConfig::Memory,
        }
    }
}

impl SchedulerConfig {
    pub fn pool_size(&self) -> usize {
        self.execution_threads
            .unwrap_or_else(default_pool_size)
            .max(1)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

pub fn default_pool_size() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.polling_interval(), Duration::from_millis(100));
        assert!(config.pool_size() >= 1);
    }

    #[test]
    fn store_kind_is_tagged() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"execution_threads": 3, "store": {"kind": "sqlite", "path": "x.db"}}"#,
        )
        .unwrap();
        assert_eq!(config.pool_size(), 3);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("x.db")
            }
        );
    }

    #[test]
    fn cron_zone_is_read_by_name() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"cron_zone": "Asia/Tokyo"}"#).unwrap();
        assert_eq!(config.cron_zone.to_string(), "Asia/Tokyo");
        assert!(serde_json::from_str::<SchedulerConfig>(r#"{"cron_zone": "Nowhere"}"#).is_err());
    }

    #[test]
    fn zero_threads_is_clamped() {
        let config = SchedulerConfig {
            execution_threads: Some(0),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.pool_size(), 1);
    }
}
