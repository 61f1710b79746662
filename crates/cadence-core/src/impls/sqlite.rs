//! SQLite-backed store.
//!
//! - タイムスタンプは Unix ミリ秒（INTEGER）
//! - additional_info は JSON テキスト
//! - トランザクションは `BEGIN IMMEDIATE`：書き込みロックを先に取るので、
//!   同じファイルを開いた別プロセスの claim とも直列化される
//! - busy_timeout によりロック競合はエラーではなく待ちになる

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{
    AdditionalInfo, ExecutionEntry, ExecutionStatus, ScheduledTaskInstance, Status, StatusEntry,
    StoreError, TaskInstanceId, TaskInstanceName, TaskName,
};
use crate::ports::{
    ExecutionsRepository, Repositories, StatusRepository, TasksRepository, TransactionManager,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    -- Due queue: one row per scheduled instance
    CREATE TABLE IF NOT EXISTS cadence_tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        execution_time INTEGER NOT NULL,   -- unix millis
        claimed INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS cadence_tasks_due ON cadence_tasks (claimed, execution_time);

    -- Lifecycle of each instance
    CREATE TABLE IF NOT EXISTS cadence_status (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        scheduled_for INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        enqueued_at INTEGER,
        started_at INTEGER,
        finished_at INTEGER,
        additional_info TEXT              -- JSON
    );
    CREATE INDEX IF NOT EXISTS cadence_status_name ON cadence_status (name, scheduled_for);

    -- One row per task name
    CREATE TABLE IF NOT EXISTS cadence_executions (
        name TEXT PRIMARY KEY,
        current_instance TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        cancelled INTEGER NOT NULL DEFAULT 0,
        cancelled_at INTEGER
    );
";

const STATUS_COLUMNS: &str = "id, name, status, scheduled_for, created_at, enqueued_at, \
                              started_at, finished_at, additional_info";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl TransactionManager for SqliteStore {
    fn transaction<T, F>(&self, block: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Repositories) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = block(&mut SqliteTx { conn: &tx })?;
        // エラー時は tx の drop でロールバックされる
        tx.commit()?;
        Ok(value)
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

fn read_status(row: &Row<'_>) -> Result<StatusEntry, StoreError> {
    let status: String = row.get("status")?;
    let info: Option<String> = row.get("additional_info")?;
    Ok(StatusEntry {
        instance: TaskInstanceId::new(row.get::<_, String>("id")?),
        task_name: TaskName::new(row.get::<_, String>("name")?),
        status: status.parse().map_err(StoreError::Corrupt)?,
        scheduled_for: from_millis(row.get("scheduled_for")?)?,
        created_at: from_millis(row.get("created_at")?)?,
        enqueued_at: opt_from_millis(row.get("enqueued_at")?)?,
        started_at: opt_from_millis(row.get("started_at")?)?,
        finished_at: opt_from_millis(row.get("finished_at")?)?,
        additional_info: info
            .map(|json| serde_json::from_str::<AdditionalInfo>(&json))
            .transpose()?,
    })
}

impl SqliteTx<'_> {
    fn query_statuses(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<StatusEntry>, StoreError> {
        let sql = format!(
            "SELECT {STATUS_COLUMNS} FROM cadence_status WHERE {filter} ORDER BY scheduled_for, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_status(row)?);
        }
        Ok(out)
    }
}

impl TasksRepository for SqliteTx<'_> {
    fn add_instance(&mut self, instance: &ScheduledTaskInstance) -> Result<bool, StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO cadence_tasks (id, name, execution_time, claimed)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT (id) DO NOTHING",
            params![
                instance.id.as_str(),
                instance.name.as_str(),
                millis(instance.execution_time)
            ],
        )?;
        Ok(inserted == 1)
    }

    fn pick_due(&mut self, now: DateTime<Utc>) -> Result<Vec<TaskInstanceName>, StoreError> {
        let mut stmt = self.conn.prepare(
            "UPDATE cadence_tasks SET claimed = 1
             WHERE claimed = 0 AND execution_time <= ?1
             RETURNING id, name",
        )?;
        let picked = stmt
            .query_map(params![millis(now)], |row| {
                Ok(TaskInstanceName {
                    id: TaskInstanceId::new(row.get::<_, String>(0)?),
                    name: TaskName::new(row.get::<_, String>(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(picked)
    }

    fn list_due(
        &mut self,
        moment: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScheduledTaskInstance>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, execution_time FROM cadence_tasks
             WHERE claimed = 0 AND (?1 IS NULL OR execution_time <= ?1)
             ORDER BY execution_time, id",
        )?;
        let mut rows = stmt.query(params![moment.map(millis)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ScheduledTaskInstance {
                id: TaskInstanceId::new(row.get::<_, String>(0)?),
                name: TaskName::new(row.get::<_, String>(1)?),
                execution_time: from_millis(row.get(2)?)?,
            });
        }
        Ok(out)
    }

    fn count_due(&mut self, moment: Option<DateTime<Utc>>) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cadence_tasks
             WHERE claimed = 0 AND (?1 IS NULL OR execution_time <= ?1)",
            params![moment.map(millis)],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|_| StoreError::Corrupt(format!("negative count: {count}")))
    }
}

impl StatusRepository for SqliteTx<'_> {
    fn insert_status(
        &mut self,
        instance: &ScheduledTaskInstance,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO cadence_status (id, name, status, scheduled_for, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO NOTHING",
            params![
                instance.id.as_str(),
                instance.name.as_str(),
                Status::Scheduled.as_str(),
                millis(instance.execution_time),
                millis(created_at)
            ],
        )?;
        Ok(())
    }

    fn update_status(
        &mut self,
        status: Status,
        instance: &TaskInstanceId,
        moment: DateTime<Utc>,
        info: Option<AdditionalInfo>,
    ) -> Result<bool, StoreError> {
        let Some(mut entry) = self.status_of(instance)? else {
            return Ok(false);
        };
        let moved = entry.advance(status, moment, info);
        let info_json = entry
            .additional_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "UPDATE cadence_status
             SET status = ?2, enqueued_at = ?3, started_at = ?4, finished_at = ?5,
                 additional_info = ?6
             WHERE id = ?1",
            params![
                instance.as_str(),
                entry.status.as_str(),
                entry.enqueued_at.map(millis),
                entry.started_at.map(millis),
                entry.finished_at.map(millis),
                info_json
            ],
        )?;
        Ok(moved)
    }

    fn status_of(&mut self, instance: &TaskInstanceId) -> Result<Option<StatusEntry>, StoreError> {
        Ok(self
            .query_statuses("id = ?1", params![instance.as_str()])?
            .into_iter()
            .next())
    }

    fn task_history(
        &mut self,
        name: &TaskName,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>, StoreError> {
        self.query_statuses(
            "name = ?1
             AND (?2 IS NULL OR scheduled_for >= ?2)
             AND (?3 IS NULL OR scheduled_for <= ?3)",
            params![name.as_str(), from.map(millis), to.map(millis)],
        )
    }

    fn history(
        &mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>, StoreError> {
        self.query_statuses(
            "(?1 IS NULL OR scheduled_for >= ?1) AND (?2 IS NULL OR scheduled_for <= ?2)",
            params![from.map(millis), to.map(millis)],
        )
    }

    fn finished_tasks(&mut self) -> Result<Vec<StatusEntry>, StoreError> {
        self.query_statuses(
            "status IN (?1, ?2)",
            params![Status::Completed.as_str(), Status::Failed.as_str()],
        )
    }
}

impl ExecutionsRepository for SqliteTx<'_> {
    fn execution(&mut self, name: &TaskName) -> Result<Option<ExecutionEntry>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT current_instance, status, retry_count, cancelled, cancelled_at
                 FROM cadence_executions WHERE name = ?1",
                params![name.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((current, status, retry_count, cancelled, cancelled_at)) = raw else {
            return Ok(None);
        };
        Ok(Some(ExecutionEntry {
            name: name.clone(),
            current_instance: TaskInstanceId::new(current),
            status: status.parse().map_err(StoreError::Corrupt)?,
            retry_count,
            cancelled,
            cancelled_at: opt_from_millis(cancelled_at)?,
        }))
    }

    fn retry_count(&mut self, name: &TaskName) -> Result<u32, StoreError> {
        let count = self
            .conn
            .query_row(
                "SELECT retry_count FROM cadence_executions WHERE name = ?1",
                params![name.as_str()],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn set_retry_count(&mut self, name: &TaskName, count: u32) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE cadence_executions SET retry_count = ?2 WHERE name = ?1",
            params![name.as_str(), count],
        )?;
        Ok(())
    }

    fn add_retry_count(&mut self, name: &TaskName, delta: u32) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE cadence_executions SET retry_count = retry_count + ?2 WHERE name = ?1",
            params![name.as_str(), delta],
        )?;
        Ok(())
    }

    fn update_execution(
        &mut self,
        name: &TaskName,
        instance: &TaskInstanceId,
        status: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let changed = match status {
            ExecutionStatus::Running => self.conn.execute(
                "INSERT INTO cadence_executions (name, current_instance, status)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (name) DO UPDATE
                 SET current_instance = excluded.current_instance, status = excluded.status",
                params![name.as_str(), instance.as_str(), status.as_str()],
            )?,
            // stale-writer guard
            ExecutionStatus::Finished => self.conn.execute(
                "UPDATE cadence_executions SET status = ?3
                 WHERE name = ?1 AND current_instance = ?2",
                params![name.as_str(), instance.as_str(), status.as_str()],
            )?,
            ExecutionStatus::Cancelled | ExecutionStatus::Resumed => 0,
        };
        Ok(changed > 0)
    }

    fn cancel(&mut self, name: &TaskName, moment: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE cadence_executions SET cancelled = 1, cancelled_at = ?2
             WHERE name = ?1 AND cancelled = 0",
            params![name.as_str(), millis(moment)],
        )?;
        Ok(changed > 0)
    }

    fn when_cancelled(&mut self, name: &TaskName) -> Result<Option<DateTime<Utc>>, StoreError> {
        let cancelled_at = self
            .conn
            .query_row(
                "UPDATE cadence_executions SET status = ?2
                 WHERE name = ?1 AND cancelled = 1
                 RETURNING cancelled_at",
                params![name.as_str(), ExecutionStatus::Cancelled.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        opt_from_millis(cancelled_at.flatten())
    }

    fn try_resume(&mut self, name: &TaskName) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE cadence_executions
             SET status = ?2, cancelled = 0, cancelled_at = NULL
             WHERE name = ?1 AND status IN (?3, ?4)",
            params![
                name.as_str(),
                ExecutionStatus::Resumed.as_str(),
                ExecutionStatus::Finished.as_str(),
                ExecutionStatus::Cancelled.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    fn force_resume(&mut self, name: &TaskName) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE cadence_executions
             SET status = ?2, cancelled = 0, cancelled_at = NULL
             WHERE name = ?1",
            params![name.as_str(), ExecutionStatus::Resumed.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn status_and_cancelled(
        &mut self,
        name: &TaskName,
    ) -> Result<Option<(ExecutionStatus, bool)>, StoreError> {
        Ok(self
            .execution(name)?
            .map(|entry| (entry.status, entry.cancelled)))
    }
}
