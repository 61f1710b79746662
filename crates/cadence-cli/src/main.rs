use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cadence_core::app::{FailedTaskInfo, ScheduledTaskInfo, TaskFilter, TaskSummary};
use cadence_core::{
    Chain, CronZone, RetryPolicy, SchedulerBuilder, SchedulerConfig, StoreConfig, Task,
};

/// cadence デモ：いくつかのタスクを登録して一定時間動かし、最後にステータスを出力する
#[derive(Debug, Parser)]
#[command(name = "cadence", version, about = "Run the embedded scheduler demo")]
struct Args {
    /// TOML config file (SchedulerConfig)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use a SQLite store at this path instead of the configured one
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Worker pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Time zone for cron expressions (IANA name or "local")
    #[arg(long)]
    cron_zone: Option<CronZone>,

    /// How long to run before stopping, in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    scheduled: Vec<ScheduledTaskInfo>,
    failed: Vec<FailedTaskInfo>,
    tasks: Vec<TaskSummary>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    // 二重初期化は無視する
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(args: &Args) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };
    if let Some(path) = &args.sqlite {
        config.store = StoreConfig::Sqlite { path: path.clone() };
    }
    if let Some(threads) = args.threads {
        config.execution_threads = Some(threads);
    }
    if let Some(zone) = args.cron_zone {
        config.cron_zone = zone;
    }
    Ok(config)
}

/// (A) 一回だけ (B) retry つきで失敗する (C) cron (D) chain
fn demo_tasks() -> (Task, Task, Task, Chain) {
    let hello = Task::new("hello", || {
        info!("hello from cadence");
        Ok(())
    });

    let remaining_failures = Arc::new(AtomicU32::new(2));
    let flaky = Task::new("flaky", move || {
        let left = remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            remaining_failures.fetch_sub(1, Ordering::Relaxed);
            anyhow::bail!("intentional failure (left={left})");
        }
        info!("flaky finally succeeded");
        Ok(())
    })
    .with_retry_policy(RetryPolicy::exp_backoff(3, Duration::from_millis(500), 2.0))
    .on_exception(|failure, _| {
        warn!(error = %failure.message, "flaky attempt failed");
        Ok(())
    });

    let heartbeat = Task::new("heartbeat", || {
        info!("heartbeat");
        Ok(())
    });

    let extract = Task::new("extract", || {
        info!("extract");
        Ok(())
    });
    let transform = Task::new("transform", || anyhow::bail!("transform input missing"));
    let report_failure = Task::new("report-failure", || {
        warn!("pipeline failed; notifying");
        Ok(())
    });
    let pipeline = Chain::new(extract)
        .and_then(Chain::new(transform), Duration::from_secs(1))
        .or_else(Chain::new(report_failure), Duration::ZERO);

    (hello, flaky, heartbeat, pipeline)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let config = load_config(&args)?;
    info!(store = ?config.store, pool_size = config.pool_size(), "starting cadence");

    let scheduler = SchedulerBuilder::from_config(&config)?.build()?;
    let (hello, flaky, heartbeat, pipeline) = demo_tasks();

    let now = scheduler.manager().now();
    scheduler.schedule_after(hello, Duration::from_secs(1))?;
    scheduler.schedule_at(flaky, now)?;
    scheduler.schedule_cron(heartbeat, "*/2 * * * * ?")?;
    scheduler.schedule_chain(pipeline, now)?;

    scheduler.start()?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("interrupted");
        }
    }
    scheduler.stop().await?;

    let status = scheduler.status_service();
    let report = Report {
        scheduled: status.scheduled_tasks(None)?,
        failed: status.failed_tasks()?,
        tasks: status.tasks(&TaskFilter::default())?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
