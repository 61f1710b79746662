//! End-to-end scenarios driven by a fixed clock instead of the polling loop.

use cadence_core::app::{TaskFilter, TaskStatusService};
use cadence_core::domain::{ExecutionStatus, StatusEntry};
use cadence_core::impls::{InMemoryStore, SqliteStore, Store};
use cadence_core::ports::{Clock, FixedClock, TransactionManager};
use cadence_core::{
    Chain, RetryPolicy, Scheduler, SchedulerBuilder, Status, Task, TaskInstanceId, TaskManager,
    TaskName, TaskResolver,
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use rstest::rstest;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap()
}

fn scheduler(store: Store) -> (Scheduler, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(t0()));
    let scheduler = SchedulerBuilder::new()
        .store(store)
        .clock(clock.clone())
        .execution_threads(2)
        .build()
        .unwrap();
    (scheduler, clock)
}

fn store(kind: &str) -> Store {
    match kind {
        "sqlite" => SqliteStore::open_in_memory().unwrap().into(),
        _ => InMemoryStore::new().into(),
    }
}

/// Run everything due, then step the clock, until `until`.
fn drive(manager: &TaskManager, clock: &FixedClock, until: DateTime<Utc>, step: TimeDelta) {
    loop {
        for instance in manager.pick_due_now().unwrap() {
            instance.exec(manager).unwrap();
        }
        if clock.now() >= until {
            break;
        }
        clock.advance(step);
    }
}

fn history(manager: &TaskManager, name: &str) -> Vec<StatusEntry> {
    manager
        .store()
        .transaction(|tx| tx.task_history(&TaskName::from(name), None, None))
        .unwrap()
}

fn recording(name: &str, clock: Arc<FixedClock>, runs: Arc<Mutex<Vec<DateTime<Utc>>>>) -> Task {
    Task::new(name, move || {
        runs.lock().unwrap().push(clock.now());
        Ok(())
    })
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn one_time_task_completes(#[case] kind: &str) {
    let (scheduler, clock) = scheduler(store(kind));
    let manager = scheduler.manager().clone();
    scheduler
        .schedule_after(Task::new("t1", || Ok(())), Duration::ZERO)
        .unwrap();
    assert_eq!(history(&manager, "t1")[0].status, Status::Scheduled);

    let due = manager.pick_due_now().unwrap();
    assert_eq!(history(&manager, "t1")[0].status, Status::Enqueued);
    clock.advance(TimeDelta::milliseconds(5));
    due[0].exec(&manager).unwrap();

    let entry = &history(&manager, "t1")[0];
    assert_eq!(entry.status, Status::Completed);
    assert!(entry.enqueued_at.is_some());
    assert!(entry.started_at.is_some());
    assert!(entry.finished_at.is_some());
    assert_eq!(manager.failed_count(&"t1".into()).unwrap(), 0);
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn exp_backoff_retries_then_fails(#[case] kind: &str) {
    let (scheduler, clock) = scheduler(store(kind));
    let manager = scheduler.manager().clone();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    let at = clock.clone();
    let faulty = Task::new("faulty", move || {
        seen.lock().unwrap().push(at.now());
        anyhow::bail!("always broken")
    })
    .with_retry_policy(RetryPolicy::exp_backoff(3, Duration::from_secs(2), 2.0));
    scheduler.schedule_after(faulty, Duration::ZERO).unwrap();

    drive(&manager, &clock, t0() + TimeDelta::seconds(20), TimeDelta::seconds(1));

    let offsets: Vec<i64> = attempts
        .lock()
        .unwrap()
        .iter()
        .map(|moment| (*moment - t0()).num_seconds())
        .collect();
    assert_eq!(offsets, vec![0, 2, 6, 14]);

    let entries = history(&manager, "faulty");
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e.status == Status::Failed));
    let execution = manager
        .store()
        .transaction(|tx| tx.execution(&"faulty".into()))
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Finished);
    assert_eq!(execution.retry_count, 3);
}

#[test]
fn chain_runs_the_continuation_on_success() {
    let (scheduler, clock) = scheduler(Store::memory());
    let manager = scheduler.manager().clone();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let one = recording("one", clock.clone(), runs.clone());
    let two = recording("two", clock.clone(), runs.clone());

    let chain = Chain::new(one).and_then(Chain::new(two), Duration::from_secs(1));
    scheduler.schedule_chain(chain, t0()).unwrap();
    drive(&manager, &clock, t0() + TimeDelta::seconds(3), TimeDelta::seconds(1));

    assert_eq!(runs.lock().unwrap().len(), 2);
    assert_eq!(history(&manager, "two")[0].status, Status::Completed);
}

#[rstest]
#[case::head_fails(true, 0, 1)]
#[case::head_succeeds(false, 1, 0)]
fn merged_chain_takes_one_branch(
    #[case] head_fails: bool,
    #[case] expected_two: u32,
    #[case] expected_three: u32,
) {
    let (scheduler, clock) = scheduler(Store::memory());
    let manager = scheduler.manager().clone();
    let two_runs = Arc::new(AtomicU32::new(0));
    let three_runs = Arc::new(AtomicU32::new(0));
    let (two_count, three_count) = (two_runs.clone(), three_runs.clone());

    let one = Task::new("one", move || {
        if head_fails {
            anyhow::bail!("one failed");
        }
        Ok(())
    });
    let two = Task::new("two", move || {
        two_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let three = Task::new("three", move || {
        three_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    // one は成功時に two、失敗時に three へつながる
    let success = Chain::new(one.clone()).and_then(Chain::new(two), Duration::ZERO);
    let fallback = Chain::new(one).or_else(Chain::new(three), Duration::ZERO);
    scheduler
        .schedule_chain(success.merge(fallback), t0())
        .unwrap();
    drive(&manager, &clock, t0() + TimeDelta::seconds(2), TimeDelta::seconds(1));

    assert_eq!(two_runs.load(Ordering::SeqCst), expected_two);
    assert_eq!(three_runs.load(Ordering::SeqCst), expected_three);
    let expected_status = if head_fails {
        Status::Failed
    } else {
        Status::Completed
    };
    assert_eq!(history(&manager, "one")[0].status, expected_status);
}

#[test]
fn cron_fires_on_even_seconds_and_reschedules_once() {
    let (scheduler, clock) = scheduler(Store::memory());
    let manager = scheduler.manager().clone();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let beat = recording("beat", clock.clone(), runs.clone());
    scheduler.schedule_cron(beat, "*/2 * * * * ?").unwrap();

    let first = history(&manager, "beat")[0].scheduled_for;
    assert_eq!(first, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap());

    drive(&manager, &clock, t0() + TimeDelta::seconds(6), TimeDelta::seconds(1));

    let offsets: Vec<i64> = runs
        .lock()
        .unwrap()
        .iter()
        .map(|moment| moment.timestamp() % 60)
        .collect();
    assert_eq!(offsets, vec![2, 4, 6]);

    // 各完了で次の 1 件だけが登録される
    let status = TaskStatusService::new(manager.clone());
    let pending = status.scheduled_tasks(None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].execution_time,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 8).unwrap()
    );
    let summary = status.tasks(&TaskFilter::default()).unwrap();
    assert_eq!(summary[0].success_count, 3);
}

#[test]
fn resume_after_cancel_runs_exactly_once() {
    let (scheduler, clock) = scheduler(Store::memory());
    let manager = scheduler.manager().clone();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let task = recording("r", clock.clone(), runs.clone());
    scheduler
        .schedule_at(task, t0() + TimeDelta::seconds(1))
        .unwrap();

    scheduler.cancel(&"r".into()).unwrap();
    drive(&manager, &clock, t0() + TimeDelta::seconds(2), TimeDelta::seconds(1));
    assert!(runs.lock().unwrap().is_empty());

    assert!(scheduler.resume(&"r".into()).unwrap());
    assert!(!scheduler.resume(&"r".into()).unwrap());
    drive(&manager, &clock, t0() + TimeDelta::seconds(4), TimeDelta::seconds(1));
    assert_eq!(runs.lock().unwrap().len(), 1);
}

#[rstest]
#[case::memory("memory")]
#[case::sqlite("sqlite")]
fn concurrent_resumes_reschedule_once(#[case] kind: &str) {
    let (scheduler, clock) = scheduler(store(kind));
    let manager = scheduler.manager().clone();
    let runs = Arc::new(Mutex::new(Vec::new()));
    scheduler
        .schedule_at(recording("r", clock.clone(), runs.clone()), t0())
        .unwrap();
    scheduler.cancel(&"r".into()).unwrap();
    drive(&manager, &clock, t0() + TimeDelta::seconds(1), TimeDelta::seconds(1));
    assert!(runs.lock().unwrap().is_empty());

    let barrier = Barrier::new(2);
    let resumed: Vec<bool> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    manager.resume(&"r".into()).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(resumed.iter().filter(|r| **r).count(), 1);

    drive(&manager, &clock, t0() + TimeDelta::seconds(3), TimeDelta::seconds(1));
    assert_eq!(runs.lock().unwrap().len(), 1);
}

proptest! {
    #[test]
    fn due_instances_are_claimed_exactly_once(offsets in prop::collection::vec(0i64..120, 1..24)) {
        let clock = Arc::new(FixedClock::new(t0()));
        let manager = TaskManager::new(
            Store::memory(),
            Arc::new(TaskResolver::new()),
            clock.clone(),
        );
        for (i, offset) in offsets.iter().enumerate() {
            manager
                .schedule_instance(
                    &TaskName::from("p"),
                    t0() + TimeDelta::seconds(*offset),
                    false,
                    TaskInstanceId::new(format!("p-{i}")),
                )
                .unwrap();
        }
        manager.resolver().register(Task::new("p", || Ok(())));

        let mut claimed = BTreeSet::new();
        for _ in 0..130 {
            for instance in manager.pick_due_now().unwrap() {
                prop_assert!(claimed.insert(instance.id().clone()));
            }
            clock.advance(TimeDelta::seconds(1));
        }
        prop_assert_eq!(claimed.len(), offsets.len());
    }
}
