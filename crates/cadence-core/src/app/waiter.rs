//! Waiter - polling loop のバックプレッシャー制御
//!
//! # 2 種類の待ち
//! - 仕事が無い: 固定の polling interval だけ眠る
//! - 実行中が多すぎる（in_flight / pool_size > busy_ratio）: ワーカーの完了通知まで止まる
//!
//! # missed wakeup 対策
//! poller は parked フラグを立てたあと、同じロックを持ったまま busy かどうかを再確認してから
//! wait する。ワーカーは in_flight を減らしてから `wake_poller` を呼ぶので、
//! どちらの順序で競合しても poller が永久に止まることはない。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
pub struct Waiter {
    pool_size: usize,
    polling_interval: Duration,
    busy_ratio: f64,
    parked: Mutex<bool>,
    wakeup: Condvar,
    /// ロックを取らずに読める parked のヒント（ワーカー側の fast path 用）
    parked_hint: AtomicBool,
}

impl Waiter {
    pub fn new(pool_size: usize, polling_interval: Duration, busy_ratio: f64) -> Self {
        Self {
            pool_size: pool_size.max(1),
            polling_interval,
            busy_ratio,
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
            parked_hint: AtomicBool::new(false),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn is_busy(&self, in_flight: usize) -> bool {
        in_flight as f64 / self.pool_size as f64 > self.busy_ratio
    }

    pub async fn sleep_polling_interval(&self) {
        tokio::time::sleep(self.polling_interval).await;
    }

    /// Block the calling thread while `in_flight` stays busy.
    ///
    /// Blocking: call from `spawn_blocking`, never directly on the runtime.
    pub fn wait_light_load(&self, in_flight: &AtomicUsize) {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        *parked = true;
        self.parked_hint.store(true, Ordering::SeqCst);
        while *parked && self.is_busy(in_flight.load(Ordering::SeqCst)) {
            parked = self
                .wakeup
                .wait(parked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *parked = false;
        self.parked_hint.store(false, Ordering::SeqCst);
    }

    /// Called by a worker after decrementing the in-flight counter.
    pub fn wake_poller(&self) {
        if !self.parked_hint.load(Ordering::SeqCst) {
            return;
        }
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        if *parked {
            *parked = false;
            self.parked_hint.store(false, Ordering::SeqCst);
            self.wakeup.notify_one();
        }
    }
}
