//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Retry policy for failed task instances.
///
/// `failed_count` は「今回の失敗を含まない」過去の失敗回数。
/// ExecutionsRepository の retry count がその正本になる。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// Same delay for every retry.
    FixedDelay { max_retries: u32, delay: Duration },

    /// delay = first_delay * multiplier^failed_count
    ExpBackoff {
        max_retries: u32,
        first_delay: Duration,
        multiplier: f64,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(max_retries: u32, delay: Duration) -> Self {
        Self::FixedDelay { max_retries, delay }
    }

    pub fn exp_backoff(max_retries: u32, first_delay: Duration, multiplier: f64) -> Self {
        Self::ExpBackoff {
            max_retries,
            first_delay,
            multiplier,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::FixedDelay { max_retries, .. } | Self::ExpBackoff { max_retries, .. } => {
                *max_retries
            }
        }
    }

    /// Delay before the next retry, or `None` once the policy is exhausted.
    ///
    /// Example with ExpBackoff(first_delay=2s, multiplier=2.0):
    /// - failed_count 0: 2s
    /// - failed_count 1: 4s
    /// - failed_count 2: 8s
    pub fn next_delay(&self, failed_count: u32) -> Option<Duration> {
        if failed_count >= self.max_retries() {
            return None;
        }
        match *self {
            Self::FixedDelay { delay, .. } => Some(delay),
            Self::ExpBackoff {
                first_delay,
                multiplier,
                ..
            } => Some(scale(first_delay, multiplier.max(0.0).powi(exponent(failed_count)))),
        }
    }
}

fn exponent(failed_count: u32) -> i32 {
    i32::try_from(failed_count).unwrap_or(i32::MAX)
}

// ナノ秒単位で計算する（秒の f64 より誤差が出にくい）
fn scale(base: Duration, factor: f64) -> Duration {
    let nanos = base.as_nanos() as f64 * factor;
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Duration::from_nanos(u64::MAX);
    }
    Duration::from_nanos(nanos.round() as u64)
}
