//! Rate-limiting decorator for any [`StorageBackend`].
//!
//! Reads and writes draw from independent per-minute token buckets. A
//! throttled call is delayed, never rejected. An optional daily write budget
//! (UTC days) lets writes bypass the write bucket until it is used up; after
//! that writes fall back to the bucket for the rest of the day.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::{SharedStorage, StorageBackend, StorageError, StorageVersion, StoredObject};
use crate::clock::{SharedClock, system_clock};
use crate::helpers::lock;

/// `None` (or zero) means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleOptions {
    #[serde(default)]
    pub max_reads_per_minute: Option<u32>,
    #[serde(default)]
    pub max_writes_per_minute: Option<u32>,
    #[serde(default)]
    pub max_writes_per_day: Option<u64>,
}

impl ThrottleOptions {
    pub fn is_unlimited(&self) -> bool {
        positive(self.max_reads_per_minute).is_none()
            && positive(self.max_writes_per_minute).is_none()
            && self.max_writes_per_day.filter(|n| *n > 0).is_none()
    }
}

fn positive(limit: Option<u32>) -> Option<u32> {
    limit.filter(|n| *n > 0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    pub total_reads: u64,
    pub total_writes: u64,
    pub throttled_reads: u64,
    pub throttled_writes: u64,
    pub total_read_delay_ms: u64,
    pub total_write_delay_ms: u64,
    /// Writes counted against the current UTC day.
    pub daily_write_count: u64,
    pub daily_budget_exceeded: bool,
}

/// Token bucket holding at most `burst` tokens, refilled continuously at
/// `limit` tokens per minute.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    per_minute: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(limit: u32, now: Instant) -> Self {
        let burst = (limit / 60).max(1) as f64;
        Self {
            tokens: burst,
            burst,
            per_minute: limit as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        if elapsed_ms > 0.0 {
            self.tokens = (self.tokens + elapsed_ms * self.per_minute / 60_000.0).min(self.burst);
            self.last_refill = now;
        }
    }

    /// Take one token, returning how long the caller must wait for it.
    ///
    /// The token is reserved immediately, so the balance may go negative and
    /// concurrent callers queue up behind each other rather than all waking
    /// at once.
    fn acquire(&mut self, now: Instant) -> Duration {
        self.refill(now);
        let deficit = 1.0 - self.tokens;
        self.tokens -= 1.0;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis((deficit * 60_000.0 / self.per_minute).ceil() as u64)
    }
}

#[derive(Debug)]
struct DailyBudget {
    limit: Option<u64>,
    day: Option<NaiveDate>,
}

impl DailyBudget {
    /// Count one write on `day`; true while still within budget.
    fn record(&mut self, day: NaiveDate, stats: &mut ThrottleStats) -> bool {
        if self.day != Some(day) {
            self.day = Some(day);
            stats.daily_write_count = 0;
            stats.daily_budget_exceeded = false;
        }
        stats.daily_write_count += 1;
        match self.limit {
            Some(limit) if stats.daily_write_count <= limit => true,
            Some(_) => {
                stats.daily_budget_exceeded = true;
                false
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Limiter {
    reads: Option<TokenBucket>,
    writes: Option<TokenBucket>,
    daily: DailyBudget,
    stats: ThrottleStats,
}

pub struct ThrottledBackend {
    inner: SharedStorage,
    limiter: Mutex<Limiter>,
    clock: SharedClock,
}

impl ThrottledBackend {
    pub fn new(inner: SharedStorage, options: ThrottleOptions) -> Self {
        Self::with_clock(inner, options, system_clock())
    }

    /// `clock` decides the UTC day for the write budget; bucket refill uses
    /// the tokio clock.
    pub fn with_clock(inner: SharedStorage, options: ThrottleOptions, clock: SharedClock) -> Self {
        let now = Instant::now();
        let limiter = Limiter {
            reads: positive(options.max_reads_per_minute).map(|l| TokenBucket::per_minute(l, now)),
            writes: positive(options.max_writes_per_minute)
                .map(|l| TokenBucket::per_minute(l, now)),
            daily: DailyBudget {
                limit: options.max_writes_per_day.filter(|n| *n > 0),
                day: None,
            },
            stats: ThrottleStats::default(),
        };
        Self {
            inner,
            limiter: Mutex::new(limiter),
            clock,
        }
    }

    pub fn stats(&self) -> ThrottleStats {
        lock(&self.limiter).stats.clone()
    }

    fn utc_day(&self) -> NaiveDate {
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms())
            .unwrap_or_default()
            .date_naive()
    }

    async fn acquire_read(&self) {
        let delay = {
            let mut limiter = lock(&self.limiter);
            limiter.stats.total_reads += 1;
            let delay = match limiter.reads.as_mut() {
                Some(bucket) => bucket.acquire(Instant::now()),
                None => Duration::ZERO,
            };
            if !delay.is_zero() {
                limiter.stats.throttled_reads += 1;
                limiter.stats.total_read_delay_ms += delay.as_millis() as u64;
            }
            delay
        };
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "read throttled");
            tokio::time::sleep(delay).await;
        }
    }

    async fn acquire_write(&self) {
        let day = self.utc_day();
        let delay = {
            let mut limiter = lock(&self.limiter);
            let Limiter {
                writes,
                daily,
                stats,
                ..
            } = &mut *limiter;
            stats.total_writes += 1;
            if daily.record(day, stats) {
                Duration::ZERO
            } else {
                let delay = match writes.as_mut() {
                    Some(bucket) => bucket.acquire(Instant::now()),
                    None => Duration::ZERO,
                };
                if !delay.is_zero() {
                    stats.throttled_writes += 1;
                    stats.total_write_delay_ms += delay.as_millis() as u64;
                }
                delay
            }
        };
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "write throttled");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl StorageBackend for ThrottledBackend {
    async fn read(&self, key: &str) -> Result<Option<StoredObject>, StorageError> {
        self.acquire_read().await;
        self.inner.read(key).await
    }

    async fn write(
        &self,
        key: &str,
        data: Bytes,
        expected: &StorageVersion,
    ) -> Result<StorageVersion, StorageError> {
        self.acquire_write().await;
        self.inner.write(key, data, expected).await
    }

    async fn create_if_not_exists(
        &self,
        key: &str,
        data: Bytes,
    ) -> Result<StorageVersion, StorageError> {
        self.acquire_write().await;
        self.inner.create_if_not_exists(key, data).await
    }
}
