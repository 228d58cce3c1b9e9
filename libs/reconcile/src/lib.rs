//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge recorded state to observed state. Key concepts:
//!
//! - **Recorded state**: What the management node believes exists (State Store).
//! - **Observed state**: What the vendor actually reports.
//! - **Convergence**: The process of making the record match reality.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Retries are bounded; exhaustion is reported, never swallowed

use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// All retry attempts failed.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never waits (used by tests and dry runs).
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Bounded retry settings for transient vendor and scheduler failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
///
/// Returns the last error wrapped in [`ReconcileError::Exhausted`].
pub async fn retry<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, ReconcileError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                debug!(operation, attempt, error = %last_error, "Attempt failed");
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.backoff.delay(attempt)).await;
                }
            }
        }
    }

    Err(ReconcileError::Exhausted {
        operation: operation.to_string(),
        attempts,
        last_error,
    })
}

// =============================================================================
// Restart window
// =============================================================================

/// Crash counter over a rolling window.
///
/// Used by the service supervisor to decide when a unit stops being
/// restarted automatically.
#[derive(Debug, Clone)]
pub struct RestartWindow {
    /// Restarts allowed inside the window before giving up.
    max_restarts: u32,

    /// Rolling window length.
    window: Duration,

    /// Timestamps of recent restarts.
    restarts: Vec<Instant>,
}

impl RestartWindow {
    /// Create a new restart window.
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            restarts: Vec::new(),
        }
    }

    /// Restarts recorded inside the window as of `now`.
    pub fn recent(&mut self, now: Instant) -> u32 {
        let window = self.window;
        self.restarts
            .retain(|t| now.saturating_duration_since(*t) < window);
        self.restarts.len() as u32
    }

    /// Returns true if another restart would exceed the budget.
    pub fn is_exhausted(&mut self, now: Instant) -> bool {
        self.recent(now) >= self.max_restarts
    }

    /// Record a restart.
    pub fn record(&mut self, now: Instant) {
        self.restarts.push(now);
    }
}

// =============================================================================
// Inventory diff
// =============================================================================

/// Result of comparing recorded keys with observed keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    /// Keys only the observer (vendor) reports.
    pub observed_only: BTreeSet<String>,

    /// Keys only the record (store) holds.
    pub recorded_only: BTreeSet<String>,

    /// Keys present on both sides.
    pub matched: BTreeSet<String>,
}

impl InventoryDiff {
    /// Compare two key sets.
    pub fn compute<'a, R, O>(recorded: R, observed: O) -> Self
    where
        R: IntoIterator<Item = &'a str>,
        O: IntoIterator<Item = &'a str>,
    {
        let recorded: BTreeSet<String> = recorded.into_iter().map(str::to_string).collect();
        let observed: BTreeSet<String> = observed.into_iter().map(str::to_string).collect();

        Self {
            observed_only: observed.difference(&recorded).cloned().collect(),
            recorded_only: recorded.difference(&observed).cloned().collect(),
            matched: recorded.intersection(&observed).cloned().collect(),
        }
    }

    /// Returns true if both sides agree.
    pub fn is_converged(&self) -> bool {
        self.observed_only.is_empty() && self.recorded_only.is_empty()
    }
}

// =============================================================================
// Eviction ordering
// =============================================================================

/// Order in which running nodes are chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionOrder {
    /// Most recently started first.
    #[default]
    NewestFirst,

    /// Longest running first.
    OldestFirst,

    /// Highest hourly rate first, newest breaking ties.
    MostExpensiveFirst,
}

impl EvictionOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewestFirst => "newest-first",
            Self::OldestFirst => "oldest-first",
            Self::MostExpensiveFirst => "most-expensive-first",
        }
    }
}

impl std::str::FromStr for EvictionOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest-first" => Ok(Self::NewestFirst),
            "oldest-first" => Ok(Self::OldestFirst),
            "most-expensive-first" => Ok(Self::MostExpensiveFirst),
            other => Err(format!("unknown eviction order '{other}'")),
        }
    }
}

/// A running node as seen by eviction ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionInput<K> {
    pub key: K,
    /// Start time (Unix seconds).
    pub started_at: i64,
    /// Effective hourly rate.
    pub rate: f64,
}

/// Sort nodes so the first element is the first to evict.
///
/// Ties are broken by key so the result is deterministic.
pub fn order_for_eviction<K: Ord>(
    mut nodes: Vec<EvictionInput<K>>,
    order: EvictionOrder,
) -> Vec<EvictionInput<K>> {
    nodes.sort_by(|a, b| {
        let primary = match order {
            EvictionOrder::NewestFirst => b.started_at.cmp(&a.started_at),
            EvictionOrder::OldestFirst => a.started_at.cmp(&b.started_at),
            EvictionOrder::MostExpensiveFirst => b
                .rate
                .total_cmp(&a.rate)
                .then(b.started_at.cmp(&a.started_at)),
        };
        primary.then_with(|| a.key.cmp(&b.key))
    });
    nodes
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Default attempts for a vendor call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default crash-restart budget per window.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default restart window.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(10 * 60);
