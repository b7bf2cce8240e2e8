//! Instance Selection Strategies
//!
//! Pluggable policies choosing one instance among the currently Up candidates,
//! plus the down-instance policy quarantining instances after repeated
//! caller-reported errors.

use beacon_core::InstanceRecord;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Policy choosing one instance among Up candidates.
///
/// Candidates are handed over sorted by ascending `instance_id`, so position
/// based strategies are deterministic for a given topology.
pub trait SelectionStrategy: Send + Sync {
    fn select<'a>(&self, candidates: &'a [InstanceRecord]) -> Option<&'a InstanceRecord>;
}

/// Round-robin selection.
///
/// The cursor is retained across calls for fairness. When the candidate set
/// shrinks mid-cycle the cursor keeps advancing modulo the new length rather
/// than restarting from zero.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select<'a>(&self, candidates: &'a [InstanceRecord]) -> Option<&'a InstanceRecord> {
        if candidates.is_empty() {
            return None;
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(&candidates[position % candidates.len()])
    }
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for RandomStrategy {
    fn select<'a>(&self, candidates: &'a [InstanceRecord]) -> Option<&'a InstanceRecord> {
        if candidates.is_empty() {
            return None;
        }
        let position = rand::thread_rng().gen_range(0..candidates.len());
        Some(&candidates[position])
    }
}

/// Quarantine policy for instances with caller-reported errors.
///
/// An instance transitions to Down once `error_threshold` errors are reported
/// within one rolling `window`. It stays excluded from selection until
/// `recovery` elapses, after which it is optimistically re-admitted to
/// candidacy without re-probing.
#[derive(Debug, Clone)]
pub struct DownInstancePolicy {
    pub error_threshold: u32,
    pub window: Duration,
    pub recovery: Duration,
}

impl Default for DownInstancePolicy {
    fn default() -> Self {
        Self {
            error_threshold: 2,
            window: Duration::from_secs(30),
            recovery: Duration::from_secs(30),
        }
    }
}

/// Whether an instance is eligible for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Up,
    Down,
}

/// Per-instance error bookkeeping, owned by the discovery engine's cache and
/// always mutated under its lock, so concurrent error reports coalesce
/// instead of losing updates.
#[derive(Debug, Clone)]
pub(crate) struct InstanceHealth {
    errors: u32,
    window_start: Instant,
    down_since: Option<Instant>,
}

impl InstanceHealth {
    pub(crate) fn new() -> Self {
        Self {
            errors: 0,
            window_start: Instant::now(),
            down_since: None,
        }
    }

    /// Record one caller-reported error against this instance.
    pub(crate) fn note_error(&mut self, policy: &DownInstancePolicy) {
        let now = Instant::now();
        if now.duration_since(self.window_start) > policy.window {
            self.window_start = now;
            self.errors = 0;
        }
        self.errors += 1;
        if self.errors >= policy.error_threshold {
            self.down_since = Some(now);
        }
    }

    /// Current health, re-admitting the instance once the recovery timeout
    /// has elapsed.
    pub(crate) fn state(&mut self, policy: &DownInstancePolicy) -> HealthState {
        match self.down_since {
            None => HealthState::Up,
            Some(since) if since.elapsed() >= policy.recovery => {
                self.down_since = None;
                self.errors = 0;
                self.window_start = Instant::now();
                HealthState::Up
            }
            Some(_) => HealthState::Down,
        }
    }
}
