//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `info!` event,
//! e.g. when a case is finalized.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    attempts_executed: AtomicU64,
    attempts_failed: AtomicU64,
    critic_turns: AtomicU64,
    evolutions_applied: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            attempts_executed: AtomicU64::new(0),
            attempts_failed: AtomicU64::new(0),
            critic_turns: AtomicU64::new(0),
            evolutions_applied: AtomicU64::new(0),
        }
    }

    /// Count one produce+execute attempt and whether it failed.
    pub fn record_attempt(&self, succeeded: bool) {
        self.attempts_executed.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.attempts_failed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "attempts_executed", "counter incremented");
    }

    pub fn inc_critic_turns(&self) {
        self.critic_turns.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "critic_turns", "counter incremented");
    }

    pub fn inc_evolutions(&self) {
        self.evolutions_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evolutions_applied", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            attempts_executed = self.attempts_executed(),
            attempts_failed = self.attempts_failed(),
            critic_turns = self.critic_turns(),
            evolutions_applied = self.evolutions_applied(),
        );
    }

    pub fn attempts_executed(&self) -> u64 {
        self.attempts_executed.load(Ordering::Relaxed)
    }

    pub fn attempts_failed(&self) -> u64 {
        self.attempts_failed.load(Ordering::Relaxed)
    }

    pub fn critic_turns(&self) -> u64 {
        self.critic_turns.load(Ordering::Relaxed)
    }

    pub fn evolutions_applied(&self) -> u64 {
        self.evolutions_applied.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.attempts_executed.store(0, Ordering::Relaxed);
        self.attempts_failed.store(0, Ordering::Relaxed);
        self.critic_turns.store(0, Ordering::Relaxed);
        self.evolutions_applied.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_split_by_outcome() {
        let m = Metrics::new();
        m.record_attempt(true);
        m.record_attempt(false);
        m.record_attempt(false);
        assert_eq!(m.attempts_executed(), 3);
        assert_eq!(m.attempts_failed(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.record_attempt(false);
        m.inc_critic_turns();
        m.inc_evolutions();
        m.reset();
        assert_eq!(m.attempts_executed(), 0);
        assert_eq!(m.attempts_failed(), 0);
        assert_eq!(m.critic_turns(), 0);
        assert_eq!(m.evolutions_applied(), 0);
    }
}
