//! Configuration for the concurrency manager.
//!
//! Mirrors the manager's options one field at a time; see each field's
//! doc comment for the option name it corresponds to.

use std::time::Duration;

use log::warn;

/// How a pool's admission queue behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// No queueing: a submit must hand the job directly to an idle
    /// worker, spawning a new one (up to the pool's max) if none is idle.
    Handoff,
    /// A fixed-capacity array queue. Once full, submitters either back off
    /// (write pool, via the router's backpressure policy) or block.
    Bounded(usize),
    /// An unbounded linked queue.
    Unbounded,
}

impl QueueKind {
    /// `writeService.queueCapacity` semantics: 0 or > 5000 maps to
    /// `Unbounded`, a documented footgun preserved rather than rejected.
    /// The manager logs a warning once at startup when this mapping
    /// takes effect.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 || capacity > 5000 {
            QueueKind::Unbounded
        } else {
            QueueKind::Bounded(capacity)
        }
    }
}

/// Shape of one of the three executor pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum resident worker threads (`corePoolSize`).
    pub core_pool_size: usize,
    /// Maximum worker threads (`maximumPoolSize`). Must be >= core.
    pub max_pool_size: usize,
    /// How long an idle worker beyond `core_pool_size` survives before
    /// being culled (`keepAliveTime`).
    pub keep_alive: Duration,
    /// Eagerly create all core workers at startup.
    pub prestart_core_threads: bool,
    /// Admission queue shape.
    pub queue: QueueKind,
}

impl PoolConfig {
    /// `txService`/`readService` pool shape: core size configurable,
    /// 0 means an unbounded handoff pool, N>0 means a fixed-size one.
    pub fn handoff(core_pool_size: usize) -> Self {
        let max = if core_pool_size == 0 { usize::MAX } else { core_pool_size };
        Self {
            core_pool_size,
            max_pool_size: max,
            keep_alive: Duration::from_secs(60),
            prestart_core_threads: false,
            queue: QueueKind::Handoff,
        }
    }
}

/// Caller-side delay applied when a bounded pool's queue approaches
/// saturation, to avoid unbounded growth ahead of the queue itself.
#[derive(Debug, Clone)]
pub struct BackpressurePolicy {
    /// Whether the delay is applied at all.
    pub enabled: bool,
    /// Fill fraction (0.0-1.0) at or above which a submit sleeps and
    /// retries rather than enqueueing immediately.
    pub threshold: f64,
    /// How long to sleep before retrying.
    pub delay: Duration,
    /// Total time a single submit will spend sleeping/retrying under
    /// sustained saturation before giving up with `Rejected`.
    /// `Duration::ZERO` means wait forever, matching this crate's other
    /// zero-means-unbounded conventions (`shutdown_timeout`,
    /// `write_queue_capacity`'s footgun case).
    pub max_wait: Duration,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.91,
            delay: Duration::from_millis(50),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Top-level configuration for the concurrency manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// `readService.corePoolSize` (default 0: unbounded handoff pool).
    pub read_pool: PoolConfig,
    /// `txService.corePoolSize` (default 0: unbounded handoff pool).
    pub tx_pool: PoolConfig,
    /// `writeService.corePoolSize` (default 10).
    pub write_core_pool_size: usize,
    /// `writeService.maximumPoolSize` (default 50).
    pub write_max_pool_size: usize,
    /// `writeService.keepAliveTime` (default 60_000ms).
    pub write_keep_alive: Duration,
    /// `writeService.prestartAllCoreThreads` (default false).
    pub write_prestart_core_threads: bool,
    /// `writeService.queueCapacity` (default 1000).
    pub write_queue_capacity: usize,
    /// `writeService.groupCommitTimeout` (default 100ms; 0 disables
    /// grouping, every task commits alone).
    pub group_commit_timeout: Duration,
    /// Jitter applied to the group commit timer, as a fraction of the
    /// timeout (default 0.15, i.e. 15%). The spec calls this out as
    /// "logical, not wall-clock-precise."
    pub group_commit_jitter: f64,
    /// `shutdownTimeout` (default 30s; `Duration::ZERO` means wait
    /// forever).
    pub shutdown_timeout: Duration,
    /// `collectQueueStatistics` (default false): enables the 1 Hz sampler.
    pub collect_queue_statistics: bool,
    /// How long admission waits for the resource manager to report ready
    /// before failing with `Rejected`.
    pub readiness_timeout: Duration,
    /// Backpressure policy for bounded pools (see Open Questions).
    pub backpressure: BackpressurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_pool: PoolConfig::handoff(0),
            tx_pool: PoolConfig::handoff(0),
            write_core_pool_size: 10,
            write_max_pool_size: 50,
            write_keep_alive: Duration::from_millis(60_000),
            write_prestart_core_threads: false,
            write_queue_capacity: 1000,
            group_commit_timeout: Duration::from_millis(100),
            group_commit_jitter: 0.15,
            shutdown_timeout: Duration::from_secs(30),
            collect_queue_statistics: false,
            readiness_timeout: Duration::from_secs(5),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

impl Config {
    /// Derive the write pool's concrete config from the flat fields above.
    pub fn write_pool(&self) -> PoolConfig {
        let queue = QueueKind::from_capacity(self.write_queue_capacity);
        if queue == QueueKind::Unbounded && self.write_queue_capacity != 0 {
            warn!(
                "write_queue_capacity={} exceeds 5000, falling back to an unbounded queue",
                self.write_queue_capacity
            );
        }
        PoolConfig {
            core_pool_size: self.write_core_pool_size,
            max_pool_size: self.write_max_pool_size.max(self.write_core_pool_size),
            keep_alive: self.write_keep_alive,
            prestart_core_threads: self.write_prestart_core_threads,
            queue,
        }
    }

    /// A config with grouping disabled: every unisolated task commits
    /// alone (`groupCommitTimeout = 0`).
    pub fn no_grouping() -> Self {
        Self {
            group_commit_timeout: Duration::ZERO,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.write_core_pool_size, 10);
        assert_eq!(cfg.write_max_pool_size, 50);
        assert_eq!(cfg.write_queue_capacity, 1000);
        assert_eq!(cfg.group_commit_timeout, Duration::from_millis(100));
        assert!(cfg.backpressure.enabled);
        assert_eq!(cfg.backpressure.threshold, 0.91);
    }

    #[test]
    fn queue_capacity_footgun_maps_to_unbounded() {
        assert_eq!(QueueKind::from_capacity(0), QueueKind::Unbounded);
        assert_eq!(QueueKind::from_capacity(5001), QueueKind::Unbounded);
        assert_eq!(QueueKind::from_capacity(5000), QueueKind::Bounded(5000));
        assert_eq!(QueueKind::from_capacity(1000), QueueKind::Bounded(1000));
    }

    #[test]
    fn handoff_pool_core_zero_is_unbounded_max() {
        let p = PoolConfig::handoff(0);
        assert_eq!(p.core_pool_size, 0);
        assert_eq!(p.max_pool_size, usize::MAX);
        assert_eq!(p.queue, QueueKind::Handoff);
    }

    #[test]
    fn write_pool_clamps_max_to_core() {
        let mut cfg = Config::default();
        cfg.write_core_pool_size = 20;
        cfg.write_max_pool_size = 5; // misconfigured below core
        let pool = cfg.write_pool();
        assert_eq!(pool.max_pool_size, 20);
    }
}
