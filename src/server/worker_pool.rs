//! # Worker Pool
//!
//! A pool of `may` coroutines pulling exchanges off one shared channel and
//! handing each to a [`Service`]. Every submission gets a [`Ticket`] the
//! caller waits on for the [`Completed`] call.
//!
//! ## Configuration
//!
//! - `BRRTC_WORKERS`: worker coroutines (default: 4)
//! - `BRRTC_QUEUE_BOUND`: queued exchanges before backpressure applies (default: 1024)
//! - `BRRTC_BACKPRESSURE_MODE`: `block` waits for room, `shed` rejects at once (default: block)
//! - `BRRTC_BACKPRESSURE_TIMEOUT_MS`: how long `block` waits before rejecting (default: 50)
//! - `BRRTC_STACK_SIZE`: coroutine stack size, decimal or hex (default: 0x10000)
//!
//! A suspended request keeps its worker until it completes.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use may::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Completed, Exchange, Service};
use crate::error::DispatchError;

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Wait up to the configured timeout for room, then reject.
    #[default]
    Block,
    /// Reject immediately.
    Shed,
}

impl FromStr for BackpressureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "shed" => Ok(Self::Shed),
            other => Err(format!("unknown backpressure mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub queue_bound: usize,
    pub backpressure_mode: BackpressureMode,
    pub backpressure_timeout: Duration,
    pub stack_size: usize,
}

impl WorkerPoolConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let num_workers = std::env::var("BRRTC_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.num_workers)
            .max(1);
        let queue_bound = std::env::var("BRRTC_QUEUE_BOUND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.queue_bound)
            .max(1);
        let backpressure_mode = std::env::var("BRRTC_BACKPRESSURE_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let backpressure_timeout = std::env::var("BRRTC_BACKPRESSURE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(defaults.backpressure_timeout, Duration::from_millis);
        let stack_size = std::env::var("BRRTC_STACK_SIZE")
            .ok()
            .and_then(|s| {
                if let Some(hex) = s.strip_prefix("0x") {
                    usize::from_str_radix(hex, 16).ok()
                } else {
                    s.parse().ok()
                }
            })
            .unwrap_or(defaults.stack_size);

        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout,
            stack_size,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: 1024,
            backpressure_mode: BackpressureMode::Block,
            backpressure_timeout: Duration::from_millis(50),
            stack_size: 0x10000, // 64KB
        }
    }
}

/// Counters for one pool. All updates are relaxed atomics.
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    shed: AtomicU64,
    queue_depth: AtomicUsize,
    dispatched: AtomicU64,
    completed: AtomicU64,
    panics: AtomicU64,
}

impl WorkerPoolMetrics {
    fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dequeue(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

type Reply = Result<Completed, DispatchError>;

struct Job {
    exchange: Exchange,
    reply: mpsc::Sender<Reply>,
}

/// Receipt for a submitted exchange.
pub struct Ticket {
    rx: mpsc::Receiver<Reply>,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ticket")
    }
}

impl Ticket {
    /// Block until the worker replies.
    pub fn wait(self) -> Result<Completed, DispatchError> {
        self.rx.recv().map_err(|_| DispatchError::Cancelled)?
    }
}

/// Why an exchange was not queued. The exchange is handed back.
#[derive(Debug)]
pub enum Rejected {
    Overloaded(Exchange),
    Closed(Exchange),
}

impl Rejected {
    pub fn into_exchange(self) -> Exchange {
        match self {
            Rejected::Overloaded(exchange) | Rejected::Closed(exchange) => exchange,
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: Option<mpsc::Sender<Job>>,
    metrics: Arc<WorkerPoolMetrics>,
    workers: Vec<may::coroutine::JoinHandle<()>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("queue_depth", &self.metrics.queue_depth())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn the worker coroutines.
    ///
    /// # Safety
    ///
    /// Spawns coroutines with `may::coroutine::Builder::spawn()`, which is
    /// unsafe in the `may` runtime. Services run on those coroutines must
    /// not block the OS thread for long or use thread-local storage that
    /// assumes one coroutine per thread.
    pub unsafe fn start(service: Arc<dyn Service>, config: WorkerPoolConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(rx);
        let metrics = Arc::new(WorkerPoolMetrics::default());

        info!(
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            backpressure_mode = ?config.backpressure_mode,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let rx = Arc::clone(&rx);
            let service = Arc::clone(&service);
            let metrics = Arc::clone(&metrics);

            let spawn_result = may::coroutine::Builder::new()
                .name(format!("brrtc-worker-{worker_id}"))
                .stack_size(config.stack_size)
                .spawn(move || {
                    debug!(worker_id, "Worker coroutine started");
                    while let Ok(job) = rx.recv() {
                        metrics.record_dequeue();
                        let request_id = job.exchange.request_id();
                        let reply = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || service.service(job.exchange).and_then(|served| served.wait()),
                        )) {
                            Ok(reply) => reply,
                            Err(panic) => {
                                metrics.panics.fetch_add(1, Ordering::Relaxed);
                                error!(
                                    request_id = %request_id,
                                    worker_id,
                                    panic_message = ?panic,
                                    "Service panicked - CRITICAL"
                                );
                                Err(DispatchError::Cancelled)
                            }
                        };
                        metrics.record_completion();
                        if job.reply.send(reply).is_err() {
                            debug!(request_id = %request_id, "Ticket dropped before reply");
                        }
                    }
                    debug!(worker_id, "Worker coroutine exiting");
                });

            match spawn_result {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(worker_id, error = %e, "Failed to spawn worker coroutine"),
            }
        }

        Self {
            config,
            sender: Some(tx),
            metrics,
            workers,
        }
    }

    /// Queue an exchange, applying backpressure when the queue is full.
    pub fn submit(&self, exchange: Exchange) -> Result<Ticket, Rejected> {
        let Some(sender) = &self.sender else {
            return Err(Rejected::Closed(exchange));
        };
        if !self.wait_for_room() {
            self.metrics.shed.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %exchange.request_id(),
                queue_depth = self.metrics.queue_depth(),
                "Worker pool overloaded, shedding request"
            );
            return Err(Rejected::Overloaded(exchange));
        }

        let (reply, rx) = mpsc::channel();
        self.metrics.record_dispatch();
        if let Err(std::sync::mpsc::SendError(job)) = sender.send(Job { exchange, reply }) {
            self.metrics.record_dequeue();
            error!(request_id = %job.exchange.request_id(), "Worker pool channel disconnected");
            return Err(Rejected::Closed(job.exchange));
        }
        Ok(Ticket { rx })
    }

    fn wait_for_room(&self) -> bool {
        let bound = self.config.queue_bound;
        if self.metrics.queue_depth() < bound {
            return true;
        }
        if self.config.backpressure_mode == BackpressureMode::Shed {
            return false;
        }
        let deadline = Instant::now() + self.config.backpressure_timeout;
        while Instant::now() < deadline {
            may::coroutine::yield_now();
            if self.metrics.queue_depth() < bound {
                return true;
            }
        }
        false
    }

    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Stop accepting work and wait for the workers to drain the queue.
    pub fn shutdown(mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Worker coroutine ended with a panic");
            }
        }
        info!(
            completed = self.metrics.completed_count(),
            "Worker pool shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_mode_from_str() {
        assert_eq!("block".parse(), Ok(BackpressureMode::Block));
        assert_eq!("SHED".parse(), Ok(BackpressureMode::Shed));
        assert!("invalid".parse::<BackpressureMode>().is_err());
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.queue_bound, 1024);
        assert_eq!(config.backpressure_mode, BackpressureMode::Block);
        assert_eq!(config.stack_size, 0x10000);
    }

    #[test]
    fn test_metrics_track_depth() {
        let metrics = WorkerPoolMetrics::default();
        metrics.record_dispatch();
        assert_eq!(metrics.dispatched_count(), 1);
        assert_eq!(metrics.queue_depth(), 1);
        metrics.record_dequeue();
        metrics.record_completion();
        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(metrics.completed_count(), 1);
    }
}
