//! The worker pool: job intake, scheduling, memory accounting, statistics.
//!
//! Workers are plain OS threads over a shared queue. Each worker drives one
//! job's pipeline end to end (see `pipeline`); jobs never share decoder
//! state or buffers. The only cross-thread state is the queue (mutex +
//! condvar), the stats counters (atomics), and the memory watchdog
//! (atomics), all held for short critical sections.
//!
//! Progress flows to the caller over a bounded channel. When the consumer
//! lags, interim records are dropped (and counted); the terminal outcome
//! always arrives through the single-slot result channel, so a job handle
//! resolves no matter how the progress stream is treated.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::JobDescriptor;
use crate::pipeline::{self, PRESSURE_FRACTION};
use crate::progress::{CancelHandle, CancelReason, Progress};
use crate::reader::MIN_CHUNK_SIZE;
use crate::summary::AudioSummary;

/// Pool configuration; also the argument to `tune`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker threads to spawn. Fixed at construction; `tune` ignores it.
    pub pool_size: usize,
    /// Jobs allowed to run simultaneously (≤ pool_size is sensible).
    pub max_concurrent: usize,
    /// Global soft ceiling for in-flight chunk bytes across all jobs.
    pub memory_budget: usize,
    /// Bound of each job's progress channel.
    pub progress_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            pool_size: cores,
            max_concurrent: cores,
            memory_budget: 512 * 1024 * 1024,
            progress_capacity: 64,
        }
    }
}

/// Identifier of one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub active_workers: usize,
    pub queued_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    pub bytes_in_flight: usize,
    pub peak_bytes: usize,
    /// Interim progress records dropped because a consumer lagged.
    pub dropped_progress: u64,
}

/// Caller's handle to one submitted job.
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    cancel: CancelHandle,
    progress_rx: Receiver<Progress>,
    result_rx: Receiver<Result<AudioSummary>>,
}

impl JobHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Block for the next progress record; `None` once the stream is done.
    pub fn next_progress(&self) -> Option<Progress> {
        self.progress_rx.recv().ok()
    }

    /// Blocking iterator over the progress stream; ends after the terminal
    /// record (the worker drops its sender when the job resolves).
    pub fn progress_iter(&self) -> impl Iterator<Item = Progress> + '_ {
        std::iter::from_fn(move || self.next_progress())
    }

    /// Block until the job resolves.
    ///
    /// Always resolves: a pool dropped with this job still queued resolves
    /// it as `Cancelled`.
    pub fn wait(self) -> Result<AudioSummary> {
        match self.result_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Non-blocking poll of the result slot.
    pub fn try_wait(&self) -> Option<Result<AudioSummary>> {
        self.result_rx.try_recv().ok()
    }
}

/// A pool of waveform workers.
///
/// Dropping the pool cancels queued and running jobs, resolves their
/// handles, and joins every worker; no background work survives.
pub struct WaveformPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

struct PoolShared {
    queue: Mutex<VecDeque<QueuedJob>>,
    queue_cv: Condvar,
    config: Mutex<PoolConfig>,
    watchdog: MemoryWatchdog,
    counters: Counters,
    active_cancels: Mutex<HashMap<JobId, CancelHandle>>,
    shutdown: AtomicBool,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    dropped_progress: AtomicU64,
}

struct QueuedJob {
    id: JobId,
    descriptor: JobDescriptor,
    cancel: CancelHandle,
    progress_tx: SyncSender<Progress>,
    result_tx: SyncSender<Result<AudioSummary>>,
}

impl WaveformPool {
    pub fn new(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            watchdog: MemoryWatchdog::new(config.memory_budget),
            config: Mutex::new(config.clone()),
            counters: Counters::default(),
            active_cancels: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..config.pool_size.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("waveline-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn waveform worker")
            })
            .collect();

        info!(workers = config.pool_size.max(1), "waveform pool started");
        Self { shared, workers }
    }

    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    /// Queue a job and return its handle.
    ///
    /// Fails up front when the job can never run: zero resolution, or a
    /// memory budget no chunk can fit under.
    pub fn submit(&self, descriptor: JobDescriptor) -> Result<JobHandle> {
        if descriptor.resolution == 0 {
            return Err(Error::Other("target resolution must be at least 1".into()));
        }

        let (budget, progress_capacity) = {
            let config = self.shared.config.lock().expect("pool config");
            (config.memory_budget, config.progress_capacity.max(1))
        };
        if MIN_CHUNK_SIZE > budget {
            return Err(Error::MemoryExceeded {
                needed: MIN_CHUNK_SIZE,
                available: budget,
            });
        }

        let id = JobId::new();
        let cancel = descriptor.cancel.clone().unwrap_or_default();
        let (progress_tx, progress_rx) = sync_channel(progress_capacity);
        let (result_tx, result_rx) = sync_channel(1);

        {
            let mut queue = self.shared.queue.lock().expect("job queue");
            queue.push_back(QueuedJob {
                id,
                descriptor,
                cancel: cancel.clone(),
                progress_tx,
                result_tx,
            });
        }
        self.shared.queue_cv.notify_one();
        debug!(%id, "job queued");

        Ok(JobHandle {
            id,
            cancel,
            progress_rx,
            result_rx,
        })
    }

    /// Request cancellation of a job by handle.
    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel();
        self.shared.queue_cv.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self.shared.queue.lock().expect("job queue").len();
        PoolStats {
            active_workers: self.shared.counters.active.load(Ordering::Relaxed),
            queued_jobs: queued,
            completed_jobs: self.shared.counters.completed.load(Ordering::Relaxed),
            failed_jobs: self.shared.counters.failed.load(Ordering::Relaxed),
            cancelled_jobs: self.shared.counters.cancelled.load(Ordering::Relaxed),
            bytes_in_flight: self.shared.watchdog.bytes_in_flight(),
            peak_bytes: self.shared.watchdog.peak_bytes(),
            dropped_progress: self.shared.counters.dropped_progress.load(Ordering::Relaxed),
        }
    }

    /// Adjust runtime limits. `pool_size` is fixed at construction and
    /// ignored here; new limits apply to jobs admitted from now on.
    pub fn tune(&self, config: PoolConfig) {
        self.shared.watchdog.set_budget(config.memory_budget);
        let mut current = self.shared.config.lock().expect("pool config");
        let pool_size = current.pool_size;
        *current = config;
        current.pool_size = pool_size;
        drop(current);
        self.shared.queue_cv.notify_all();
    }
}

impl Drop for WaveformPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);

        // Resolve everything still queued as cancelled.
        {
            let mut queue = self.shared.queue.lock().expect("job queue");
            for job in queue.drain(..) {
                job.cancel.cancel_with(CancelReason::Shutdown);
                let _ = job.progress_tx.try_send(Progress::terminal_error(0.0, &Error::Cancelled));
                let _ = job.result_tx.try_send(Err(Error::Cancelled));
            }
        }

        // Running jobs observe their token at the next chunk boundary.
        for cancel in self.shared.active_cancels.lock().expect("active map").values() {
            cancel.cancel_with(CancelReason::Shutdown);
        }

        self.shared.queue_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("waveform pool stopped");
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("job queue");
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let max_concurrent = shared
                    .config
                    .lock()
                    .expect("pool config")
                    .max_concurrent
                    .max(1);
                let active = shared.counters.active.load(Ordering::Relaxed);
                if active < max_concurrent {
                    if let Some(job) = queue.pop_front() {
                        break job;
                    }
                }
                let (next, _) = shared
                    .queue_cv
                    .wait_timeout(queue, Duration::from_millis(50))
                    .expect("queue condvar");
                queue = next;
            }
        };

        run_one(&shared, job);
        shared.queue_cv.notify_all();
    }
}

fn run_one(shared: &PoolShared, job: QueuedJob) {
    let QueuedJob {
        id,
        descriptor,
        cancel,
        progress_tx,
        result_tx,
    } = job;

    shared.counters.active.fetch_add(1, Ordering::Relaxed);
    shared
        .active_cancels
        .lock()
        .expect("active map")
        .insert(id, cancel.clone());

    let mut last_fraction = 0.0f32;
    let publish = |record: Progress| {
        // Contract: once `cancel` returns, no further records appear.
        if cancel.is_cancelled() {
            return;
        }
        last_fraction = record.fraction.max(last_fraction);
        match progress_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                shared
                    .counters
                    .dropped_progress
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    };

    let result = pipeline::run_job(&descriptor, &cancel, &shared.watchdog, publish);

    match &result {
        Ok(_) => {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            let _ = progress_tx.try_send(Progress::completed());
        }
        Err(Error::Cancelled) | Err(Error::Deadline) => {
            shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "job cancelled");
        }
        Err(err) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(%id, %err, "job failed");
            let _ = progress_tx.try_send(Progress::terminal_error(last_fraction, err));
        }
    }

    shared
        .active_cancels
        .lock()
        .expect("active map")
        .remove(&id);
    shared.counters.active.fetch_sub(1, Ordering::Relaxed);

    // Cancelled jobs emit no further progress records by contract; their
    // terminal status travels on the result slot alone. Deliver the result
    // last so callers unblocked by `wait` observe settled counters.
    let _ = result_tx.try_send(result);
}

/// Global accounting for in-flight chunk bytes.
///
/// Reservations are RAII: a failed pipeline, a cancel, or a panic all give
/// the bytes back when the guard drops.
#[derive(Debug)]
pub struct MemoryWatchdog {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    budget: AtomicUsize,
}

impl MemoryWatchdog {
    pub fn new(budget: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            budget: AtomicUsize::new(budget),
        }
    }

    /// Reserve `bytes` against the budget.
    pub fn reserve(&self, bytes: usize) -> Result<MemoryReservation<'_>> {
        let budget = self.budget.load(Ordering::Relaxed);
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            let proposed = current.saturating_add(bytes);
            if proposed > budget {
                return Err(Error::MemoryExceeded {
                    needed: bytes,
                    available: budget.saturating_sub(current),
                });
            }
            match self.in_flight.compare_exchange_weak(
                current,
                proposed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(proposed, Ordering::Relaxed);
                    return Ok(MemoryReservation {
                        watchdog: self,
                        bytes,
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether in-flight bytes sit above the pressure threshold.
    pub fn under_pressure(&self) -> bool {
        let budget = self.budget.load(Ordering::Relaxed);
        if budget == usize::MAX {
            return false;
        }
        let threshold = (budget as f64 * PRESSURE_FRACTION) as usize;
        self.in_flight.load(Ordering::Relaxed) > threshold
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn set_budget(&self, budget: usize) {
        self.budget.store(budget, Ordering::Relaxed);
    }
}

/// RAII guard for one reservation.
#[derive(Debug)]
pub struct MemoryReservation<'a> {
    watchdog: &'a MemoryWatchdog,
    bytes: usize,
}

impl Drop for MemoryReservation<'_> {
    fn drop(&mut self) {
        self.watchdog.in_flight.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_reserves_and_releases() {
        let watchdog = MemoryWatchdog::new(1000);

        let a = watchdog.reserve(600).expect("first reservation");
        assert_eq!(watchdog.bytes_in_flight(), 600);

        let err = watchdog.reserve(500).unwrap_err();
        assert!(matches!(
            err,
            Error::MemoryExceeded {
                needed: 500,
                available: 400
            }
        ));

        drop(a);
        assert_eq!(watchdog.bytes_in_flight(), 0);
        assert_eq!(watchdog.peak_bytes(), 600);

        let _b = watchdog.reserve(1000).expect("fits after release");
    }

    #[test]
    fn watchdog_pressure_threshold() {
        let watchdog = MemoryWatchdog::new(1000);
        assert!(!watchdog.under_pressure());

        let _r = watchdog.reserve(900).expect("reserve");
        assert!(watchdog.under_pressure());

        // An unlimited watchdog never signals pressure.
        let unlimited = MemoryWatchdog::new(usize::MAX);
        let _r2 = unlimited.reserve(1 << 30).expect("reserve");
        assert!(!unlimited.under_pressure());
    }

    #[test]
    fn submit_rejects_impossible_budget() {
        let pool = WaveformPool::new(PoolConfig {
            pool_size: 1,
            max_concurrent: 1,
            memory_budget: 16,
            progress_capacity: 4,
        });
        let err = pool
            .submit(crate::job::JobDescriptor::new("/tmp/x.wav", 10))
            .unwrap_err();
        assert!(matches!(err, Error::MemoryExceeded { .. }));
    }

    #[test]
    fn tune_updates_budget_but_not_pool_size() {
        let pool = WaveformPool::new(PoolConfig {
            pool_size: 2,
            max_concurrent: 2,
            memory_budget: 1024,
            progress_capacity: 4,
        });
        pool.tune(PoolConfig {
            pool_size: 99,
            max_concurrent: 4,
            memory_budget: 2048,
            progress_capacity: 8,
        });
        let config = pool.shared.config.lock().expect("config");
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.memory_budget, 2048);
    }
}
