//! # Worker Pools
//!
//! Blocking work (database queries, file I/O, calls into slow services) must never run on an
//! actor loop. A [`WorkerPool`] owns named groups of [`Worker`]s, each on its own OS thread.
//! The actor submits an [`AsyncNotify`] request tagged with a resumable task id; the worker
//! runs it and sends the reply back; the actor's frame hook calls [`WorkerPool::pump`],
//! which resumes the waiting task with the reply.
//!
//! Workers keep themselves healthy: a keep-alive timer pings open workers and a reconnect
//! timer reopens closed ones.
//!
//! Both directions are bounded. A full request queue is reported by
//! [`WorkerPool::submit`]; a full reply queue holds the worker until the actor pumps.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use marquee::clock::Clock;
use marquee::config::WorkerConfig;
use marquee::notify::AsyncNotify;
use marquee::tasks::TaskTable;
use marquee::timers::{TimerHost, TimerSet};

/// A connection to something slow. Every method runs on the worker's own thread.
pub trait Worker: Send + 'static {
    fn open(&mut self) -> anyhow::Result<()>;

    fn is_open(&self) -> bool;

    fn execute(&mut self, operation: &str, payload: &Value) -> anyhow::Result<Value>;

    /// Called every keep-alive interval while open. An error closes the worker so the
    /// reconnect timer can reopen it.
    fn keep_alive(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self);
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No worker pool named '{0}'")]
    UnknownAlias(String),

    #[error("Worker pool '{0}' already exists")]
    DuplicateAlias(String),

    #[error("Only request envelopes can be submitted (call {0})")]
    NotARequest(u64),

    #[error("Request queue of worker {index} in pool '{alias}' is full")]
    Full { alias: String, index: usize },

    #[error("Worker {index} of pool '{alias}' has stopped")]
    WorkerGone { alias: String, index: usize },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub keep_alive: Duration,
    pub reconnect: Duration,
    /// How long a worker thread waits for a request before running its timers.
    pub poll: Duration,
    /// Requests that may wait for each worker.
    pub queue_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            keep_alive: Duration::from_millis(config.keep_alive_ms),
            reconnect: Duration::from_millis(config.reconnect_ms),
            poll: Duration::from_millis(10),
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

/// Reply queue size of [`WorkerPool::new`].
pub const DEFAULT_REPLY_CAPACITY: usize = 1024;

struct WorkerThread {
    request_tx: Sender<AsyncNotify>,
    stop: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

struct AliasPool {
    workers: Vec<WorkerThread>,
    next: usize,
}

pub struct WorkerPool {
    pools: HashMap<String, AliasPool>,
    reply_tx: Sender<AsyncNotify>,
    reply_rx: Receiver<AsyncNotify>,
    /// Replies taken off the queue while stopping workers, handed out by the next drain.
    parked: Vec<AsyncNotify>,
    in_flight: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_reply_capacity(DEFAULT_REPLY_CAPACITY)
    }

    /// Creates a pool whose workers can queue at most `capacity` unpumped replies.
    pub fn with_reply_capacity(capacity: usize) -> Self {
        let (reply_tx, reply_rx) = channel::bounded(capacity.max(1));
        Self {
            pools: HashMap::new(),
            reply_tx,
            reply_rx,
            parked: Vec::new(),
            in_flight: 0,
        }
    }

    /// Starts `count` workers under `alias`, each built by `factory(index)`.
    pub fn add_pool<W, F>(
        &mut self,
        alias: &str,
        count: usize,
        settings: WorkerSettings,
        factory: F,
    ) -> Result<(), PoolError>
    where
        W: Worker,
        F: Fn(usize) -> W,
    {
        if self.pools.contains_key(alias) {
            return Err(PoolError::DuplicateAlias(alias.to_string()));
        }

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (request_tx, request_rx) = channel::bounded(settings.queue_capacity.max(1));
            let stop = Arc::new(AtomicBool::new(false));
            let state = WorkerState::new(
                format!("{}-{}", alias, index),
                factory(index),
                settings,
                self.reply_tx.clone(),
                stop.clone(),
            );
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", alias, index))
                .spawn(move || state.run(request_rx));
            let join = match spawned {
                Ok(join) => join,
                Err(e) => {
                    self.stop_workers(alias, workers);
                    return Err(PoolError::Spawn(e));
                }
            };
            workers.push(WorkerThread {
                request_tx,
                stop,
                join,
            });
        }

        info!("Started worker pool '{}' with {} workers", alias, count);
        self.pools
            .insert(alias.to_string(), AliasPool { workers, next: 0 });
        Ok(())
    }

    pub fn has_pool(&self, alias: &str) -> bool {
        self.pools.contains_key(alias)
    }

    pub fn worker_count(&self, alias: &str) -> usize {
        self.pools.get(alias).map_or(0, |p| p.workers.len())
    }

    /// Requests submitted whose replies have not been pumped yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Stops and joins every worker of `alias`. Requests still queued to them are dropped.
    pub fn remove_pool(&mut self, alias: &str) -> Result<(), PoolError> {
        let pool = self
            .pools
            .remove(alias)
            .ok_or_else(|| PoolError::UnknownAlias(alias.to_string()))?;
        self.stop_workers(alias, pool.workers);
        info!("Removed worker pool '{}'", alias);
        Ok(())
    }

    pub fn close_all(&mut self) {
        let aliases: Vec<String> = self.pools.keys().cloned().collect();
        for alias in aliases {
            if let Some(pool) = self.pools.remove(&alias) {
                self.stop_workers(&alias, pool.workers);
            }
        }
    }

    /// Hands a request to the next worker of its alias, round-robin. Never blocks: a
    /// worker whose queue is full is reported as [`PoolError::Full`].
    pub fn submit(&mut self, request: AsyncNotify) -> Result<(), PoolError> {
        if !request.is_request() {
            return Err(PoolError::NotARequest(request.call_id));
        }
        let alias = request.alias.clone();
        let pool = self
            .pools
            .get_mut(&alias)
            .ok_or_else(|| PoolError::UnknownAlias(alias.clone()))?;
        if pool.workers.is_empty() {
            return Err(PoolError::WorkerGone { alias, index: 0 });
        }

        let index = pool.next % pool.workers.len();
        pool.next = pool.next.wrapping_add(1);
        debug!(
            "Submitting call {} ({}) to {}-{}",
            request.call_id, request.operation, alias, index
        );
        match pool.workers[index].request_tx.try_send(request) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(TrySendError::Full(request)) => {
                warn!(
                    "Queue of {}-{} is full, refusing call {}",
                    alias, index, request.call_id
                );
                Err(PoolError::Full { alias, index })
            }
            Err(TrySendError::Disconnected(_)) => Err(PoolError::WorkerGone { alias, index }),
        }
    }

    /// Takes every reply that has arrived without blocking.
    pub fn drain_replies(&mut self) -> Vec<AsyncNotify> {
        let mut replies = std::mem::take(&mut self.parked);
        replies.extend(self.reply_rx.try_iter());
        self.in_flight = self.in_flight.saturating_sub(replies.len());
        replies
    }

    /// Stops and joins `workers`. Replies keep being taken off the queue meanwhile, so a
    /// worker blocked on a full reply queue can still see its stop flag.
    fn stop_workers(&mut self, alias: &str, workers: Vec<WorkerThread>) {
        let mut joins = Vec::with_capacity(workers.len());
        for worker in workers {
            worker.stop.store(true, Ordering::SeqCst);
            // Dropping the sender wakes a worker waiting for requests.
            drop(worker.request_tx);
            joins.push(worker.join);
        }

        while !joins.iter().all(|join| join.is_finished()) {
            self.parked.extend(self.reply_rx.try_iter());
            thread::sleep(Duration::from_millis(1));
        }
        self.parked.extend(self.reply_rx.try_iter());

        for (index, join) in joins.into_iter().enumerate() {
            if join.join().is_err() {
                error!("Worker {}-{} panicked", alias, index);
            }
        }
    }

    /// Resumes each waiting task with its reply. Returns how many replies were delivered.
    pub fn pump<V: From<AsyncNotify>>(&mut self, tasks: &TaskTable<V>) -> usize {
        let replies = self.drain_replies();
        let count = replies.len();
        for reply in replies {
            tasks.resume(reply.call_id, V::from(reply));
        }
        count
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Everything one worker thread owns.
struct WorkerState<W: Worker> {
    name: String,
    worker: W,
    timers: TimerSet<WorkerState<W>>,
    clock: Clock,
    reply_tx: Sender<AsyncNotify>,
    stop: Arc<AtomicBool>,
    poll: Duration,
}

impl<W: Worker> TimerHost for WorkerState<W> {
    fn timers(&mut self) -> &mut TimerSet<Self> {
        &mut self.timers
    }
}

impl<W: Worker> WorkerState<W> {
    fn new(
        name: String,
        worker: W,
        settings: WorkerSettings,
        reply_tx: Sender<AsyncNotify>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let mut timers = TimerSet::new();
        let keep_alive_ms = settings.keep_alive.as_millis() as u64;
        let reconnect_ms = settings.reconnect.as_millis() as u64;

        // Names are unique within a fresh set, so these cannot conflict.
        let _ = timers.add("keep-alive", keep_alive_ms, 0, |state: &mut WorkerState<W>| {
            if state.worker.is_open() {
                if let Err(e) = state.worker.keep_alive() {
                    warn!("Worker {} failed keep-alive, closing: {}", state.name, e);
                    state.worker.close();
                }
            }
            Ok(())
        });
        let _ = timers.add("reconnect", reconnect_ms, 0, |state: &mut WorkerState<W>| {
            if !state.worker.is_open() {
                state.try_open();
            }
            Ok(())
        });

        Self {
            name,
            worker,
            timers,
            clock: Clock::new(),
            reply_tx,
            stop,
            poll: settings.poll,
        }
    }

    fn try_open(&mut self) -> bool {
        match self.worker.open() {
            Ok(()) => {
                info!("Worker {} opened", self.name);
                true
            }
            Err(e) => {
                warn!("Worker {} failed to open: {}", self.name, e);
                false
            }
        }
    }

    fn run(mut self, request_rx: Receiver<AsyncNotify>) {
        self.try_open();

        // Requests still queued when the stop flag is raised are dropped.
        while !self.stop.load(Ordering::SeqCst) {
            match request_rx.recv_timeout(self.poll) {
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now_ms = self.clock.now_ms();
            TimerSet::run_once(&mut self, now_ms);
        }

        if self.worker.is_open() {
            self.worker.close();
        }
        debug!("Worker {} stopped", self.name);
    }

    fn handle(&mut self, request: AsyncNotify) {
        if !request.is_request() {
            warn!(
                "Worker {} ignoring non-request envelope for call {}",
                self.name, request.call_id
            );
            return;
        }
        if !self.worker.is_open() && !self.try_open() {
            let reply = request.into_reply(Err(anyhow::anyhow!("worker unavailable")));
            self.reply(reply);
            return;
        }

        let worker = &mut self.worker;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            worker.execute(&request.operation, &request.payload)
        }))
        .unwrap_or_else(|_| Err(anyhow::anyhow!("worker panicked")));
        if let Err(e) = &outcome {
            warn!(
                "Worker {} failed {} for call {}: {}",
                self.name, request.operation, request.call_id, e
            );
        }

        self.reply(request.into_reply(outcome));
    }

    /// Blocks while the reply queue is full.
    fn reply(&self, reply: AsyncNotify) {
        if self.reply_tx.send(reply).is_err() {
            debug!("Worker {} has no pool to reply to", self.name);
        }
    }
}
