//! # Resumable Tasks
//!
//! A [`TaskTable`] lets actor logic write straight-line code that waits for a worker reply
//! without ever blocking the loop. Each task is a future that only awaits its
//! [`Suspension`]; the table polls it by hand whenever a value is delivered, so the task
//! makes progress exclusively inside [`TaskTable::dispatch_pending`] on the actor's own
//! thread.
//!
//! ```ignore
//! let id = tasks.start(|suspension| async move {
//!     let call_id = suspension.own_id().await;
//!     pool.submit(AsyncNotify::request("db", call_id, "load", payload))?;
//!     let reply = suspension.value().await;
//!     // continue with the reply
//! });
//! ```
//!
//! Tasks must not await anything other than their suspension: nobody holds their waker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::errors::TaskError;

pub type TaskId = u64;

/// Task ids start here so they never collide with small ids used elsewhere.
pub const FIRST_TASK_ID: TaskId = 1000;

/// What a suspended task is woken with.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption<V> {
    /// Delivered once, right after the task first suspends.
    Started(TaskId),
    Value(V),
}

type Slot<V> = Arc<Mutex<Option<Resumption<V>>>>;

fn fill<V>(slot: &Slot<V>, value: Resumption<V>) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(value);
}

/// The task's side of the table: the only thing a task awaits.
pub struct Suspension<V> {
    slot: Slot<V>,
}

impl<V> Suspension<V> {
    /// Suspends until the table delivers the next resumption.
    pub fn next(&self) -> Next<'_, V> {
        Next { slot: &self.slot }
    }

    /// Waits for the task's own id, delivered right after the first suspension.
    pub async fn own_id(&self) -> TaskId {
        loop {
            match self.next().await {
                Resumption::Started(id) => return id,
                Resumption::Value(_) => warn!("Value delivered before task id, ignoring"),
            }
        }
    }

    /// Waits for the next delivered value.
    pub async fn value(&self) -> V {
        loop {
            if let Resumption::Value(value) = self.next().await {
                return value;
            }
        }
    }
}

/// Future returned by [`Suspension::next`].
pub struct Next<'a, V> {
    slot: &'a Slot<V>,
}

impl<V> Future for Next<'_, V> {
    type Output = Resumption<V>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(resumption) => Poll::Ready(resumption),
            None => Poll::Pending,
        }
    }
}

enum TaskEvent<V> {
    Start {
        id: TaskId,
        future: BoxFuture<'static, ()>,
        slot: Slot<V>,
    },
    Resume {
        id: TaskId,
        value: V,
    },
}

impl<V> fmt::Debug for TaskEvent<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::Start { id, .. } => write!(f, "Start({})", id),
            TaskEvent::Resume { id, .. } => write!(f, "Resume({})", id),
        }
    }
}

struct LiveTask<V> {
    future: BoxFuture<'static, ()>,
    slot: Slot<V>,
    started_ms: u64,
}

enum Step {
    Suspended,
    Completed,
    Panicked,
}

impl<V> LiveTask<V> {
    fn step(&mut self) -> Step {
        let mut cx = Context::from_waker(noop_waker_ref());
        match catch_unwind(AssertUnwindSafe(|| self.future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => Step::Suspended,
            Ok(Poll::Ready(())) => Step::Completed,
            Err(_) => Step::Panicked,
        }
    }
}

/// Cloneable handle that queues resumptions from any thread.
pub struct Resumer<V> {
    tx: mpsc::UnboundedSender<TaskEvent<V>>,
}

impl<V> Clone for Resumer<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<V> Resumer<V> {
    pub fn resume(&self, id: TaskId, value: V) {
        if self.tx.send(TaskEvent::Resume { id, value }).is_err() {
            warn!("Task table dropped, resumption for task {} lost", id);
        }
    }
}

/// Summary of one [`TaskTable::dispatch_pending`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub started: usize,
    pub resumed: usize,
    pub completed: usize,
    pub failed: usize,
    pub unknown: usize,
}

pub struct TaskTable<V> {
    next_id: TaskId,
    live: HashMap<TaskId, LiveTask<V>>,
    tx: mpsc::UnboundedSender<TaskEvent<V>>,
    rx: mpsc::UnboundedReceiver<TaskEvent<V>>,
}

impl<V> Default for TaskTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for TaskTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTable")
            .field("next_id", &self.next_id)
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<V> TaskTable<V> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            next_id: FIRST_TASK_ID,
            live: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Queues a new task and returns its id. Nothing runs until the next
    /// [`dispatch_pending`](Self::dispatch_pending).
    pub fn start<F, Fut>(&mut self, computation: F) -> TaskId
    where
        F: FnOnce(Suspension<V>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let slot: Slot<V> = Arc::new(Mutex::new(None));
        let future = Box::pin(computation(Suspension { slot: slot.clone() }));
        // The table owns the receiver, so this send cannot fail.
        let _ = self.tx.send(TaskEvent::Start { id, future, slot });
        debug!("Queued task {}", id);
        id
    }

    /// Queues `value` for task `id`.
    pub fn resume(&self, id: TaskId, value: V) {
        let _ = self.tx.send(TaskEvent::Resume { id, value });
    }

    pub fn resumer(&self) -> Resumer<V> {
        Resumer {
            tx: self.tx.clone(),
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drains every queued start and resume event in arrival order.
    ///
    /// A started task is run to its first suspension and then handed its own id. Resumes
    /// for unknown ids are logged and skipped. Tasks that complete or panic leave the table.
    pub fn dispatch_pending(&mut self, now_ms: u64) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        while let Ok(event) = self.rx.try_recv() {
            match event {
                TaskEvent::Start { id, future, slot } => {
                    summary.started += 1;
                    let mut task = LiveTask {
                        future,
                        slot,
                        started_ms: now_ms,
                    };
                    if !Self::settle(id, &mut task, now_ms, &mut summary) {
                        continue;
                    }
                    fill(&task.slot, Resumption::Started(id));
                    if Self::settle(id, &mut task, now_ms, &mut summary) {
                        self.live.insert(id, task);
                    }
                }
                TaskEvent::Resume { id, value } => {
                    let Some(task) = self.live.get_mut(&id) else {
                        summary.unknown += 1;
                        warn!("{}, dropping resumption", TaskError::NotFound(id));
                        continue;
                    };
                    summary.resumed += 1;
                    fill(&task.slot, Resumption::Value(value));
                    if !Self::settle(id, task, now_ms, &mut summary) {
                        self.live.remove(&id);
                    }
                }
            }
        }

        summary
    }

    /// Polls the task once. Returns whether it is still suspended.
    fn settle(
        id: TaskId,
        task: &mut LiveTask<V>,
        now_ms: u64,
        summary: &mut DispatchSummary,
    ) -> bool {
        match task.step() {
            Step::Suspended => true,
            Step::Completed => {
                summary.completed += 1;
                debug!(
                    "Task {} completed after {}ms",
                    id,
                    now_ms.saturating_sub(task.started_ms)
                );
                false
            }
            Step::Panicked => {
                summary.failed += 1;
                error!("Task {} panicked and was removed", id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: String) {
        log.lock().unwrap().push(entry);
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn waiting_task(table: &mut TaskTable<String>, log: &Log) -> TaskId {
        let log = log.clone();
        table.start(move |suspension| async move {
            push(&log, "entered".to_string());
            let id = suspension.own_id().await;
            push(&log, format!("id:{}", id));
            let value = suspension.value().await;
            push(&log, format!("value:{}", value));
        })
    }

    #[test]
    fn test_start_delivers_entry_and_own_id() {
        let mut table = TaskTable::new();
        let log = Log::default();

        let id = waiting_task(&mut table, &log);
        assert_eq!(id, FIRST_TASK_ID);
        assert!(entries(&log).is_empty());
        assert!(!table.contains(id));

        let summary = table.dispatch_pending(0);
        assert_eq!(summary.started, 1);
        assert_eq!(entries(&log), vec!["entered", "id:1000"]);
        assert!(table.contains(id));
    }

    #[test]
    fn test_resume_completes_and_removes() {
        let mut table = TaskTable::new();
        let log = Log::default();
        let id = waiting_task(&mut table, &log);
        table.dispatch_pending(0);

        table.resume(id, "reply".to_string());
        let summary = table.dispatch_pending(5);
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(entries(&log), vec!["entered", "id:1000", "value:reply"]);
        assert!(!table.contains(id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_resume_is_a_noop() {
        let mut table: TaskTable<String> = TaskTable::new();
        table.resume(4242, "lost".to_string());
        let summary = table.dispatch_pending(0);
        assert_eq!(summary.unknown, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table: TaskTable<String> = TaskTable::new();
        let first = table.start(|_| async {});
        table.dispatch_pending(0);
        let second = table.start(|_| async {});
        assert_eq!(first, 1000);
        assert_eq!(second, 1001);
    }

    #[test]
    fn test_task_that_never_suspends() {
        let mut table: TaskTable<String> = TaskTable::new();
        let log = Log::default();
        let inner = log.clone();
        table.start(move |_| async move { push(&inner, "ran".to_string()) });

        let summary = table.dispatch_pending(0);
        assert_eq!(summary.completed, 1);
        assert_eq!(entries(&log), vec!["ran"]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_panicking_task_is_removed() {
        let mut table: TaskTable<String> = TaskTable::new();
        let id = table.start(|suspension| async move {
            let _ = suspension.own_id().await;
            let value = suspension.value().await;
            if value == "bad" {
                panic!("bad value");
            }
        });
        table.dispatch_pending(0);
        assert!(table.contains(id));

        table.resume(id, "bad".to_string());
        let summary = table.dispatch_pending(1);
        assert_eq!(summary.failed, 1);
        assert!(!table.contains(id));
    }

    #[test]
    fn test_resumer_from_another_thread() {
        let mut table = TaskTable::new();
        let log = Log::default();
        let id = waiting_task(&mut table, &log);
        table.dispatch_pending(0);

        let resumer = table.resumer();
        std::thread::spawn(move || resumer.resume(id, "remote".to_string()))
            .join()
            .unwrap();

        table.dispatch_pending(1);
        assert_eq!(entries(&log).last().unwrap(), "value:remote");
    }

    #[test]
    fn test_events_dispatch_in_arrival_order() {
        let mut table = TaskTable::new();
        let log = Log::default();
        let a = waiting_task(&mut table, &log);
        table.resume(a, "first".to_string());
        let b = waiting_task(&mut table, &log);

        table.dispatch_pending(0);
        assert_eq!(
            entries(&log),
            vec!["entered", "id:1000", "value:first", "entered", "id:1001"]
        );
        assert!(!table.contains(a));
        assert!(table.contains(b));
    }
}
