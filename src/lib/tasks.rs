/*!
Typed task dispatch.

A task is a kind, a JSON payload and options (group key, retry policy).
Handlers are registered per kind. Dispatch is asynchronous over a bounded
queue served by a fixed worker pool; retryable failures back off
exponentially, group keys suppress duplicates while a task is pending or
executing, and schedulers re-enqueue periodic work.
*/

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::utils::prelude::*;

/// Retry and dedup options for a task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub group_key: Option<String>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            group_key: None,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// A unit of routed work.
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: String,
    pub payload: Value,
    pub options: TaskOptions,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            options: TaskOptions::default(),
        }
    }

    pub fn group_key(mut self, key: impl Into<String>) -> Self {
        self.options.group_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.options.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.options.backoff_base = base;
        self
    }
}

/// Handler failure classification.
#[derive(Debug)]
pub enum TaskError {
    /// Consumes an attempt and backs off.
    Retryable(anyhow::Error),
    /// Logged and dropped.
    Permanent(anyhow::Error),
}

impl TaskError {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }
}

pub type TaskResult = Result<(), TaskError>;

/// Dispatch failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A task with the same group key is pending or executing.
    #[error("duplicate task")]
    Duplicate,
    #[error("task queue is full")]
    QueueFull,
    #[error("router is closed")]
    Closed,
}

/// Execution context passed to handlers.
pub struct TaskContext {
    pub payload: Value,
    pub attempt: u32,
    shutdown: watch::Receiver<bool>,
}

impl TaskContext {
    /// Long-running handlers should bail out between units of work.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}

type Handler = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, TaskResult> + Send + Sync>;

struct RouterInner {
    handlers: RwLock<HashMap<String, Handler>>,
    groups: Mutex<HashSet<String>>,
    closed: AtomicBool,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Clone)]
struct Shared {
    tx: mpsc::Sender<Task>,
    inner: Arc<RouterInner>,
}

impl Shared {
    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }

        // Claim the group key before queueing so a concurrent dispatch with
        // the same key sees the duplicate.
        if let Some(key) = &task.options.group_key {
            let mut groups = self.inner.groups.lock();
            if !groups.insert(key.clone()) {
                return Err(DispatchError::Duplicate);
            }
        }

        let group_key = task.options.group_key.clone();
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(key) = &group_key {
                    self.inner.groups.lock().remove(key);
                }
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(DispatchError::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(DispatchError::Closed),
                }
            },
        }
    }
}

/// Cancel handle for a scheduled task. Dropping it also cancels.
pub struct ScheduleHandle {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduleHandle {
    pub fn cancel(self) {
        let _ = self.cancel.send(true);
        self.handle.abort();
    }
}

/// Typed task router with a fixed worker pool.
pub struct TaskRouter {
    shared: Shared,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_SIZE: usize = 256;

impl TaskRouter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WORKERS, DEFAULT_QUEUE_SIZE)
    }

    pub fn with_capacity(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(RouterInner {
            handlers: RwLock::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown_rx: shutdown_rx.clone(),
        });

        let shared = Shared { tx, inner: Arc::clone(&inner) };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|index| {
                let rx = Arc::clone(&rx);
                let inner = Arc::clone(&inner);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(worker_loop(index, rx, inner, shutdown))
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
            shutdown_tx,
        }
    }

    /// Register the handler for a task kind, replacing any existing one.
    pub fn register<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.shared.inner.handlers.write().insert(kind.into(), handler);
    }

    /// Enqueue a task. Returns immediately.
    pub fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        self.shared.dispatch(task)
    }

    /// Re-enqueue `task` every `period`. First fire is one period from now.
    pub fn schedule_every(&self, period: Duration, task: Task) -> ScheduleHandle {
        let shared = self.shared.clone();
        let mut shutdown = self.shared.inner.shutdown_rx.clone();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match shared.dispatch(task.clone()) {
                            Ok(()) => {},
                            Err(DispatchError::Duplicate) => {
                                debug!("Scheduled task '{}' still in flight", task.kind);
                            },
                            Err(DispatchError::Closed) => break,
                            Err(e) => warn!("Scheduled task '{}' dropped: {e}", task.kind),
                        }
                    },
                    _ = cancel_rx.changed() => break,
                    _ = shutdown.changed() => break,
                }
            }
        });

        ScheduleHandle { cancel: cancel_tx, handle }
    }

    /// Fire `task` daily at `hour:minute` UTC, re-arming after each fire.
    pub fn schedule_daily_at_utc(&self, hour: u32, minute: u32, task: Task) -> ScheduleHandle {
        let shared = self.shared.clone();
        let mut shutdown = self.shared.inner.shutdown_rx.clone();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = next_daily_fire(now, hour, minute);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = time::sleep(wait) => {
                        match shared.dispatch(task.clone()) {
                            Ok(()) => {},
                            Err(DispatchError::Duplicate) => {
                                debug!("Daily task '{}' still in flight", task.kind);
                            },
                            Err(DispatchError::Closed) => break,
                            Err(e) => warn!("Daily task '{}' dropped: {e}", task.kind),
                        }
                    },
                    _ = cancel_rx.changed() => break,
                    _ = shutdown.changed() => break,
                }
            }
        });

        ScheduleHandle { cancel: cancel_tx, handle }
    }

    /// Stop accepting work, drain queued tasks (bounded) and join workers.
    pub async fn close(&self) {
        self.shared.inner.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Task worker did not drain in time");
            }
        }
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    inner: Arc<RouterInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    enum Next {
        Run(Task),
        Drain,
        Quit,
    }

    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                task = rx.recv() => task.map_or(Next::Quit, Next::Run),
                _ = shutdown.changed() => Next::Drain,
            }
        };

        match next {
            Next::Run(task) => run_task(&inner, &shutdown, task).await,
            Next::Drain => {
                // Process what is already queued, then exit.
                loop {
                    let task = rx.lock().await.try_recv();
                    match task {
                        Ok(task) => run_task(&inner, &shutdown, task).await,
                        Err(_) => break,
                    }
                }
                break;
            },
            Next::Quit => break,
        }
    }

    trace!("Task worker {index} stopped");
}

async fn run_task(inner: &Arc<RouterInner>, shutdown: &watch::Receiver<bool>, task: Task) {
    let handler = inner.handlers.read().get(&task.kind).cloned();

    if let Some(handler) = handler {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = TaskContext {
                payload: task.payload.clone(),
                attempt,
                shutdown: shutdown.clone(),
            };

            match handler(ctx).await {
                Ok(()) => break,
                Err(TaskError::Permanent(e)) => {
                    warn!("Task '{}' failed permanently: {}", task.kind, e.oneliner());
                    break;
                },
                Err(TaskError::Retryable(e)) => {
                    if attempt >= task.options.max_attempts {
                        warn!(
                            "Task '{}' gave up after {attempt} attempts: {}",
                            task.kind,
                            e.oneliner()
                        );
                        break;
                    }
                    let delay = backoff_delay(task.options.backoff_base, attempt);
                    info!(
                        "Task '{}' attempt {attempt} failed, retrying in {delay:?}: {}",
                        task.kind,
                        e.oneliner()
                    );
                    time::sleep(delay).await;
                },
            }
        }
    } else {
        warn!("No handler registered for task kind '{}'", task.kind);
    }

    // The group key is held across retries and released only here.
    if let Some(key) = &task.options.group_key {
        inner.groups.lock().remove(key);
    }
}

/// Exponential backoff with up to 25% jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    exp + exp.mul_f64(jitter)
}

/// Next `hour:minute` UTC instant strictly after `now`.
fn next_daily_fire(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let today = now
        .with_hour(hour)
        .and_then(|at| at.with_minute(minute))
        .and_then(|at| at.with_second(0))
        .and_then(|at| at.with_nanosecond(0))
        .unwrap_or(now);

    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::TimeZone;

    use super::*;

    fn noop_payload() -> Value {
        Value::Null
    }

    #[tokio::test]
    async fn dispatch_runs_registered_handler() {
        let router = TaskRouter::with_capacity(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        router.register("test.run", move |_ctx| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        router.dispatch(Task::new("test.run", noop_payload())).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        router.close().await;
    }

    #[tokio::test]
    async fn duplicate_group_keys_are_suppressed() {
        let router = TaskRouter::with_capacity(1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        router.register("test.slow", move |_ctx| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        });

        let task = || Task::new("test.slow", noop_payload()).group_key("g");
        router.dispatch(task()).unwrap();
        // Second dispatch while the first is pending or executing.
        assert_eq!(router.dispatch(task()), Err(DispatchError::Duplicate));

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Key released after completion.
        router.dispatch(task()).unwrap();
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        router.close().await;
    }

    #[tokio::test]
    async fn retryable_errors_consume_attempts() {
        let router = TaskRouter::with_capacity(1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        router.register("test.retry", move |_ctx| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::retryable(anyhow::anyhow!("nope")))
            }
        });

        let task = Task::new("test.retry", noop_payload())
            .max_attempts(3)
            .backoff_base(Duration::from_millis(1));
        router.dispatch(task).unwrap();

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        router.close().await;
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let router = TaskRouter::with_capacity(1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        router.register("test.perm", move |_ctx| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::permanent(anyhow::anyhow!("no")))
            }
        });

        router
            .dispatch(Task::new("test.perm", noop_payload()).max_attempts(5))
            .unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        router.close().await;
    }

    #[tokio::test]
    async fn close_refuses_new_dispatches() {
        let router = TaskRouter::with_capacity(1, 16);
        router.close().await;

        assert_eq!(
            router.dispatch(Task::new("test.closed", noop_payload())),
            Err(DispatchError::Closed)
        );
    }

    #[tokio::test]
    async fn schedule_every_re_enqueues() {
        let router = TaskRouter::with_capacity(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        router.register("test.tick", move |_ctx| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handle = router.schedule_every(
            Duration::from_millis(20),
            Task::new("test.tick", noop_payload()),
        );
        time::sleep(Duration::from_millis(110)).await;
        handle.cancel();

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected at least 2 fires, got {fired}");

        // Let any in-flight dispatch settle before checking that the
        // schedule is really gone.
        time::sleep(Duration::from_millis(30)).await;
        let after = counter.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);

        router.close().await;
    }

    #[test]
    fn daily_fire_is_next_utc_occurrence() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 2, 0, 0).unwrap();
        assert_eq!(
            next_daily_fire(now, 3, 0),
            Utc.with_ymd_and_hms(2024, 5, 10, 3, 0, 0).unwrap()
        );

        let now = Utc.with_ymd_and_hms(2024, 5, 10, 3, 0, 0).unwrap();
        assert_eq!(
            next_daily_fire(now, 3, 0),
            Utc.with_ymd_and_hms(2024, 5, 11, 3, 0, 0).unwrap()
        );

        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(
            next_daily_fire(now, 3, 30),
            Utc.with_ymd_and_hms(2025, 1, 1, 3, 30, 0).unwrap()
        );
    }

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        let first = backoff_delay(base, 1);
        let third = backoff_delay(base, 3);

        assert!(first >= base && first <= base.mul_f64(1.25));
        assert!(third >= base * 4 && third <= (base * 4).mul_f64(1.25));
    }
}
