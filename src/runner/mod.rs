//! Timed, cancellable serial task queues.
//!
//! The runner hosts any number of named queues. Each queue runs at most one
//! task at a time, in ready-time order; separate queues run in parallel on
//! the async runtime. The pool's keep-alive cleanup, HTTP/2 and WebSocket
//! ping watchdogs, and call-timeout timers all live here.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// A unit of work that can be scheduled on a [`TaskQueue`].
///
/// `run_once` returns `None` for one-shot tasks, or `Some(delay)` to have
/// the queue run it again after `delay`.
pub trait Task: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run_once(&self) -> Option<Duration>;

    /// Cancelable tasks are dropped by `cancel_all` and `shutdown`.
    fn cancelable(&self) -> bool {
        true
    }
}

/// Wraps a closure as a one-shot or self-requeueing [`Task`].
pub fn task_fn<F>(name: &str, f: F) -> Arc<dyn Task>
where
    F: Fn() -> Option<Duration> + Send + Sync + 'static,
{
    struct FnTask<F> {
        name: String,
        f: F,
    }

    impl<F> Task for FnTask<F>
    where
        F: Fn() -> Option<Duration> + Send + Sync + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        fn run_once(&self) -> Option<Duration> {
            (self.f)()
        }
    }

    Arc::new(FnTask {
        name: name.to_owned(),
        f,
    })
}

/// Shared scheduling backend for a client and its pools.
///
/// Cheap to clone; clones share the same queue namespace counter.
#[derive(Clone)]
pub struct TaskRunner {
    next_queue: Arc<AtomicU64>,
}

impl TaskRunner {
    pub fn new() -> TaskRunner {
        TaskRunner {
            next_queue: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Creates a new serial queue. The `name` shows up in logs only.
    pub fn new_queue(&self, name: &str) -> TaskQueue {
        let n = self.next_queue.fetch_add(1, Ordering::Relaxed);
        TaskQueue {
            inner: Arc::new(QueueInner {
                name: format!("{} Q{}", name, n),
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    active: None,
                    cancel_active: false,
                    shutdown: false,
                    driver_running: false,
                    seq: 0,
                }),
                wake: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }
}

impl Default for TaskRunner {
    fn default() -> TaskRunner {
        TaskRunner::new()
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner").finish()
    }
}

/// A named FIFO of scheduled tasks; at most one runs at any moment.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    wake: Notify,
    idle: Notify,
}

struct QueueState {
    pending: Vec<Scheduled>,
    active: Option<Arc<dyn Task>>,
    cancel_active: bool,
    shutdown: bool,
    driver_running: bool,
    seq: u64,
}

struct Scheduled {
    task: Arc<dyn Task>,
    ready_at: Instant,
    seq: u64,
}

impl TaskQueue {
    /// Schedules `task` to run no sooner than `delay` from now.
    ///
    /// If the same task (by identity) is already pending, the earlier of the
    /// two ready times wins.
    ///
    /// # Panics
    ///
    /// Panics if the queue is shut down and the task is not cancelable.
    /// Cancelable tasks submitted after shutdown are silently dropped.
    pub fn schedule(&self, task: Arc<dyn Task>, delay: Duration) {
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                if !task.cancelable() {
                    panic!("queue {} is shut down", self.inner.name);
                }
                trace!("{}: dropping {:?} after shutdown", self.inner.name, task.name());
                return;
            }
            if let Some(existing) = state
                .pending
                .iter_mut()
                .find(|s| Arc::ptr_eq(&s.task, &task))
            {
                if ready_at < existing.ready_at {
                    existing.ready_at = ready_at;
                }
            } else {
                let seq = state.seq;
                state.seq += 1;
                trace!(
                    "{}: scheduled {:?} (+{:?})",
                    self.inner.name,
                    task.name(),
                    delay
                );
                state.pending.push(Scheduled {
                    task,
                    ready_at,
                    seq,
                });
            }
            if !state.driver_running {
                state.driver_running = true;
                let inner = self.inner.clone();
                tokio::spawn(async move { drive(inner).await });
            }
        }
        self.inner.wake.notify_one();
    }

    /// Drops every pending cancelable task and flags the active one for
    /// cancellation when it completes.
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.cancel_locked(&mut state);
        drop(state);
        self.inner.wake.notify_one();
    }

    /// As [`cancel_all`](TaskQueue::cancel_all), plus rejects future
    /// submissions.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shutdown = true;
        self.cancel_locked(&mut state);
        drop(state);
        self.inner.wake.notify_one();
    }

    fn cancel_locked(&self, state: &mut QueueState) {
        state.pending.retain(|s| !s.task.cancelable());
        if state.active.is_some() {
            state.cancel_active = true;
        }
    }

    /// Resolves once the queue has no active or pending task.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock().unwrap();
                if state.pending.is_empty() && state.active.is_none() {
                    return;
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .finish()
    }
}

enum Step {
    Run(Arc<dyn Task>),
    Sleep(Instant),
    Wait,
    Exit,
}

async fn drive(inner: Arc<QueueInner>) {
    loop {
        let step = {
            let mut state = inner.state.lock().unwrap();
            // FIFO by ready time; ties broken by insertion order.
            let now = Instant::now();
            let next = state
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| (s.ready_at, s.seq))
                .map(|(i, s)| (i, s.ready_at));
            match next {
                Some((i, ready_at)) if ready_at <= now => {
                    let scheduled = state.pending.swap_remove(i);
                    state.active = Some(scheduled.task.clone());
                    Step::Run(scheduled.task)
                }
                Some((_, ready_at)) => Step::Sleep(ready_at),
                None if state.shutdown => {
                    state.driver_running = false;
                    Step::Exit
                }
                None => Step::Wait,
            }
        };

        match step {
            Step::Run(task) => {
                trace!("{}: run {:?}", inner.name, task.name());
                let next_delay = task.run_once();
                let requeue = {
                    let mut state = inner.state.lock().unwrap();
                    state.active = None;
                    let canceled = std::mem::replace(&mut state.cancel_active, false);
                    match next_delay {
                        Some(delay) if !canceled && !state.shutdown => Some(delay),
                        _ => None,
                    }
                };
                match requeue {
                    Some(delay) => {
                        let ready_at = Instant::now() + delay;
                        let mut state = inner.state.lock().unwrap();
                        // The task may have been re-scheduled while it was
                        // running; earliest time wins, same as schedule().
                        if let Some(existing) = state
                            .pending
                            .iter_mut()
                            .find(|s| Arc::ptr_eq(&s.task, &task))
                        {
                            if ready_at < existing.ready_at {
                                existing.ready_at = ready_at;
                            }
                        } else {
                            let seq = state.seq;
                            state.seq += 1;
                            state.pending.push(Scheduled {
                                task,
                                ready_at,
                                seq,
                            });
                        }
                    }
                    None => {
                        let state = inner.state.lock().unwrap();
                        if state.pending.is_empty() {
                            inner.idle.notify_waiters();
                        }
                    }
                }
            }
            Step::Sleep(ready_at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            Step::Wait => {
                inner.idle.notify_waiters();
                inner.wake.notified().await;
            }
            Step::Exit => {
                inner.idle.notify_waiters();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> TaskRunner {
        TaskRunner::new()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_ready_time_order() {
        let queue = runner().new_queue("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, delay_ms) in &[("c", 300u64), ("a", 100), ("b", 200)] {
            let log = log.clone();
            let name = *name;
            queue.schedule(
                task_fn(name, move || {
                    log.lock().unwrap().push(name);
                    None
                }),
                Duration::from_millis(*delay_ms),
            );
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        queue.idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_keeps_earliest_time() {
        let queue = runner().new_queue("test");
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = ran.clone();
            task_fn("tick", move || {
                ran.fetch_add(1, Ordering::SeqCst);
                None
            })
        };

        queue.schedule(task.clone(), Duration::from_millis(500));
        queue.schedule(task.clone(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        // Deduped: the second schedule moved the task earlier, it did not
        // enqueue a second run.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_can_requeue_itself() {
        let queue = runner().new_queue("test");
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            queue.schedule(
                task_fn("tick", move || {
                    if ran.fetch_add(1, Ordering::SeqCst) < 2 {
                        Some(Duration::from_millis(10))
                    } else {
                        None
                    }
                }),
                Duration::ZERO,
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_drops_pending() {
        let queue = runner().new_queue("test");
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            queue.schedule(
                task_fn("later", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    None
                }),
                Duration::from_secs(10),
            );
        }

        assert_eq!(queue.pending_len(), 1);
        queue.cancel_all();
        assert_eq!(queue.pending_len(), 0);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_new_cancelable_tasks() {
        let queue = runner().new_queue("test");
        queue.shutdown();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            queue.schedule(
                task_fn("late", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    None
                }),
                Duration::ZERO,
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_waits_for_active_and_pending() {
        let queue = runner().new_queue("test");
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            queue.schedule(
                task_fn("work", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    None
                }),
                Duration::from_millis(20),
            );
        }
        queue.idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
