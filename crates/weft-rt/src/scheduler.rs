//! Worker-thread pool and ready queue.
//!
//! [`Scheduler`] owns the shared state: a FIFO queue of ready fibers behind
//! one mutex, the worker handles, and the active/idle/stop bookkeeping.
//! [`Schedule`] is the capability layer over it: `tickle`, `stopping`,
//! `idle` and `on_worker_start` have pool defaults here and epoll-aware
//! overrides in the reactor, while `start`/`stop`/`spawn`/`schedule` are
//! provided once for every implementation.
//!
//! Each worker runs fibers from the shared queue until it is empty, then
//! resumes its private idle fiber. The idle fiber yielding returns the
//! worker to the queue; the idle fiber finishing ends the worker.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::fiber::{Fiber, FiberState};

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Shared scheduler state: ready queue, worker pool and counters.
pub struct Scheduler {
    name: String,
    threads: usize,
    ready: Mutex<VecDeque<Arc<Fiber>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
}

impl Scheduler {
    pub fn new(threads: usize, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one worker");
        Scheduler {
            name: name.to_string(),
            threads,
            ready: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }

    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers() > 0
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn auto_stop(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.auto_stop.store(true, Ordering::SeqCst);
    }

    /// Stop condition of the bare pool: a stop was requested, the queue is
    /// drained, and no worker is mid-resume.
    pub fn base_stopping(&self) -> bool {
        self.stop_requested() && self.ready.lock().is_empty() && self.active_workers() == 0
    }

    /// Enqueue a fiber; reports whether the queue was empty before.
    fn push_ready(&self, fiber: Arc<Fiber>) -> bool {
        let mut ready = self.ready.lock();
        let was_empty = ready.is_empty();
        ready.push_back(fiber);
        was_empty
    }

    /// Dequeue the next runnable fiber, counting the caller as active.
    ///
    /// A continuation can re-enqueue a fiber in the window between arming an
    /// event and yielding; such a fiber is still `Running` on another worker
    /// and is skipped until it has actually suspended.
    fn take_ready(&self) -> Option<Arc<Fiber>> {
        let mut ready = self.ready.lock();
        let pos = ready
            .iter()
            .position(|f| f.state() != FiberState::Running)?;
        let fiber = ready.remove(pos);
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        fiber
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("active_workers", &self.active_workers())
            .field("idle_workers", &self.idle_workers())
            .field("stopping", &self.stop_requested())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Capability layer over a [`Scheduler`] core.
pub trait Schedule: Send + Sync + Sized + 'static {
    fn core(&self) -> &Scheduler;

    /// Wake an idle worker. The bare pool has no blocking wait to interrupt.
    fn tickle(&self) {}

    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Body of each worker's idle fiber.
    fn idle(&self) {
        while !self.stopping() {
            thread::sleep(Duration::from_millis(1));
            Fiber::yield_now();
        }
    }

    /// Per-worker setup, run before the first fiber.
    fn on_worker_start(&self) {}

    /// Launch the worker pool. A second call, or a call after `stop`, does
    /// nothing. Takes one `Arc` clone: `Arc::clone(&pool).start()`.
    fn start(self: Arc<Self>) {
        let core = self.core();
        if core.stop_requested() {
            return;
        }
        let mut workers = core.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for i in 0..core.threads {
            let this = Arc::clone(&self);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", core.name, i))
                .spawn(move || worker_main(this))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        log::debug!("scheduler {} started {} workers", core.name, core.threads);
    }

    /// Request a stop and join the workers. Returns once every worker has
    /// drained and exited; must not be called from a fiber of this pool.
    fn stop(&self) {
        let core = self.core();
        core.request_stop();
        for _ in 0..core.threads {
            self.tickle();
        }
        let handles: Vec<_> = core.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        log::debug!("scheduler {} stopped", core.name);
    }

    /// Wrap `f` in a fiber and enqueue it.
    fn spawn(&self, f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        let fiber = Fiber::new(f);
        self.schedule(Arc::clone(&fiber));
        fiber
    }

    /// Like [`Schedule::spawn`] with an explicit stack size.
    fn spawn_with_stack(
        &self,
        f: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> Arc<Fiber> {
        let fiber = Fiber::with_stack(f, stack_size);
        self.schedule(Arc::clone(&fiber));
        fiber
    }

    /// Enqueue an existing fiber, tickling on the empty-to-nonempty edge.
    fn schedule(&self, fiber: Arc<Fiber>) {
        if self.core().push_ready(fiber) {
            self.tickle();
        }
    }
}

/// The bare pool is a complete implementation on its own.
impl Schedule for Scheduler {
    fn core(&self) -> &Scheduler {
        self
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_main<S: Schedule>(sched: Arc<S>) {
    sched.on_worker_start();
    let core = sched.core();
    log::debug!("worker {:?} running", thread::current().name());

    let idle = Fiber::new({
        let this = Arc::clone(&sched);
        move || this.idle()
    });

    loop {
        // Drain the ready queue before touching the idle fiber; the reactor
        // idle blocks in epoll_wait and must not sit on runnable work.
        if let Some(fiber) = core.take_ready() {
            if fiber.state().is_terminal() {
                core.active_workers.fetch_sub(1, Ordering::SeqCst);
            } else {
                fiber.resume();
                core.active_workers.fetch_sub(1, Ordering::SeqCst);
                match fiber.state() {
                    FiberState::Ready => sched.schedule(fiber),
                    FiberState::Done | FiberState::Failed => {}
                    _ => fiber.set_state(FiberState::Suspended),
                }
            }
            continue;
        }

        match idle.state() {
            FiberState::Done => break,
            FiberState::Failed => {
                log::error!("worker {:?} idle fiber failed", thread::current().name());
                break;
            }
            _ => {}
        }

        core.idle_workers.fetch_add(1, Ordering::SeqCst);
        idle.resume();
        core.idle_workers.fetch_sub(1, Ordering::SeqCst);
        if !idle.state().is_terminal() {
            idle.set_state(FiberState::Suspended);
        }
    }
    log::debug!("worker {:?} exiting", thread::current().name());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
