//! Stackful fibers, the unit of cooperative execution.
//!
//! A [`Fiber`] wraps a corosensei coroutine with a privately owned,
//! page-aligned stack. A worker thread drives a fiber with [`Fiber::resume`];
//! the running fiber gives the thread back with [`Fiber::yield_now`] or by
//! returning from its entry function. A suspended fiber may later be resumed
//! by a different worker thread.
//!
//! The "host" side of every switch is the resuming worker thread's native
//! context: it owns no separate stack and is always running from that
//! worker's point of view.
//!
//! ## Thread-local state
//!
//! - `CURRENT_FIBER`: the fiber currently executing on this thread, set
//!   around [`Fiber::resume`]. `None` means the thread is in host context.
//! - `CURRENT_YIELDER`: pointer to the running coroutine's `Yielder`,
//!   installed by the entry trampoline and re-installed after every suspend
//!   (the fiber may have been migrated to another thread in between).

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};
use parking_lot::Mutex;

/// Default stack size for a fiber.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack handed to a coroutine, regardless of what was requested.
const MIN_STACK_SIZE: usize = 16 * 1024;

const PAGE_SIZE: usize = 4096;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    // Valid only while a coroutine body on this thread is between its entry
    // and its final return. Stored type-erased; the Yielder is borrowed from
    // inside the coroutine body and outlives every suspension of it.
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

fn round_stack_size(requested: usize) -> usize {
    requested.max(MIN_STACK_SIZE).next_multiple_of(PAGE_SIZE)
}

// ---------------------------------------------------------------------------
// FiberState
// ---------------------------------------------------------------------------

/// Execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Entry function installed, never resumed (or freshly reset).
    Init = 0,
    /// Marked runnable; the owner should hand it back to a ready queue.
    Ready = 1,
    /// Executing on exactly one worker thread.
    Running = 2,
    /// Yielded mid-execution; waiting to be resumed.
    Suspended = 3,
    /// Entry function returned.
    Done = 4,
    /// Entry function panicked.
    Failed = 5,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Suspended,
            4 => FiberState::Done,
            _ => FiberState::Failed,
        }
    }

    /// Terminal states; only `reset` leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Done | FiberState::Failed)
    }
}

// ---------------------------------------------------------------------------
// Fiber
// ---------------------------------------------------------------------------

type FiberCoro = Coroutine<(), (), ()>;

/// A stackful fiber.
///
/// Fibers are shared through `Arc`; whoever holds the last strong reference
/// after the fiber reaches a terminal state releases the stack with it.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    state: AtomicU8,
    coro: Mutex<Option<FiberCoro>>,
    weak_self: Weak<Fiber>,
}

// Safety: the entry closure is required to be `Send + 'static`, and the
// coroutine is only ever driven while `coro` is locked, so at most one
// thread executes or mutates it at a time. Between resumes the coroutine is
// inert saved state and may move or be observed from any thread.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        Fiber::with_stack(f, DEFAULT_STACK_SIZE)
    }

    /// Create a fiber with an explicit stack size. The size is rounded up to
    /// the page size and clamped to the minimum.
    pub fn with_stack(f: impl FnOnce() + Send + 'static, stack_size: usize) -> Arc<Fiber> {
        let stack_size = round_stack_size(stack_size);
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id,
            stack_size,
            state: AtomicU8::new(FiberState::Init as u8),
            coro: Mutex::new(Some(make_coroutine(f, stack_size))),
            weak_self: weak.clone(),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        log::trace!("fiber {} created, stack {} bytes", id, stack_size);
        fiber
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Re-arm an exhausted fiber with a new entry function, keeping its id
    /// and configured stack size.
    ///
    /// # Panics
    ///
    /// Panics unless the state is `Init`, `Done` or `Failed`.
    pub fn reset(&self, f: impl FnOnce() + Send + 'static) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Done | FiberState::Failed),
            "reset on fiber {} in state {:?}",
            self.id,
            state
        );
        let mut slot = self.coro.lock();
        *slot = Some(make_coroutine(f, self.stack_size));
        self.set_state(FiberState::Init);
    }

    /// Switch the calling worker thread into this fiber. Returns when the
    /// fiber yields or finishes.
    ///
    /// # Panics
    ///
    /// Panics unless the state is `Init`, `Ready` or `Suspended`.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Ready | FiberState::Suspended),
            "resume on fiber {} in state {:?}",
            self.id,
            state
        );
        let mut slot = self.coro.lock();
        let coro = slot.as_mut().expect("fiber has no coroutine");
        self.set_state(FiberState::Running);
        let me = self
            .weak_self
            .upgrade()
            .expect("fiber resumed without a strong reference");
        let parent = CURRENT_FIBER.with(|c| c.replace(Some(me)));
        let parent_yielder = CURRENT_YIELDER.with(|c| c.get());
        let _ = coro.resume(());
        CURRENT_FIBER.with(|c| *c.borrow_mut() = parent);
        CURRENT_YIELDER.with(|c| c.set(parent_yielder));
    }

    /// Suspend the current fiber, switching back to the worker's host
    /// context. The state is left for the resumer's bookkeeping.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn yield_now() {
        let ptr = CURRENT_YIELDER
            .with(|c| c.get())
            .expect("yield_now called outside a fiber");
        // Safety: the pointer was installed by the coroutine body currently
        // executing on this thread and stays valid across its suspensions.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        // Possibly resumed on a different thread: re-install there.
        CURRENT_YIELDER.with(|c| c.set(Some(ptr)));
    }

    /// Suspend the current fiber after marking it `Ready`, so the worker
    /// loop hands it straight back to the ready queue.
    pub fn yield_ready() {
        let fiber = Fiber::current().expect("yield_ready called outside a fiber");
        fiber.set_state(FiberState::Ready);
        Fiber::yield_now();
    }

    /// The fiber currently running on this thread, if any.
    pub fn current() -> Option<Arc<Fiber>> {
        CURRENT_FIBER.with(|c| c.borrow().clone())
    }

    /// Id of the current fiber, or 0 in host context.
    pub fn current_id() -> u64 {
        Fiber::current().map_or(0, |f| f.id)
    }

    /// Number of live fibers in the process.
    pub fn count() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Build the underlying coroutine: allocate the stack and wrap the entry in
/// the trampoline that records completion or failure on the fiber.
fn make_coroutine(f: impl FnOnce() + Send + 'static, stack_size: usize) -> FiberCoro {
    let stack = DefaultStack::new(stack_size).expect("failed to allocate fiber stack");
    Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
        CURRENT_YIELDER.with(|c| c.set(Some(yielder as *const Yielder<(), ()> as *const ())));
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        let fiber = CURRENT_FIBER.with(|c| c.borrow().clone());
        match result {
            Ok(()) => {
                if let Some(fiber) = &fiber {
                    fiber.set_state(FiberState::Done);
                }
            }
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                if let Some(fiber) = &fiber {
                    fiber.set_state(FiberState::Failed);
                    log::error!("fiber {} panicked: {}", fiber.id, msg);
                } else {
                    log::error!("detached fiber panicked: {}", msg);
                }
            }
        }
        // Returning performs the final switch back to the host.
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
