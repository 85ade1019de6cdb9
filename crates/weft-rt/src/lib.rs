//! Weft runtime: M:N stackful coroutines with transparent blocking I/O.
//!
//! A fixed pool of worker threads multiplexes an unbounded population of
//! [`Fiber`]s. Blocking-looking socket calls are interposed at the libc
//! symbol level: a call that would block instead suspends the calling fiber,
//! registers the fd with an edge-triggered epoll [`Reactor`], and resumes
//! the fiber when the kernel reports readiness or a timeout fires.
//!
//! ## Modules
//!
//! - [`fiber`]: stackful coroutine primitive (save/restore, reset, yield)
//! - [`timer`]: deadline heap with cancellation, refresh and conditional fire
//! - [`fd`]: per-fd metadata (socket probe, forced nonblock, timeouts)
//! - [`scheduler`]: worker pool + FIFO ready queue, [`Schedule`] capability trait
//! - [`reactor`]: epoll loop, per-fd event registry, timer integration
//! - [`hook`]: interposed POSIX symbols and the suspend-and-retry template
//!
//! ## Example
//!
//! ```no_run
//! use weft_rt::{Reactor, Schedule};
//!
//! let reactor = Reactor::new(2, "app");
//! reactor.spawn(|| {
//!     // Blocking-looking I/O inside a fiber suspends instead of blocking:
//!     // accept/recv/send on sockets created here park this fiber and let
//!     // the worker run others.
//!     Reactor::current().unwrap().sleep_ms(10);
//! });
//! reactor.stop();
//! ```
//!
//! Interposition is per-thread and off by default; only reactor workers run
//! with hooks enabled. Code on other threads sees unmodified syscalls. When
//! built as a cdylib the same symbols interpose via `LD_PRELOAD`.

pub mod fd;
pub mod fiber;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use fiber::{Fiber, FiberState, DEFAULT_STACK_SIZE};
pub use reactor::{Continuation, IoEvent, Reactor};
pub use scheduler::{Schedule, Scheduler};
pub use timer::{now_ms, Timer, TimerQueue};
