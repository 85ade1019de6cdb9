//! Epoll-driven reactor: the scheduler specialized with readiness events
//! and timers.
//!
//! The reactor owns an epoll instance, a self-pipe for cross-thread wakeups,
//! an fd-indexed registry of armed directions, and a [`TimerQueue`]. Worker
//! idle fibers replace the bare pool's sleep loop with `epoll_wait`; when
//! the kernel reports readiness (or a timer expires) the stored continuation
//! is handed back to the ready queue and the armed direction is cleared.
//!
//! All registrations are edge triggered. The syscall shim re-issues the real
//! call until `EAGAIN` after every wakeup, which keeps the kernel's and the
//! registry's view of each fd in step.
//!
//! ```text
//! fiber calls recv -- EAGAIN --> add_event(fd, READ) --> yield
//!                                      |
//! epoll_wait (idle fiber) <- readiness +
//!        |
//!        +-> clear slot, requeue fiber -> worker resumes it -> recv retried
//! ```

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use libc::c_int;
use parking_lot::{Mutex, RwLock};

use crate::fiber::Fiber;
use crate::hook;
use crate::scheduler::{Schedule, Scheduler};
use crate::timer::{TimerCallback, TimerQueue};

/// Upper bound on events drained per `epoll_wait`.
const MAX_EVENTS: usize = 256;

/// Longest a worker sleeps in `epoll_wait` with nothing scheduled.
const MAX_IDLE_TIMEOUT_MS: u64 = 10_000;

const INITIAL_FD_CONTEXTS: usize = 32;

bitflags! {
    /// I/O directions a continuation can wait for. The bit values are the
    /// matching epoll event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvent: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<Reactor>>> = const { RefCell::new(None) };
}

// ---------------------------------------------------------------------------
// FdContext
// ---------------------------------------------------------------------------

/// What gets resumed when an armed direction triggers.
pub enum Continuation {
    /// A suspended fiber, rescheduled as-is. The slot holds the strong
    /// reference that keeps it alive while it waits.
    Fiber(Arc<Fiber>),
    /// A callback, wrapped in a fresh fiber when fired.
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct FdSlots {
    armed: IoEvent,
    read: Option<Continuation>,
    write: Option<Continuation>,
}

impl Default for FdSlots {
    fn default() -> Self {
        FdSlots {
            armed: IoEvent::empty(),
            read: None,
            write: None,
        }
    }
}

impl FdSlots {
    fn slot_mut(&mut self, ev: IoEvent) -> &mut Option<Continuation> {
        if ev == IoEvent::READ {
            &mut self.read
        } else if ev == IoEvent::WRITE {
            &mut self.write
        } else {
            unreachable!("slot lookup with a compound event mask")
        }
    }
}

/// Per-fd registry entry: the armed directions and their continuations.
pub struct FdContext {
    fd: c_int,
    slots: Mutex<FdSlots>,
}

impl FdContext {
    fn new(fd: c_int) -> FdContext {
        FdContext {
            fd,
            slots: Mutex::new(FdSlots::default()),
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn armed(&self) -> IoEvent {
        self.slots.lock().armed
    }
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

/// Scheduler with an epoll readiness loop, per-fd event registry and timers.
pub struct Reactor {
    core: Scheduler,
    epoll_fd: c_int,
    tickle_fds: [c_int; 2],
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    pending_events: AtomicUsize,
    timers: Arc<TimerQueue>,
    weak_self: Weak<Reactor>,
}

impl Reactor {
    /// Open the epoll instance and self-pipe, resolve the real libc entry
    /// points, and start `threads` workers.
    ///
    /// # Panics
    ///
    /// Panics when the epoll instance or pipe cannot be created.
    pub fn new(threads: usize, name: &str) -> Arc<Reactor> {
        hook::init();

        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            epoll_fd >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );

        let mut pipe_fds = [0 as c_int; 2];
        let rt = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert!(rt == 0, "pipe2 failed: {}", io::Error::last_os_error());

        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLIN as u32 | libc::EPOLLET as u32;
        ev.u64 = pipe_fds[0] as u64;
        let rt = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        assert!(
            rt == 0,
            "registering tickle pipe failed: {}",
            io::Error::last_os_error()
        );

        let mut contexts = Vec::new();
        contexts.resize_with(INITIAL_FD_CONTEXTS, || None);

        let reactor = Arc::new_cyclic(|weak| Reactor {
            core: Scheduler::new(threads, name),
            epoll_fd,
            tickle_fds: pipe_fds,
            fd_contexts: RwLock::new(contexts),
            pending_events: AtomicUsize::new(0),
            timers: TimerQueue::new(),
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&reactor);
        reactor.timers.set_wake_hook(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.tickle();
            }
        }));

        Arc::clone(&reactor).start();
        reactor
    }

    /// The reactor whose worker thread we are on, if any.
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    /// Number of armed (fd, direction) pairs.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Park the current fiber for `ms` milliseconds.
    pub fn sleep_ms(&self, ms: u64) {
        let fiber = Fiber::current().expect("sleep_ms called outside a fiber");
        let weak = self.weak_self.clone();
        self.timers.add_timer(
            ms,
            move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.schedule(Arc::clone(&fiber));
                }
            },
            false,
        );
        Fiber::yield_now();
    }

    fn context(&self, fd: c_int, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let contexts = self.fd_contexts.read();
            if let Some(Some(ctx)) = contexts.get(idx) {
                return Some(Arc::clone(ctx));
            }
        }
        if !create {
            return None;
        }
        let mut contexts = self.fd_contexts.write();
        if idx >= contexts.len() {
            contexts.resize_with((idx + 1).max(idx * 3 / 2), || None);
        }
        let ctx = contexts[idx].get_or_insert_with(|| Arc::new(FdContext::new(fd)));
        Some(Arc::clone(ctx))
    }

    /// Arm `ev` on `fd` with a continuation; `None` arms the current fiber.
    ///
    /// Fails when the direction is already armed or when the kernel refuses
    /// the registration; the registry is left unchanged in both cases.
    pub fn add_event(
        &self,
        fd: c_int,
        ev: IoEvent,
        continuation: Option<Continuation>,
    ) -> io::Result<()> {
        debug_assert!(ev == IoEvent::READ || ev == IoEvent::WRITE);
        let continuation = continuation
            .or_else(|| Fiber::current().map(Continuation::Fiber))
            .expect("add_event without a continuation outside a fiber");
        let ctx = self
            .context(fd, true)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;

        let mut slots = ctx.slots.lock();
        if slots.armed.contains(ev) {
            log::error!(
                "add_event: fd {} direction {:?} already armed (mask {:?})",
                fd,
                ev,
                slots.armed
            );
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        let op = if slots.armed.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let events = libc::EPOLLET as u32 | slots.armed.bits() | ev.bits();
        self.epoll_ctl(op, fd, events)?;

        slots.armed |= ev;
        *slots.slot_mut(ev) = Some(continuation);
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Disarm `ev` on `fd`, dropping its continuation without firing it.
    pub fn del_event(&self, fd: c_int, ev: IoEvent) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut slots = ctx.slots.lock();
        if !slots.armed.contains(ev) {
            return false;
        }
        if !self.reissue(fd, slots.armed - ev) {
            return false;
        }
        slots.armed -= ev;
        *slots.slot_mut(ev) = None;
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm `ev` on `fd` and fire its continuation.
    pub fn cancel_event(&self, fd: c_int, ev: IoEvent) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut slots = ctx.slots.lock();
        if !slots.armed.contains(ev) {
            return false;
        }
        if !self.reissue(fd, slots.armed - ev) {
            return false;
        }
        slots.armed -= ev;
        let continuation = slots.slot_mut(ev).take();
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        drop(slots);
        if let Some(continuation) = continuation {
            self.fire(continuation);
        }
        true
    }

    /// Disarm every direction on `fd`, firing the continuations.
    pub fn cancel_all(&self, fd: c_int) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut slots = ctx.slots.lock();
        if slots.armed.is_empty() {
            return false;
        }
        if !self.reissue(fd, IoEvent::empty()) {
            return false;
        }
        slots.armed = IoEvent::empty();
        let mut fired = Vec::new();
        for ev in [IoEvent::READ, IoEvent::WRITE] {
            if let Some(continuation) = slots.slot_mut(ev).take() {
                fired.push(continuation);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
        drop(slots);
        for continuation in fired {
            self.fire(continuation);
        }
        true
    }

    /// Re-register `fd` with the remaining armed mask (MOD), or drop the
    /// registration when nothing stays armed (DEL).
    fn reissue(&self, fd: c_int, remaining: IoEvent) -> bool {
        let (op, events) = if remaining.is_empty() {
            (libc::EPOLL_CTL_DEL, 0)
        } else {
            (libc::EPOLL_CTL_MOD, libc::EPOLLET as u32 | remaining.bits())
        };
        self.epoll_ctl(op, fd, events).is_ok()
    }

    fn epoll_ctl(&self, op: c_int, fd: c_int, events: u32) -> io::Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = events;
        ev.u64 = fd as u64;
        let rt = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            log::error!(
                "epoll_ctl(op={}, fd={}, events={:#x}) failed: {}",
                op,
                fd,
                events,
                err
            );
            return Err(err);
        }
        Ok(())
    }

    fn fire(&self, continuation: Continuation) {
        match continuation {
            Continuation::Fiber(fiber) => self.schedule(fiber),
            Continuation::Callback(cb) => self.schedule(Fiber::new(cb)),
        }
    }

    /// Handle one kernel event for `fd`: fold ERR/HUP into the armed
    /// directions, fire what triggered, and keep the rest registered.
    fn dispatch(&self, fd: c_int, kernel_events: u32) {
        let Some(ctx) = self.context(fd, false) else {
            return;
        };
        let mut slots = ctx.slots.lock();

        let mut events = kernel_events;
        if events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            events |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & slots.armed.bits();
        }
        let fired = slots.armed & IoEvent::from_bits_truncate(events);
        if fired.is_empty() {
            return;
        }

        if !self.reissue(fd, slots.armed - fired) {
            return;
        }
        slots.armed -= fired;

        let mut continuations = Vec::new();
        for ev in [IoEvent::READ, IoEvent::WRITE] {
            if fired.contains(ev) {
                if let Some(continuation) = slots.slot_mut(ev).take() {
                    continuations.push(continuation);
                }
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
        drop(slots);
        for continuation in continuations {
            self.fire(continuation);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Schedule for Reactor {
    fn core(&self) -> &Scheduler {
        &self.core
    }

    /// Wake one epoll_wait by writing a byte into the self-pipe. Skipped
    /// when no worker is idle.
    fn tickle(&self) {
        if !self.core.has_idle_workers() {
            return;
        }
        let _ = unsafe {
            libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1)
        };
        log::trace!("reactor {} tickled", self.core.name());
    }

    /// The pool may stop only once nothing can wake a fiber anymore: no
    /// ready fibers, no armed events, no timers.
    fn stopping(&self) -> bool {
        self.core.base_stopping()
            && self.pending_events() == 0
            && !self.timers.has_timer()
    }

    fn idle(&self) {
        let mut events = vec![unsafe { std::mem::zeroed::<libc::epoll_event>() }; MAX_EVENTS];
        loop {
            if self.stopping() {
                log::debug!("reactor {} idle fiber exiting", self.core.name());
                break;
            }

            let timeout = self
                .timers
                .next_delay()
                .map_or(MAX_IDLE_TIMEOUT_MS, |d| d.min(MAX_IDLE_TIMEOUT_MS));
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as c_int,
                    timeout as c_int,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    log::error!("epoll_wait failed: {}", err);
                }
                continue;
            }

            let mut expired: Vec<TimerCallback> = Vec::new();
            self.timers.collect_expired(&mut expired);
            for cb in expired {
                self.schedule(Fiber::new(move || cb()));
            }

            for ev in events.iter().take(n as usize) {
                let fd = ev.u64 as c_int;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }
                self.dispatch(fd, ev.events);
            }

            Fiber::yield_now();
        }
    }

    fn on_worker_start(&self) {
        CURRENT_REACTOR.with(|c| *c.borrow_mut() = Some(self.weak_self.clone()));
        hook::set_hook_enabled(true);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    fn nonblocking_pipe() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    fn wait_for(flag: &AtomicBool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_callback_fires_on_readiness() {
        let reactor = Reactor::new(1, "cb-ready");
        let (rd, wr) = nonblocking_pipe();
        let hit = Arc::new(AtomicBool::new(false));

        let cont = Continuation::Callback(Box::new({
            let hit = Arc::clone(&hit);
            move || {
                hit.store(true, Ordering::SeqCst);
            }
        }));
        reactor.add_event(rd, IoEvent::READ, Some(cont)).unwrap();
        assert_eq!(reactor.pending_events(), 1);

        let n = unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        assert!(wait_for(&hit, Duration::from_secs(2)));
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_add_cancel_roundtrip_restores_state() {
        let reactor = Reactor::new(1, "roundtrip");
        let (rd, wr) = nonblocking_pipe();
        let fired = Arc::new(AtomicBool::new(false));

        for _ in 0..3 {
            let cont = Continuation::Callback(Box::new({
                let fired = Arc::clone(&fired);
                move || {
                    fired.store(true, Ordering::SeqCst);
                }
            }));
            reactor.add_event(rd, IoEvent::READ, Some(cont)).unwrap();
            assert_eq!(reactor.pending_events(), 1);
            assert!(reactor.cancel_event(rd, IoEvent::READ));
            assert_eq!(reactor.pending_events(), 0);
        }
        // Cancellation fires the continuation.
        assert!(wait_for(&fired, Duration::from_secs(2)));

        reactor.stop();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_double_arm_is_rejected() {
        let reactor = Reactor::new(1, "double-arm");
        let (rd, wr) = nonblocking_pipe();

        reactor
            .add_event(rd, IoEvent::READ, Some(Continuation::Callback(Box::new(|| {}))))
            .unwrap();
        let err = reactor
            .add_event(rd, IoEvent::READ, Some(Continuation::Callback(Box::new(|| {}))))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        assert_eq!(reactor.pending_events(), 1);

        assert!(reactor.del_event(rd, IoEvent::READ));
        reactor.stop();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_del_event_does_not_fire() {
        let reactor = Reactor::new(1, "del-quiet");
        let (rd, wr) = nonblocking_pipe();
        let hit = Arc::new(AtomicBool::new(false));

        let cont = Continuation::Callback(Box::new({
            let hit = Arc::clone(&hit);
            move || {
                hit.store(true, Ordering::SeqCst);
            }
        }));
        reactor.add_event(rd, IoEvent::READ, Some(cont)).unwrap();
        assert!(reactor.del_event(rd, IoEvent::READ));
        assert!(!reactor.del_event(rd, IoEvent::READ));
        assert_eq!(reactor.pending_events(), 0);

        thread::sleep(Duration::from_millis(50));
        assert!(!hit.load(Ordering::SeqCst));

        reactor.stop();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_cancel_all_fires_both_directions() {
        let reactor = Reactor::new(1, "cancel-all");
        let mut fds = [0 as c_int; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        // Fill nothing: the socket stays readable-idle and writable, but the
        // continuations are only fired by the cancellation below.
        let read_hit = Arc::new(AtomicBool::new(false));
        let write_hit = Arc::new(AtomicBool::new(false));

        reactor
            .add_event(fds[0], IoEvent::READ, Some(Continuation::Callback(Box::new({
                let read_hit = Arc::clone(&read_hit);
                move || {
                    read_hit.store(true, Ordering::SeqCst);
                }
            }))))
            .unwrap();
        reactor
            .add_event(fds[0], IoEvent::WRITE, Some(Continuation::Callback(Box::new({
                let write_hit = Arc::clone(&write_hit);
                move || {
                    write_hit.store(true, Ordering::SeqCst);
                }
            }))))
            .unwrap();

        // WRITE fires immediately (socket is writable); READ stays armed.
        assert!(wait_for(&write_hit, Duration::from_secs(2)));
        assert_eq!(reactor.pending_events(), 1);

        assert!(reactor.cancel_all(fds[0]));
        assert!(wait_for(&read_hit, Duration::from_secs(2)));
        assert_eq!(reactor.pending_events(), 0);
        assert!(!reactor.cancel_all(fds[0]));

        reactor.stop();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_pending_counts_match_armed_masks() {
        let reactor = Reactor::new(1, "invariant");
        let (rd_a, wr_a) = nonblocking_pipe();
        let (rd_b, wr_b) = nonblocking_pipe();

        reactor
            .add_event(rd_a, IoEvent::READ, Some(Continuation::Callback(Box::new(|| {}))))
            .unwrap();
        reactor
            .add_event(rd_b, IoEvent::READ, Some(Continuation::Callback(Box::new(|| {}))))
            .unwrap();

        let armed_total: usize = [rd_a, rd_b]
            .iter()
            .map(|fd| {
                reactor
                    .context(*fd, false)
                    .map_or(0, |c| c.armed().bits().count_ones() as usize)
            })
            .sum();
        assert_eq!(reactor.pending_events(), armed_total);

        reactor.del_event(rd_a, IoEvent::READ);
        reactor.del_event(rd_b, IoEvent::READ);
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        unsafe {
            libc::close(rd_a);
            libc::close(wr_a);
            libc::close(rd_b);
            libc::close(wr_b);
        }
    }

    #[test]
    fn test_sleep_ms_parks_and_resumes() {
        let reactor = Reactor::new(2, "sleeper");
        let done = Arc::new(AtomicBool::new(false));
        let started = Instant::now();

        reactor.spawn({
            let done = Arc::clone(&done);
            move || {
                Reactor::current().unwrap().sleep_ms(30);
                done.store(true, Ordering::SeqCst);
            }
        });

        assert!(wait_for(&done, Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_millis(25));
        reactor.stop();
    }
}
