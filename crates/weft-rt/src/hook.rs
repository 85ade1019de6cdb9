//! Syscall interposition.
//!
//! Every function here carries `#[no_mangle] extern "C"`, so the definitions
//! shadow the libc symbols at link time (or under `LD_PRELOAD` when the
//! crate is built as a cdylib). The real entry points are resolved once per
//! process with `dlsym(RTLD_NEXT, ..)`.
//!
//! Interposition is gated by a per-thread flag that is off by default and
//! enabled only on reactor workers. Code on any other thread, and any fd the
//! runtime does not manage, sees the unmodified syscall.
//!
//! For the I/O family the flow is: issue the real call; on `EAGAIN` arm the
//! fd direction with the reactor (plus a one-shot timeout timer when the fd
//! has one configured), suspend the calling fiber, and retry once resumed.
//! A timeout or a concurrent `close` surfaces as `ETIMEDOUT`/`EBADF` errno
//! on the suspended call.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{
    c_int, c_uint, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timeval,
};

use crate::fd::{self, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::{IoEvent, Reactor};
use crate::scheduler::Schedule;

/// Timeout applied to interposed `connect` calls.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether interposed calls on this thread go through the runtime.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Flip interposition for this thread. The reactor turns it on for its
/// workers; everything else defaults to off.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

/// Resolve the real libc entry points. Idempotent and thread-safe; runs at
/// most once per process. `Reactor::new` calls it eagerly, the first
/// interposed call would otherwise do it lazily.
pub fn init() {
    let _ = real_fns();
}

fn errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_errno(err: c_int) {
    unsafe {
        *libc::__errno_location() = err;
    }
}

// ---------------------------------------------------------------------------
// Real entry points
// ---------------------------------------------------------------------------

/// Look up the next definition of `name` (a NUL-terminated literal) after
/// this object in dynamic-link order.
unsafe fn resolve<F>(name: &'static str) -> F {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char);
    assert!(
        !sym.is_null(),
        "dlsym(RTLD_NEXT, {:?}) returned null",
        &name[..name.len() - 1]
    );
    std::mem::transmute_copy(&sym)
}

macro_rules! real_syscalls {
    ($( fn $name:ident($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty; )*) => {
        struct RealFns {
            $( $name: unsafe extern "C" fn($($ty),*) -> $ret, )*
        }

        fn real_fns() -> &'static RealFns {
            static REAL: OnceLock<RealFns> = OnceLock::new();
            REAL.get_or_init(|| RealFns {
                $( $name: unsafe { resolve(concat!(stringify!($name), "\0")) }, )*
            })
        }

        /// Pass-through wrappers around the resolved entry points.
        pub(crate) mod real {
            use super::*;
            $(
                pub unsafe fn $name($($arg: $ty),*) -> $ret {
                    (real_fns().$name)($($arg),*)
                }
            )*
        }
    };
}

real_syscalls! {
    fn sleep(seconds: c_uint) -> c_uint;
    fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int;
    fn connect(sockfd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int;
    fn accept(sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int;
    fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
    fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t;
    fn recvfrom(
        sockfd: c_int,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        src_addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t;
    fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t;
    fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
    fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;
    fn sendto(
        sockfd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        dest_addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t;
    fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t;
    fn close(fd: c_int) -> c_int;
    fn getsockopt(
        sockfd: c_int,
        level: c_int,
        optname: c_int,
        optval: *mut c_void,
        optlen: *mut socklen_t,
    ) -> c_int;
    fn setsockopt(
        sockfd: c_int,
        level: c_int,
        optname: c_int,
        optval: *const c_void,
        optlen: socklen_t,
    ) -> c_int;
}

// ---------------------------------------------------------------------------
// Suspend-and-retry core
// ---------------------------------------------------------------------------

/// Shared between a parked I/O call and its timeout timer. The timer holds
/// only a weak reference, so a wait that completes for any other reason and
/// returns drops the last strong reference and a late firing becomes a
/// no-op.
struct WaitInfo {
    cancelled: AtomicI32,
}

impl WaitInfo {
    fn new() -> Arc<WaitInfo> {
        Arc::new(WaitInfo {
            cancelled: AtomicI32::new(0),
        })
    }
}

/// Arm the conditional timeout for a parked wait: on expiry it records
/// `ETIMEDOUT` and cancels the armed event, which reschedules the fiber.
fn arm_timeout(
    reactor: &Arc<Reactor>,
    wait: &Arc<WaitInfo>,
    fd: c_int,
    event: IoEvent,
    ms: u64,
) -> crate::timer::Timer {
    let winfo = Arc::downgrade(wait);
    let wreactor = Arc::downgrade(reactor);
    reactor.timers().add_condition_timer(
        ms,
        move || {
            let Some(wait) = winfo.upgrade() else {
                return;
            };
            if wait.cancelled.load(Ordering::SeqCst) != 0 {
                return;
            }
            wait.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
            if let Some(reactor) = wreactor.upgrade() {
                reactor.cancel_event(fd, event);
            }
        },
        Arc::downgrade(wait),
        false,
    )
}

/// The blocking-call template shared by the whole I/O family.
///
/// `orig` re-issues the real syscall with the caller's arguments.
unsafe fn do_io<F>(
    fd: c_int,
    name: &'static str,
    event: IoEvent,
    timeout_kind: TimeoutKind,
    mut orig: F,
) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return orig();
    }
    let Some(info) = fd::table().get(fd, false) else {
        return orig();
    };
    if info.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !info.is_socket() || !info.nonblock_forced() {
        return orig();
    }

    let timeout = info.timeout(timeout_kind);
    let wait = WaitInfo::new();

    let mut n = orig();
    loop {
        if n >= 0 {
            return n;
        }
        match errno() {
            libc::EINTR => {
                n = orig();
            }
            libc::EAGAIN => {
                let Some(reactor) = Reactor::current() else {
                    return -1;
                };
                let timer = timeout.map(|ms| arm_timeout(&reactor, &wait, fd, event, ms));
                if let Err(err) = reactor.add_event(fd, event, None) {
                    log::error!("{}: add_event({}, {:?}) failed: {}", name, fd, event, err);
                    if let Some(timer) = &timer {
                        timer.cancel();
                    }
                    set_errno(err.raw_os_error().unwrap_or(libc::EINVAL));
                    return -1;
                }
                Fiber::yield_now();
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                let cancelled = wait.cancelled.load(Ordering::SeqCst);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                if info.is_closed() {
                    set_errno(libc::EBADF);
                    return -1;
                }
                n = orig();
            }
            _ => return n,
        }
    }
}

// ---------------------------------------------------------------------------
// Interposed symbols: timers and fd lifecycle
// ---------------------------------------------------------------------------

/// Interposed `sleep(3)`: parks the calling fiber on a one-shot timer.
#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        return real::sleep(seconds);
    }
    let (Some(fiber), Some(reactor)) = (Fiber::current(), Reactor::current()) else {
        return real::sleep(seconds);
    };
    let weak = Arc::downgrade(&reactor);
    reactor.timers().add_timer(
        u64::from(seconds) * 1000,
        move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.schedule(Arc::clone(&fiber));
            }
        },
        false,
    );
    Fiber::yield_now();
    0
}

/// Interposed `socket(2)`: registers the new fd with the fd table.
#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_hook_enabled() {
        return real::socket(domain, ty, protocol);
    }
    let fd = real::socket(domain, ty, protocol);
    if fd >= 0 {
        let _ = fd::table().get(fd, true);
    }
    fd
}

/// Interposed `close(2)`: wakes every fiber parked on the fd, drops the fd
/// table entry, then closes for real. Woken fibers observe `EBADF`.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return real::close(fd);
    }
    if let Some(info) = fd::table().get(fd, false) {
        info.set_closed();
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        fd::table().delete(fd);
    }
    real::close(fd)
}

/// Interposed `setsockopt(2)`: records `SO_RCVTIMEO`/`SO_SNDTIMEO` in the fd
/// table in addition to the real call. A zero timeval clears the timeout, as
/// it does kernel-side.
#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<timeval>()
    {
        if let Some(info) = fd::table().get(sockfd, false) {
            let tv = &*(optval as *const timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            info.set_timeout(kind, (ms != 0).then_some(ms));
        }
    }
    real::setsockopt(sockfd, level, optname, optval, optlen)
}

/// Interposed `getsockopt(2)`: pass-through.
#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    real::getsockopt(sockfd, level, optname, optval, optlen)
}

// ---------------------------------------------------------------------------
// Interposed symbols: connect
// ---------------------------------------------------------------------------

/// `connect` with an explicit timeout. `None` waits indefinitely.
///
/// Whatever ends the wait, the final status comes from
/// `getsockopt(SO_ERROR)`, except for a fired timeout which surfaces as
/// `ETIMEDOUT` directly.
pub unsafe fn connect_with_timeout(
    sockfd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout: Option<u64>,
) -> c_int {
    if !is_hook_enabled() {
        return real::connect(sockfd, addr, addrlen);
    }
    let Some(info) = fd::table().get(sockfd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if info.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !info.is_socket() {
        return real::connect(sockfd, addr, addrlen);
    }

    let n = real::connect(sockfd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(reactor) = Reactor::current() else {
        return -1;
    };
    let wait = WaitInfo::new();
    let timer = timeout.map(|ms| arm_timeout(&reactor, &wait, sockfd, IoEvent::WRITE, ms));

    match reactor.add_event(sockfd, IoEvent::WRITE, None) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = wait.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect: add_event({}, WRITE) failed: {}", sockfd, err);
        }
    }

    let mut sock_err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if real::getsockopt(
        sockfd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut sock_err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if sock_err == 0 {
        0
    } else {
        set_errno(sock_err);
        -1
    }
}

/// Interposed `connect(2)` with the default timeout.
#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, Some(DEFAULT_CONNECT_TIMEOUT_MS))
}

// ---------------------------------------------------------------------------
// Interposed symbols: I/O family
// ---------------------------------------------------------------------------

/// Interposed `accept(2)`: suspends until a connection is pending, then
/// registers the accepted fd.
#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(sockfd, "accept", IoEvent::READ, TimeoutKind::Recv, || {
        real::accept(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 {
        let _ = fd::table().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", IoEvent::READ, TimeoutKind::Recv, || {
        real::read(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", IoEvent::READ, TimeoutKind::Recv, || {
        real::readv(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", IoEvent::READ, TimeoutKind::Recv, || {
        real::recv(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", IoEvent::READ, TimeoutKind::Recv, || {
        real::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", IoEvent::READ, TimeoutKind::Recv, || {
        real::recvmsg(sockfd, msg, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", IoEvent::WRITE, TimeoutKind::Send, || {
        real::write(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", IoEvent::WRITE, TimeoutKind::Send, || {
        real::writev(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", IoEvent::WRITE, TimeoutKind::Send, || {
        real::send(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", IoEvent::WRITE, TimeoutKind::Send, || {
        real::sendto(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", IoEvent::WRITE, TimeoutKind::Send, || {
        real::sendmsg(sockfd, msg, flags)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
