//! End-to-end echo server scenario.
//!
//! An acceptor fiber listens on a TCP port; each accepted connection gets
//! its own echo fiber. Plain OS threads play the clients with std networking
//! (the interposition flag is per-thread and off for them).

use std::io::{Read, Write};
use std::mem;
use std::net::TcpStream;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_void, socklen_t};
use weft_rt::{hook, Reactor, Schedule};

const ECHO_PORT: u16 = 18080;

fn loopback(port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_LOOPBACK.to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Create, bind and listen on a TCP socket. Runs inside a fiber so the
/// socket is registered with the runtime.
unsafe fn listen_on(port: u16) -> c_int {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0);
    let one: c_int = 1;
    libc::setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &one as *const c_int as *const c_void,
        mem::size_of::<c_int>() as socklen_t,
    );
    let addr = loopback(port);
    let rt = libc::bind(
        fd,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as socklen_t,
    );
    assert_eq!(rt, 0, "bind failed: {}", std::io::Error::last_os_error());
    assert_eq!(libc::listen(fd, 64), 0);
    fd
}

unsafe fn echo_loop(fd: c_int) {
    let mut buf = [0u8; 8];
    loop {
        let n = hook::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if n <= 0 {
            break;
        }
        let mut sent = 0;
        while sent < n as usize {
            let m = hook::send(
                fd,
                buf[sent..].as_ptr() as *const c_void,
                n as usize - sent,
                0,
            );
            if m <= 0 {
                hook::close(fd);
                return;
            }
            sent += m as usize;
        }
    }
    hook::close(fd);
}

#[test]
fn test_echo_four_clients_in_order() {
    let reactor = Reactor::new(2, "echo");
    let listening = Arc::new(AtomicBool::new(false));
    let listener_fd = Arc::new(AtomicI32::new(-1));

    reactor.spawn({
        let listening = Arc::clone(&listening);
        let listener_fd = Arc::clone(&listener_fd);
        move || unsafe {
            let lfd = listen_on(ECHO_PORT);
            listener_fd.store(lfd, Ordering::SeqCst);
            listening.store(true, Ordering::SeqCst);
            loop {
                let conn = hook::accept(lfd, ptr::null_mut(), ptr::null_mut());
                if conn < 0 {
                    break;
                }
                Reactor::current()
                    .unwrap()
                    .spawn(move || unsafe { echo_loop(conn) });
            }
        }
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !listening.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "acceptor never came up");
        thread::sleep(Duration::from_millis(1));
    }

    let clients: Vec<_> = (0..4)
        .map(|client| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(("127.0.0.1", ECHO_PORT))
                    .unwrap_or_else(|e| panic!("client {} connect: {}", client, e));
                let mut echoed = 0usize;
                for _ in 0..10 {
                    stream.write_all(b"ping-42").unwrap();
                    let mut buf = [0u8; 7];
                    stream.read_exact(&mut buf).unwrap();
                    assert_eq!(&buf, b"ping-42");
                    echoed += 2 * buf.len();
                }
                echoed
            })
        })
        .collect();

    for client in clients {
        let exchanged = client.join().unwrap();
        assert_eq!(exchanged, 140);
    }

    // Unblock the acceptor, then the pool must wind down promptly.
    let lfd = listener_fd.load(Ordering::SeqCst);
    reactor.spawn(move || unsafe {
        hook::close(lfd);
    });
    thread::sleep(Duration::from_millis(50));

    let stop_started = Instant::now();
    reactor.stop();
    assert!(
        stop_started.elapsed() < Duration::from_millis(1000),
        "stop took {:?}",
        stop_started.elapsed()
    );
}
