//! Echo server demo for the weft runtime.
//!
//! Starts a reactor, spawns an acceptor fiber on a loopback port, answers a
//! few std-thread clients, and shuts the pool down cleanly. The fibers use
//! plain POSIX calls through the interposition layer; the clients use std
//! networking from ordinary threads.

use std::io::{Read, Write};
use std::mem;
use std::net::TcpStream;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};
use weft_rt::{hook, Reactor, Schedule};

const PORT: u16 = 18081;
const CLIENTS: usize = 4;
const ROUNDS: usize = 5;

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

unsafe fn listen_on(port: u16) -> c_int {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket: {}", std::io::Error::last_os_error());
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
    assert_eq!(rt, 0, "bind: {}", std::io::Error::last_os_error());
    assert_eq!(libc::listen(fd, 64), 0);
    fd
}

unsafe fn echo_loop(fd: c_int) {
    let mut buf = [0u8; 256];
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

fn main() {
    let reactor = Reactor::new(2, "weft-echo");
    let listening = Arc::new(AtomicBool::new(false));
    let listener_fd = Arc::new(AtomicI32::new(-1));

    reactor.spawn({
        let listening = Arc::clone(&listening);
        let listener_fd = Arc::clone(&listener_fd);
        move || unsafe {
            let lfd = listen_on(PORT);
            listener_fd.store(lfd, Ordering::SeqCst);
            listening.store(true, Ordering::SeqCst);
            println!("echo server listening on 127.0.0.1:{}", PORT);
            loop {
                let conn = hook::accept(lfd, ptr::null_mut(), ptr::null_mut());
                if conn < 0 {
                    break;
                }
                Reactor::current()
                    .unwrap()
                    .spawn(move || unsafe { echo_loop(conn) });
            }
            println!("acceptor done");
        }
    });

    while !listening.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }

    let clients: Vec<_> = (0..CLIENTS)
        .map(|id| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(("127.0.0.1", PORT)).expect("connect");
                for round in 0..ROUNDS {
                    let msg = format!("client-{} round-{}", id, round);
                    stream.write_all(msg.as_bytes()).expect("write");
                    let mut buf = vec![0u8; msg.len()];
                    stream.read_exact(&mut buf).expect("read");
                    assert_eq!(buf, msg.as_bytes());
                }
                println!("client {} echoed {} messages", id, ROUNDS);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let lfd = listener_fd.load(Ordering::SeqCst);
    reactor.spawn(move || unsafe {
        hook::close(lfd);
    });
    reactor.stop();
    println!("reactor stopped");
}
