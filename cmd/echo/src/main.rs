//! fiberio Echo Server
//!
//! TCP echo server with one fiber per connection. The accept loop and the
//! connection handlers use the hook API, so a read with no data parks the
//! fiber on epoll instead of blocking a worker thread.
//!
//! Usage:
//!     cargo build --release -p fiberio-echo
//!     ./target/release/echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 8020
//!
//! # Environment Variables
//!
//! - `FIO_THREADS=<n>` - Worker threads (default 2)
//! - `FIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::os::fd::RawFd;

use fiberio::hook::{self, sys::errno};
use fiberio::{env_get, kdebug, kerror, kinfo, kwarn, spawn, IoManager, Runtime, RuntimeConfig};

const DEFAULT_PORT: u16 = 8020;
const BUF_SIZE: usize = 4096;
const BACKLOG: libc::c_int = 128;

fn listen_on(port: u16) -> Result<RawFd, libc::c_int> {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if fd < 0 {
        return Err(errno());
    }

    let one: libc::c_int = 1;
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY.to_be() },
        sin_zero: [0; 8],
    };
    let ok = unsafe {
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) == 0
            && libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) == 0
            && libc::listen(fd, BACKLOG) == 0
    };
    if !ok {
        let e = errno();
        hook::close(fd);
        return Err(e);
    }
    Ok(fd)
}

fn echo(fd: RawFd) {
    let mut buf = [0u8; BUF_SIZE];
    'conn: loop {
        let n = hook::read(fd, &mut buf);
        if n <= 0 {
            if n < 0 {
                kdebug!("read on fd {} failed, errno {}", fd, errno());
            }
            break;
        }

        let mut sent = 0;
        while sent < n as usize {
            let w = hook::write(fd, &buf[sent..n as usize]);
            if w <= 0 {
                kdebug!("write on fd {} failed, errno {}", fd, errno());
                break 'conn;
            }
            sent += w as usize;
        }
    }
    hook::close(fd);
    kdebug!("connection fd {} closed", fd);
}

fn accept_loop(port: u16) {
    let listener = match listen_on(port) {
        Ok(fd) => fd,
        Err(e) => {
            kerror!("cannot listen on port {}: errno {}", port, e);
            return;
        }
    };
    kinfo!("echo server listening on 0.0.0.0:{}", port);

    loop {
        let conn = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            match errno() {
                libc::EINTR | libc::ECONNABORTED => continue,
                e => {
                    kwarn!("accept failed, errno {}", e);
                    if e == libc::EBADF {
                        break;
                    }
                    continue;
                }
            }
        }
        kdebug!("accepted fd {}", conn);
        if let Err(e) = spawn(move || echo(conn)) {
            kerror!("cannot spawn handler: {}", e);
            hook::close(conn);
        }
    }
}

fn main() {
    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let threads: usize = env_get("FIO_THREADS", 2);

    let runtime = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let iom = match IoManager::new(&runtime, threads, false, "echo") {
        Ok(iom) => iom,
        Err(e) => {
            eprintln!("failed to start io manager: {}", e);
            std::process::exit(1);
        }
    };

    iom.submit(move || accept_loop(port));

    // Returns once the accept loop gives up and every connection is closed
    iom.stop();
}
