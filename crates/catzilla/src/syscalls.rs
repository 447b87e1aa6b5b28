// src/syscalls.rs
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::CatzillaResult;

fn set_opt(fd: c_int, level: c_int, opt: c_int, value: c_int) -> c_int {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const c_void,
            mem::size_of_val(&value) as socklen_t,
        )
    }
}

fn close_on_error(fd: c_int) -> io::Error {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    err
}

/// Create a non-blocking listener with SO_REUSEPORT so every reactor
/// worker binds its own socket on the shared port. TCP_NODELAY is set on
/// the listener and inherited by accepted sockets.
pub fn create_listener(host: &str, port: u16) -> CatzillaResult<c_int> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    #[cfg(target_os = "linux")]
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }

    #[cfg(not(target_os = "linux"))]
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(close_on_error(fd).into());
        }
    }

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    if set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1) < 0 {
        return Err(close_on_error(fd).into());
    }
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
    #[cfg(target_os = "linux")]
    {
        // Kernel holds the connection until data arrives; fewer idle
        // accept wakeups on a keep-alive workload.
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1);
    }
    #[cfg(target_os = "macos")]
    {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
    }

    bind_addr(fd, &addr)?;

    if unsafe { libc::listen(fd, 8192) } < 0 {
        return Err(close_on_error(fd).into());
    }
    Ok(fd)
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> CatzillaResult<()> {
    let rc = match addr {
        SocketAddr::V4(a) => {
            #[cfg(target_os = "macos")]
            let sin = libc::sockaddr_in {
                sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            #[cfg(not(target_os = "macos"))]
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
        }
        SocketAddr::V6(a) => {
            #[cfg(target_os = "macos")]
            let sin6 = libc::sockaddr_in6 {
                sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            #[cfg(not(target_os = "macos"))]
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if rc < 0 {
        return Err(close_on_error(fd).into());
    }
    Ok(())
}

fn peer_from_storage(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            // s_addr is in network byte order.
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

/// Accept one pending connection, capturing the transport peer address.
/// `Ok(None)` means the accept queue is drained.
pub fn accept_connection(listen_fd: c_int) -> CatzillaResult<Option<(c_int, Option<IpAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    #[cfg(target_os = "linux")]
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err.into())
        };
    }

    #[cfg(not(target_os = "linux"))]
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(close_on_error(fd).into());
        }
        #[cfg(target_os = "macos")]
        set_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
    }

    Ok(Some((fd, peer_from_storage(&storage))))
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read into the buffer.
    Data(usize),
    /// Nothing available; wait for the next readiness event.
    WouldBlock,
    /// Peer closed its end.
    Eof,
}

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> CatzillaResult<ReadOutcome> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(ReadOutcome::WouldBlock)
        } else {
            Err(err.into())
        }
    } else if res == 0 {
        Ok(ReadOutcome::Eof)
    } else {
        Ok(ReadOutcome::Data(res as usize))
    }
}

/// Returns the bytes written; 0 means the socket is not writable yet.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> CatzillaResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(0)
        } else {
            Err(err.into())
        }
    } else {
        Ok(res as usize)
    }
}

// ---- Readiness polling: epoll on Linux, kqueue fallback on macOS ----

#[cfg(target_os = "linux")]
pub use linux_poll::*;

#[cfg(target_os = "linux")]
mod linux_poll {
    use super::*;
    pub use libc::{EPOLLIN, EPOLLOUT, epoll_event};
    use libc::EPOLLET;

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> CatzillaResult<Self> {
            let fd = unsafe { libc::epoll_create1(0) };
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Poller { fd })
        }

        /// Edge-triggered registration; the loop drains until WouldBlock.
        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> CatzillaResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> CatzillaResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        pub fn delete(&self, fd: c_int) -> CatzillaResult<()> {
            let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
            Ok(())
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> CatzillaResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> CatzillaResult<usize> {
            let res = unsafe {
                libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
pub use macos_poll::*;

#[cfg(target_os = "macos")]
mod macos_poll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, timespec};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> CatzillaResult<Self> {
            let fd = unsafe { libc::kqueue() };
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Poller { fd })
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> CatzillaResult<()> {
            self.apply(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> CatzillaResult<()> {
            self.apply(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> CatzillaResult<()> {
            self.apply(fd, 0, EPOLLIN | EPOLLOUT, EV_DELETE)
        }

        fn apply(&self, fd: c_int, token: u64, interests: i32, action: u16) -> CatzillaResult<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;
            if (interests & EPOLLIN) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & EPOLLOUT) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            let rc = unsafe {
                libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null())
            };
            if rc < 0 && action != EV_DELETE {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> CatzillaResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch = events.len().min(MAX_BATCH);
            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            let res = unsafe {
                libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch as c_int,
                    &ts,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            let n = res as usize;
            for i in 0..n {
                let mut flags = 0;
                if kevents[i].filter == EVFILT_READ {
                    flags |= EPOLLIN;
                }
                if kevents[i].filter == EVFILT_WRITE {
                    flags |= EPOLLOUT;
                }
                events[i] = epoll_event {
                    events: flags as u32,
                    u64: kevents[i].udata as u64,
                };
            }
            Ok(n)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
