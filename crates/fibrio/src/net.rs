//! Socket and pipe plumbing
//!
//! Synchronous fd setup (socket/bind/listen, pipes) for the ring-driven
//! operations in [`crate::io`]. The accept/connect/read/write paths all go
//! through the ring; only the one-shot setup syscalls live here.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use fibrio_core::{Error, Result};

use crate::fd::FdHandle;

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn os_result(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(Error::Os(errno()))
    } else {
        Ok(ret)
    }
}

/// Encode a socket address for the kernel.
pub(crate) fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            unsafe {
                std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Create an unconnected TCP socket of `addr`'s family, for
/// [`crate::io::connect`].
pub fn tcp_socket(addr: SocketAddr) -> Result<FdHandle> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = os_result(unsafe {
        libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
    })?;
    Ok(FdHandle::from_raw(fd, true))
}

/// Bind and listen on `addr`. The backlog follows the platform maximum,
/// as the original runtime did.
pub fn listen_tcp(addr: SocketAddr) -> Result<FdHandle> {
    let sock = tcp_socket(addr)?;
    let fd = sock.raw_fd()?;
    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&opt as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let (storage, len) = sockaddr_from(addr);
    os_result(unsafe {
        libc::bind(
            fd,
            (&storage as *const libc::sockaddr_storage).cast(),
            len,
        )
    })?;
    os_result(unsafe { libc::listen(fd, libc::SOMAXCONN) })?;
    Ok(sock)
}

/// The local address a listener actually bound (port 0 resolution).
pub fn local_addr(fd: &FdHandle) -> Result<SocketAddr> {
    let raw = fd.raw_fd()?;
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    os_result(unsafe {
        libc::getsockname(
            raw,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    })?;
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: libc::sockaddr_in =
                unsafe { std::ptr::read((&storage as *const libc::sockaddr_storage).cast()) };
            Ok(SocketAddr::from((
                u32::from_be(sin.sin_addr.s_addr).to_be_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 =
                unsafe { std::ptr::read((&storage as *const libc::sockaddr_storage).cast()) };
            Ok(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => Err(Error::Os(libc::EAFNOSUPPORT)),
    }
}

/// An anonymous pipe: (read end, write end).
pub fn pipe() -> Result<(FdHandle, FdHandle)> {
    let mut fds: [RawFd; 2] = [0; 2];
    os_result(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok((FdHandle::from_raw(fds[0], true), FdHandle::from_raw(fds[1], true)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_v4_encoding() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let (storage, len) = sockaddr_from(addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let sin: libc::sockaddr_in =
            unsafe { std::ptr::read((&storage as *const libc::sockaddr_storage).cast()) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 8081);
        assert_eq!(u32::from_be(sin.sin_addr.s_addr), 0x7f000001);
    }

    #[test]
    fn test_listen_resolves_ephemeral_port() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = local_addr(&listener).unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_pipe_round_trip() {
        let (r, w) = pipe().unwrap();
        let msg = b"ping";
        let n = unsafe {
            libc::write(
                w.raw_fd().unwrap(),
                msg.as_ptr().cast(),
                msg.len(),
            )
        };
        assert_eq!(n, 4);
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                r.raw_fd().unwrap(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], msg);
    }
}
