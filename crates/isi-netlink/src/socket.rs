//! Routing socket plumbing: `NETLINK_ROUTE` datagram sockets, interface
//! bring-up via `ioctl`, and name/index lookup.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::wire::SIZE_NLMSG;

pub const SOL_NETLINK: libc::c_int = 270;
pub const NETLINK_ADD_MEMBERSHIP: libc::c_int = 1;
pub const RTNLGRP_LINK: u32 = 1;

const IFNAMSIZ: usize = 16;

/// One received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    /// Bytes received, capped at the buffer size.
    pub len: usize,
    /// The kernel had more bytes than fit in the buffer.
    pub truncated: bool,
}

/// A routing socket as seen by the monitor. Tests substitute scripted ones.
pub trait RouteSocket {
    fn as_raw_fd(&self) -> RawFd;

    /// Send one request to the kernel.
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Receive one datagram, honouring the socket's blocking mode.
    fn recv(&self, buf: &mut [u8]) -> io::Result<Datagram>;
}

/// Kernel `AF_NETLINK`/`NETLINK_ROUTE` socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    /// Blocking routing socket with a [`SIZE_NLMSG`] receive buffer.
    pub fn open() -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fresh descriptor, owned from here on.
        let sock = NetlinkSocket {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        };
        sock.set_int_option(libc::SOL_SOCKET, libc::SO_RCVBUF, SIZE_NLMSG as libc::c_int)?;
        Ok(sock)
    }

    /// Non-blocking socket subscribed to link notifications.
    pub fn open_monitor() -> io::Result<Self> {
        let sock = Self::open()?;
        sock.set_nonblocking()?;
        sock.join_group(RTNLGRP_LINK)?;
        Ok(sock)
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn join_group(&self, group: u32) -> io::Result<()> {
        self.set_int_option(SOL_NETLINK, NETLINK_ADD_MEMBERSHIP, group as libc::c_int)
    }

    fn set_int_option(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl RouteSocket for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        // SAFETY: sockaddr_nl is plain data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is plain data; all-zero is a valid value.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        let ret = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Datagram {
            len: ret as usize,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        })
    }
}

// ─── Interfaces ──────────────────────────────────────────────────────────────

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    ifru: [u8; 24],
}

impl IfReq {
    fn with_index(ifindex: u32) -> Self {
        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            ifru: [0; 24],
        };
        req.ifru[..4].copy_from_slice(&(ifindex as libc::c_int).to_ne_bytes());
        req
    }

    fn flags(&self) -> libc::c_short {
        libc::c_short::from_ne_bytes([self.ifru[0], self.ifru[1]])
    }

    fn set_flags(&mut self, flags: libc::c_short) {
        self.ifru[..2].copy_from_slice(&flags.to_ne_bytes());
    }
}

/// Set `IFF_UP | IFF_RUNNING` on `ifindex`.
pub fn bring_up(ifindex: u32) -> io::Result<()> {
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fresh descriptor, closed on drop.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut req = IfReq::with_index(ifindex);
    for request in [libc::SIOCGIFNAME, libc::SIOCGIFFLAGS] {
        if unsafe { libc::ioctl(fd.as_raw_fd(), request as _, &mut req as *mut IfReq) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    let flags = req.flags() | (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    req.set_flags(flags);
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCSIFFLAGS as _, &mut req as *mut IfReq) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kernel index of interface `name`.
pub fn interface_index(name: &str) -> io::Result<u32> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_matches_kernel_size() {
        assert_eq!(mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn ifreq_flag_roundtrip() {
        let mut req = IfReq::with_index(3);
        req.set_flags(0x41);
        assert_eq!(req.flags(), 0x41);
    }

    #[test]
    fn loopback_has_an_index() {
        match interface_index("lo") {
            Ok(index) => assert!(index > 0),
            Err(e) => assert!(e.raw_os_error().is_some()),
        }
        assert!(interface_index("no-such-if0").is_err());
    }

    #[test]
    fn open_monitor_socket() {
        // Sandboxes without netlink access report an OS error instead.
        match NetlinkSocket::open_monitor() {
            Ok(sock) => assert!(sock.as_raw_fd() >= 0),
            Err(e) => assert!(e.raw_os_error().is_some()),
        }
    }
}
