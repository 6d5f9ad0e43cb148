//! # Phonet Datagram Transport
//!
//! Raw framing over an `AF_PHONET` datagram socket bound to one resource.
//!
//! Writes stay in blocking mode: a request either reaches the modem in full
//! or fails. Reads are always issued with `MSG_DONTWAIT` so the reactor
//! thread never stalls on an empty socket.
//!
//! The [`Transport`] and [`Connector`] traits are the seam the client is
//! written against; [`PhonetConnector`] is the kernel-backed implementation
//! and tests substitute in-memory ones.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Phonet address family (`AF_PHONET`).
pub const AF_PHONET: libc::c_int = 35;

/// Communication manager resource, receiver of subscription announcements.
pub const PN_COMMGR: u8 = 0x10;

/// Phonet device addresses used when configuring the modem link.
pub const PN_DEV_HOST: u8 = 0x00;
pub const PN_DEV_PC: u8 = 0x10;
pub const PN_DEV_SOS: u8 = 0x6C;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SockaddrPn {
    spn_family: libc::sa_family_t,
    spn_obj: u8,
    spn_dev: u8,
    spn_resource: u8,
    spn_zero: [u8; 11],
}

impl SockaddrPn {
    fn object(&self) -> u16 {
        (u16::from(self.spn_dev) << 8) | u16::from(self.spn_obj)
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Metadata of one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes copied into the caller's buffer.
    pub len: usize,
    /// Sender object, `(device << 8) | object`.
    pub object: u16,
    /// Sender resource.
    pub resource: u8,
}

/// A datagram endpoint bound to one resource.
pub trait Transport {
    /// Descriptor to register with the reactor.
    fn as_raw_fd(&self) -> RawFd;

    /// Write `[id, payload..]` as one datagram. Returns bytes written.
    fn send_frame(&self, id: u8, payload: &[u8]) -> io::Result<usize>;

    /// Write a raw datagram.
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Size of the next pending datagram, or 0 if it cannot be determined.
    fn pending_length(&self) -> usize;

    /// Read one datagram without blocking.
    fn receive(&self, buf: &mut [u8]) -> io::Result<Received>;
}

/// Opens transports bound to a resource.
pub trait Connector {
    fn open(&self, resource: u8) -> io::Result<Box<dyn Transport>>;
}

// ─── Phonet implementation ───────────────────────────────────────────────────

/// Kernel `AF_PHONET` datagram socket.
#[derive(Debug)]
pub struct PhonetTransport {
    fd: OwnedFd,
    resource: u8,
}

impl PhonetTransport {
    /// Open a close-on-exec datagram socket bound to `resource`.
    pub fn open(resource: u8) -> io::Result<Self> {
        let raw = unsafe { libc::socket(AF_PHONET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrPn {
            spn_family: AF_PHONET as libc::sa_family_t,
            spn_resource: resource,
            ..Default::default()
        };
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrPn as *const libc::sockaddr,
                mem::size_of::<SockaddrPn>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::debug!(resource, fd = fd.as_raw_fd(), "phonet socket bound");
        Ok(PhonetTransport { fd, resource })
    }

    pub fn resource(&self) -> u8 {
        self.resource
    }
}

impl Transport for PhonetTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn send_frame(&self, id: u8, payload: &[u8]) -> io::Result<usize> {
        let id_byte = [id];
        let iov = [
            libc::iovec {
                iov_base: id_byte.as_ptr() as *mut libc::c_void,
                iov_len: 1,
            },
            libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            },
        ];
        let ret = unsafe { libc::writev(self.fd.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn pending_length(&self) -> usize {
        let mut len: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::FIONREAD, &mut len) };
        if ret != 0 || len < 0 {
            0
        } else {
            len as usize
        }
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Received> {
        let mut addr = SockaddrPn::default();
        let mut addrlen = mem::size_of::<SockaddrPn>() as libc::socklen_t;
        let ret = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
                &mut addr as *mut SockaddrPn as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Received {
            len: ret as usize,
            object: addr.object(),
            resource: addr.spn_resource,
        })
    }
}

/// [`Connector`] producing kernel Phonet sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhonetConnector;

impl Connector for PhonetConnector {
    fn open(&self, resource: u8) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(PhonetTransport::open(resource)?))
    }
}
