//! In-memory Phonet stand-in for integration tests.
//!
//! Each mock transport owns one end of a `UnixDatagram` pair so the
//! descriptors are real and pollable; sender metadata rides in a side queue.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::rc::Rc;

use isi_client::transport::{Connector, Received, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    /// Resource the sending transport is bound to.
    pub from: u8,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MockNet {
    pub sent: Vec<Sent>,
    pub open: HashSet<RawFd>,
    pub bound: HashMap<RawFd, u8>,
    meta: HashMap<RawFd, VecDeque<(usize, u16, u8)>>,
    peers: HashMap<RawFd, UnixDatagram>,
    pub fail_open: bool,
    pub fail_send: bool,
    pub short_write: bool,
}

pub type Net = Rc<RefCell<MockNet>>;

pub fn net() -> Net {
    Rc::new(RefCell::new(MockNet::default()))
}

impl MockNet {
    /// Queue a datagram for the transport behind `fd`.
    pub fn deliver(&mut self, fd: RawFd, object: u16, resource: u8, data: &[u8]) {
        let peer = self.peers.get(&fd).expect("unknown mock fd");
        peer.send(data).expect("mock deliver");
        self.meta
            .entry(fd)
            .or_default()
            .push_back((data.len(), object, resource));
    }

    /// Descriptor of the open transport bound to `resource`.
    pub fn fd_of(&self, resource: u8) -> Option<RawFd> {
        self.bound
            .iter()
            .find(|(fd, r)| **r == resource && self.open.contains(fd))
            .map(|(fd, _)| *fd)
    }

    pub fn frames_from(&self, resource: u8) -> Vec<Vec<u8>> {
        self.sent
            .iter()
            .filter(|s| s.from == resource)
            .map(|s| s.data.clone())
            .collect()
    }
}

pub struct MockTransport {
    sock: UnixDatagram,
    resource: u8,
    net: Net,
}

impl Transport for MockTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn send_frame(&self, id: u8, payload: &[u8]) -> io::Result<usize> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(id);
        frame.extend_from_slice(payload);
        let written = self.send(&frame)?;
        let net = self.net.borrow();
        if net.short_write {
            return Ok(written.saturating_sub(1));
        }
        Ok(written)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut net = self.net.borrow_mut();
        if net.fail_send {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        net.sent.push(Sent {
            from: self.resource,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn pending_length(&self) -> usize {
        let fd = self.as_raw_fd();
        self.net
            .borrow()
            .meta
            .get(&fd)
            .and_then(|q| q.front())
            .map_or(0, |(len, _, _)| *len)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Received> {
        let len = self.sock.recv(buf)?;
        let fd = self.as_raw_fd();
        let (_, object, resource) = self
            .net
            .borrow_mut()
            .meta
            .get_mut(&fd)
            .and_then(|q| q.pop_front())
            .unwrap_or((len, 0, self.resource));
        Ok(Received {
            len,
            object,
            resource,
        })
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let fd = self.sock.as_raw_fd();
        let mut net = self.net.borrow_mut();
        net.open.remove(&fd);
        net.peers.remove(&fd);
        net.meta.remove(&fd);
    }
}

pub struct MockConnector {
    pub net: Net,
}

impl Connector for MockConnector {
    fn open(&self, resource: u8) -> io::Result<Box<dyn Transport>> {
        if self.net.borrow().fail_open {
            return Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT));
        }
        let (ours, theirs) = UnixDatagram::pair()?;
        ours.set_nonblocking(true)?;
        let fd = ours.as_raw_fd();
        {
            let mut net = self.net.borrow_mut();
            net.open.insert(fd);
            net.bound.insert(fd, resource);
            net.peers.insert(fd, theirs);
        }
        Ok(Box::new(MockTransport {
            sock: ours,
            resource,
            net: self.net.clone(),
        }))
    }
}
