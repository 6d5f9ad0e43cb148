//! # Link Monitor
//!
//! Follows Phonet network interfaces through rtnetlink notifications.
//!
//! ```text
//!   Unknown ──▶ Up ⇄ Down ──▶ Removed
//! ```
//!
//! On start the monitor joins the link multicast group and asks the kernel
//! for a dump of every Phonet link, so the first readable event reports the
//! current state. Later notifications move each interface through the state
//! machine above. Every link record carrying an interface name is reported,
//! whether or not the state changed.
//!
//! [`MonitorRegistry`] keeps the monitors of one reactor thread and drives
//! them all as a single [`EventSource`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;

use isi_client::reactor::EventSource;
use slab::Slab;

use crate::error::{Error, Result};
use crate::socket::{bring_up, NetlinkSocket, RouteSocket};
use crate::wire::{
    error_code, getlink_request, records, AddrRecord, LinkRecord, Record, AF_PHONET,
    ARPHRD_PHONET, NLMSG_DONE, NLMSG_ERROR, RTM_DELADDR, RTM_DELLINK, RTM_NEWADDR, RTM_NEWLINK,
    SIZE_NLMSG,
};

/// Interface filter matching every Phonet interface.
pub const ANY_INTERFACE: u32 = 0;

/// Operational state of a Phonet interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// `IFF_UP`, `IFF_RUNNING` and `IFF_LOWER_UP` are all set.
    Up,
    /// The interface exists but at least one of those flags is clear.
    Down,
    /// The kernel deleted the interface.
    Removed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
            LinkState::Removed => "removed",
        })
    }
}

/// Notification delivered to the monitor callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A link record for a watched Phonet interface.
    Link {
        /// Kernel interface index.
        ifindex: u32,
        state: LinkState,
        /// Interface name, e.g. `phonet0`.
        name: String,
    },
    /// Phonet device addresses assigned to (or withdrawn from) the interface.
    Address {
        /// Kernel interface index.
        ifindex: u32,
        /// `IFA_LOCAL`, the device address of this host.
        local: Option<u8>,
        /// `IFA_ADDRESS`, the peer device address.
        remote: Option<u8>,
        /// `RTM_DELADDR` rather than `RTM_NEWADDR`.
        removed: bool,
    },
}

/// Callback receiving every [`LinkEvent`] of one monitor.
pub type MonitorFn = Box<dyn FnMut(&LinkEvent)>;

// ─── LinkMonitor ─────────────────────────────────────────────────────────────

/// Watches one interface, or every Phonet interface, on a routing socket.
pub struct LinkMonitor {
    interface: u32,
    socket: Box<dyn RouteSocket>,
    callback: MonitorFn,
    states: HashMap<u32, LinkState>,
    datagrams: u64,
    hung_up: bool,
}

impl LinkMonitor {
    /// Watch `interface` (or [`ANY_INTERFACE`]) on a fresh routing socket.
    ///
    /// A specific interface is brought administratively up first; failing
    /// that is logged and otherwise ignored.
    pub fn start<F>(interface: u32, callback: F) -> Result<Self>
    where
        F: FnMut(&LinkEvent) + 'static,
    {
        let socket = NetlinkSocket::open_monitor()?;
        if interface != ANY_INTERFACE {
            if let Err(e) = bring_up(interface) {
                tracing::warn!(ifindex = interface, error = %e, "could not bring interface up");
            }
        }
        Self::with_socket(interface, socket, callback)
    }

    /// Like [`start`](Self::start), leaving interface flags alone.
    pub fn start_passive<F>(interface: u32, callback: F) -> Result<Self>
    where
        F: FnMut(&LinkEvent) + 'static,
    {
        Self::with_socket(interface, NetlinkSocket::open_monitor()?, callback)
    }

    /// Watch `interface` on an already configured socket and request the
    /// initial dump.
    pub fn with_socket<S, F>(interface: u32, socket: S, callback: F) -> Result<Self>
    where
        S: RouteSocket + 'static,
        F: FnMut(&LinkEvent) + 'static,
    {
        let request = getlink_request(1, std::process::id());
        socket.send(&request)?;
        tracing::info!(ifindex = interface, "link monitor started");
        Ok(LinkMonitor {
            interface,
            socket: Box::new(socket),
            callback: Box::new(callback),
            states: HashMap::new(),
            datagrams: 0,
            hung_up: false,
        })
    }

    pub fn interface(&self) -> u32 {
        self.interface
    }

    /// Last reported state of `ifindex`; `None` while still unknown.
    pub fn state(&self, ifindex: u32) -> Option<LinkState> {
        self.states.get(&ifindex).copied()
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Datagrams read from the socket so far, malformed ones included.
    pub fn datagrams(&self) -> u64 {
        self.datagrams
    }

    /// Read one datagram from the socket and process it.
    ///
    /// Returns the number of events delivered. `Ok(0)` when nothing was
    /// pending.
    pub fn receive(&mut self) -> Result<usize> {
        let mut buf = vec![0u8; SIZE_NLMSG];
        let datagram = match self.socket.recv(&mut buf) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        self.datagrams += 1;
        if datagram.truncated {
            return Err(Error::Truncated);
        }
        self.process(&buf[..datagram.len.min(buf.len())])
    }

    /// Process the records of one datagram.
    ///
    /// `NLMSG_DONE` ends processing. An `NLMSG_ERROR` record abandons the
    /// rest of the datagram and, if it carries a failure, is returned as
    /// [`Error::Kernel`]. A record running past the end is [`Error::Truncated`];
    /// events of the records before it have already been delivered.
    pub fn process(&mut self, datagram: &[u8]) -> Result<usize> {
        let mut delivered = 0;
        let mut iter = records(datagram);
        for record in iter.by_ref() {
            match record.header.ty {
                NLMSG_DONE => return Ok(delivered),
                NLMSG_ERROR => {
                    return match error_code(&record) {
                        0 => Ok(delivered),
                        code => Err(Error::Kernel(code)),
                    };
                }
                RTM_NEWLINK | RTM_DELLINK => delivered += usize::from(self.on_link(&record)),
                RTM_NEWADDR | RTM_DELADDR => delivered += usize::from(self.on_addr(&record)),
                _ => {}
            }
        }
        if iter.is_malformed() {
            return Err(Error::Truncated);
        }
        Ok(delivered)
    }

    fn watches(&self, ifindex: u32) -> bool {
        self.interface == ANY_INTERFACE || self.interface == ifindex
    }

    fn on_link(&mut self, record: &Record<'_>) -> bool {
        let Some(link) = LinkRecord::parse(record) else {
            tracing::debug!("short link record");
            return false;
        };
        if link.ty != ARPHRD_PHONET || !self.watches(link.index) {
            return false;
        }

        let state = if link.removed {
            LinkState::Removed
        } else if link.is_up() {
            LinkState::Up
        } else {
            LinkState::Down
        };
        self.states.insert(link.index, state);

        let Some(name) = link.name else {
            return false;
        };
        tracing::debug!(ifindex = link.index, %state, name = %name, "link state");
        (self.callback)(&LinkEvent::Link {
            ifindex: link.index,
            state,
            name,
        });
        true
    }

    fn on_addr(&mut self, record: &Record<'_>) -> bool {
        let Some(addr) = AddrRecord::parse(record) else {
            tracing::debug!("short address record");
            return false;
        };
        // Without Phonet loaded the kernel still sends other families.
        if addr.family != AF_PHONET || !self.watches(addr.index) {
            return false;
        }
        tracing::debug!(
            ifindex = addr.index,
            local = ?addr.local,
            remote = ?addr.remote,
            removed = addr.removed,
            "link address"
        );
        (self.callback)(&LinkEvent::Address {
            ifindex: addr.index,
            local: addr.local,
            remote: addr.remote,
            removed: addr.removed,
        });
        true
    }

    fn on_readable_logged(&mut self) {
        match self.receive() {
            Ok(_) => {}
            Err(Error::Kernel(code)) => {
                tracing::warn!(ifindex = self.interface, code, "netlink error record")
            }
            Err(Error::Truncated) => {
                tracing::warn!(ifindex = self.interface, "netlink message truncated, dropped")
            }
            Err(e) => tracing::warn!(ifindex = self.interface, error = %e, "netlink receive failed"),
        }
    }
}

impl EventSource for LinkMonitor {
    fn watched_fds(&self) -> Vec<RawFd> {
        if self.hung_up {
            Vec::new()
        } else {
            vec![self.fd()]
        }
    }

    fn on_readable(&mut self, _fd: RawFd) {
        self.on_readable_logged();
    }

    fn on_hangup(&mut self, fd: RawFd) {
        self.hung_up = true;
        tracing::warn!(ifindex = self.interface, fd, "routing socket hung up");
    }
}

impl Drop for LinkMonitor {
    fn drop(&mut self) {
        tracing::info!(ifindex = self.interface, "link monitor stopped");
    }
}

impl fmt::Debug for LinkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkMonitor")
            .field("interface", &self.interface)
            .field("fd", &self.fd())
            .field("states", &self.states)
            .field("datagrams", &self.datagrams)
            .finish()
    }
}

// ─── MonitorRegistry ─────────────────────────────────────────────────────────

/// Key of a monitor inside a [`MonitorRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(usize);

/// The link monitors of one reactor thread.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    monitors: Slab<LinkMonitor>,
    /// Keys in start order; lookups prefer the newest.
    order: Vec<usize>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(&mut self, interface: u32, callback: F) -> Result<MonitorId>
    where
        F: FnMut(&LinkEvent) + 'static,
    {
        let monitor = LinkMonitor::start(interface, callback)?;
        Ok(self.insert(monitor))
    }

    pub fn insert(&mut self, monitor: LinkMonitor) -> MonitorId {
        let key = self.monitors.insert(monitor);
        self.order.push(key);
        MonitorId(key)
    }

    /// Stop and drop a monitor. Returns `false` for an unknown id.
    pub fn stop(&mut self, id: MonitorId) -> bool {
        match self.monitors.try_remove(id.0) {
            Some(_) => {
                self.order.retain(|&key| key != id.0);
                true
            }
            None => false,
        }
    }

    /// Most recently started monitor filtering on `ifindex`.
    pub fn by_interface(&self, ifindex: u32) -> Option<MonitorId> {
        self.order
            .iter()
            .rev()
            .copied()
            .find(|&key| self.monitors[key].interface() == ifindex)
            .map(MonitorId)
    }

    pub fn get(&self, id: MonitorId) -> Option<&LinkMonitor> {
        self.monitors.get(id.0)
    }

    pub fn get_mut(&mut self, id: MonitorId) -> Option<&mut LinkMonitor> {
        self.monitors.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Datagrams read by all monitors.
    pub fn datagrams(&self) -> u64 {
        self.monitors.iter().map(|(_, m)| m.datagrams()).sum()
    }

    fn owner_of(&mut self, fd: RawFd) -> Option<&mut LinkMonitor> {
        self.monitors
            .iter_mut()
            .map(|(_, m)| m)
            .find(|m| m.fd() == fd)
    }
}

impl EventSource for MonitorRegistry {
    fn watched_fds(&self) -> Vec<RawFd> {
        self.monitors
            .iter()
            .flat_map(|(_, m)| m.watched_fds())
            .collect()
    }

    fn on_readable(&mut self, fd: RawFd) {
        if let Some(monitor) = self.owner_of(fd) {
            monitor.on_readable_logged();
        }
    }

    fn on_hangup(&mut self, fd: RawFd) {
        if let Some(monitor) = self.owner_of(fd) {
            monitor.on_hangup(fd);
        }
    }
}
