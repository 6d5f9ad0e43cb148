//! # ISI Client
//!
//! Request/response multiplexing and indication delivery for one Phonet
//! resource.
//!
//! A [`Client`] owns a request transport bound to its resource and, while at
//! least one indication type is subscribed, a second transport for broadcast
//! indications. Requests go out as `[transaction id, payload..]`; the first
//! byte of every inbound datagram is either the transaction id (request
//! transport) or the indication type (indication transport).
//!
//! ```text
//!   send_request ──▶ pool.allocate ──▶ writev ──▶ arm deadline
//!                                                    │
//!   on_readable ──▶ slot callback ──(done)──▶ release ◀── on_deadline (empty payload)
//! ```
//!
//! Exactly one terminal event ends a transaction: the final response, the
//! deadline, or [`Client::cancel`]. Whichever comes first releases the id and
//! the others find nothing to deliver to.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use quanta::{Clock, Instant};

use crate::error::{Error, Result};
use crate::pool::TransactionPool;
use crate::reactor::EventSource;
use crate::timeout::TimeoutScheduler;
use crate::transport::{Connector, PhonetConnector, Received, Transport, PN_COMMGR};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Control message announcing the subscribed resources to the communication
/// manager.
pub const PNS_SUBSCRIBED_RESOURCES_IND: u8 = 0x10;

/// Shortest datagram worth dispatching: id/type byte plus one payload byte.
const MIN_DATAGRAM_LEN: usize = 2;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

// ─── Public types ────────────────────────────────────────────────────────────

/// Callback for responses to one request. Return `true` when no further
/// response is expected; `false` keeps the transaction open.
pub type ResponseFn = Box<dyn FnMut(&mut Client, &Message<'_>) -> bool>;

/// Callback for one indication type.
pub type IndicationFn = Box<dyn FnMut(&mut Client, &Message<'_>)>;

/// An inbound response or indication, with the leading id/type byte removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    id: u8,
    object: u16,
    data: &'a [u8],
}

impl<'a> Message<'a> {
    /// Transaction id (responses) or indication type (indications).
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Sender object, `(device << 8) | object`. Zero on timeout.
    pub fn object(&self) -> u16 {
        self.object
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// An empty payload is the timeout notification: the deadline passed
    /// with no response. Real responses always carry at least one byte.
    pub fn is_timeout(&self) -> bool {
        self.data.is_empty()
    }
}

/// Identity of a [`Client`], used to tie handles to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// One outstanding transaction: owning client plus transaction id.
///
/// The generation guards against a stale handle touching a reused id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    client: ClientId,
    id: u8,
    generation: u32,
}

impl RequestHandle {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }
}

/// Per-client traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Requests written in full.
    pub requests_sent: u64,
    /// Responses handed to a request callback.
    pub responses: u64,
    /// Indications handed to a subscriber.
    pub indications: u64,
    /// Transactions ended by their deadline.
    pub timeouts: u64,
    /// Transactions ended by [`Client::cancel`].
    pub cancelled: u64,
    /// Datagrams discarded: too short, foreign resource, or no callback.
    pub dropped: u64,
}

// ─── Internal state ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    callback: Option<ResponseFn>,
    generation: u32,
}

struct Subscriber {
    callback: Option<IndicationFn>,
    serial: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Request,
    Indication,
}

struct Endpoint {
    transport: Box<dyn Transport>,
    hung_up: bool,
}

impl Endpoint {
    fn new(transport: Box<dyn Transport>) -> Self {
        Endpoint {
            transport,
            hung_up: false,
        }
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Transaction multiplexer and indication registry for one resource.
pub struct Client {
    id: ClientId,
    resource: u8,
    connector: Box<dyn Connector>,
    requests: Endpoint,
    indications: Option<Endpoint>,
    pool: TransactionPool,
    slots: Vec<Slot>,
    timeouts: TimeoutScheduler,
    subscribers: Vec<Option<Subscriber>>,
    subscription_count: usize,
    next_serial: u64,
    clock: Clock,
    last_error: i32,
    stats: ClientStats,
}

impl Client {
    /// Create a client on a kernel Phonet socket bound to `resource`.
    pub fn new(resource: u8) -> Result<Self> {
        Self::with_connector(resource, PhonetConnector)
    }

    /// Create a client whose transports come from `connector`.
    pub fn with_connector<C: Connector + 'static>(resource: u8, connector: C) -> Result<Self> {
        let transport = connector.open(resource)?;
        let id = ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
        tracing::info!(resource, client = id.0, "ISI client created");

        Ok(Client {
            id,
            resource,
            connector: Box::new(connector),
            requests: Endpoint::new(transport),
            indications: None,
            pool: TransactionPool::new(),
            slots: (0..256).map(|_| Slot::default()).collect(),
            timeouts: TimeoutScheduler::new(),
            subscribers: (0..256).map(|_| None).collect(),
            subscription_count: 0,
            next_serial: 0,
            clock: Clock::new(),
            last_error: 0,
            stats: ClientStats::default(),
        })
    }

    /// Replace the clock used to arm deadlines. Must be the same clock the
    /// reactor passes to [`EventSource::on_deadline`].
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn resource(&self) -> u8 {
        self.resource
    }

    /// Last asynchronous error as a negative errno, 0 if none occurred.
    /// The only asynchronous error is a transaction timeout.
    pub fn error(&self) -> i32 {
        self.last_error
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    /// Number of transactions in flight.
    pub fn pending(&self) -> usize {
        self.pool.busy_len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count
    }

    /// Whether the broadcast indication transport is open.
    pub fn has_indication_transport(&self) -> bool {
        self.indications.is_some()
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Send `payload` tagged with a fresh transaction id.
    ///
    /// `callback` runs for each response until it returns `true`, or once
    /// with an empty message if `timeout` passes first. A zero `timeout`
    /// waits indefinitely.
    ///
    /// The id is only taken from the pool once the whole frame has been
    /// written, so a failed or short write leaves the pool unchanged.
    pub fn send_request<F>(
        &mut self,
        payload: &[u8],
        timeout: Duration,
        callback: F,
    ) -> Result<RequestHandle>
    where
        F: FnMut(&mut Client, &Message<'_>) -> bool + 'static,
    {
        let id = self.pool.peek().ok_or(Error::Busy)?;

        let expected = payload.len() + 1;
        let written = self.requests.transport.send_frame(id, payload)?;
        if written != expected {
            tracing::warn!(
                resource = self.resource,
                id,
                written,
                expected,
                "short write, request not sent"
            );
            return Err(Error::MessageTooLarge { written, expected });
        }

        let allocated = self.pool.allocate().map_err(|_| Error::Busy)?;
        debug_assert_eq!(allocated, id);

        let slot = &mut self.slots[id as usize];
        slot.callback = Some(Box::new(callback));
        let handle = RequestHandle {
            client: self.id,
            id,
            generation: slot.generation,
        };
        self.timeouts.arm(id, self.clock.now(), timeout);
        self.stats.requests_sent += 1;

        tracing::debug!(resource = self.resource, id, len = payload.len(), "request sent");
        Ok(handle)
    }

    /// Stop waiting for responses to `handle`. No callback runs afterwards.
    ///
    /// Returns `false` if the transaction had already ended or the handle
    /// belongs to another client.
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        if !self.is_pending(handle) {
            return false;
        }
        self.release(handle.id);
        self.stats.cancelled += 1;
        tracing::debug!(resource = self.resource, id = handle.id, "request cancelled");
        true
    }

    /// Whether `handle` still names an in-flight transaction.
    pub fn is_pending(&self, handle: RequestHandle) -> bool {
        handle.client == self.id
            && self.pool.is_busy(handle.id)
            && self.slots[handle.id as usize].generation == handle.generation
    }

    fn release(&mut self, id: u8) {
        let slot = &mut self.slots[id as usize];
        slot.callback = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.timeouts.disarm(id);
        self.pool.release(id);
    }

    /// Invoke the callback of `id`. A callback that cancels or otherwise
    /// ends its own transaction bumps the generation, so it is not
    /// reinstalled afterwards.
    fn deliver_response(&mut self, id: u8, object: u16, data: &[u8], terminal: bool) -> bool {
        let slot = &mut self.slots[id as usize];
        let Some(mut callback) = slot.callback.take() else {
            return false;
        };
        let generation = slot.generation;

        let msg = Message { id, object, data };
        let done = callback(self, &msg);

        if self.slots[id as usize].generation != generation {
            return true;
        }
        if done || terminal {
            self.release(id);
        } else {
            self.slots[id as usize].callback = Some(callback);
        }
        true
    }

    fn fire_timeout(&mut self, id: u8) {
        self.last_error = Error::Timeout.errno();
        self.stats.timeouts += 1;
        tracing::debug!(resource = self.resource, id, "request timed out");
        if !self.deliver_response(id, 0, &[], true) && self.pool.is_busy(id) {
            self.release(id);
        }
    }

    // ── Indications ─────────────────────────────────────────────────────

    /// Subscribe `callback` to indications of type `ty`, replacing any
    /// earlier subscriber of that type.
    ///
    /// The first subscription opens the indication transport and announces
    /// the resource to the communication manager. If the transport cannot
    /// be opened nothing is recorded.
    pub fn subscribe<F>(&mut self, ty: u8, callback: F) -> Result<()>
    where
        F: FnMut(&mut Client, &Message<'_>) + 'static,
    {
        if self.subscribers[ty as usize].is_none() {
            if self.subscription_count == 0 {
                self.open_indications()?;
            }
            self.subscription_count += 1;
        }

        self.next_serial += 1;
        self.subscribers[ty as usize] = Some(Subscriber {
            callback: Some(Box::new(callback)),
            serial: self.next_serial,
        });
        tracing::debug!(resource = self.resource, ty, "indication subscribed");
        Ok(())
    }

    /// Drop the subscriber of `ty`. Removing the last one withdraws the
    /// announcement and closes the indication transport.
    pub fn unsubscribe(&mut self, ty: u8) -> bool {
        if self.subscribers[ty as usize].take().is_none() {
            return false;
        }
        self.subscription_count -= 1;
        if self.subscription_count == 0 {
            self.close_indications();
        }
        tracing::debug!(resource = self.resource, ty, "indication unsubscribed");
        true
    }

    pub fn is_subscribed(&self, ty: u8) -> bool {
        self.subscribers[ty as usize].is_some()
    }

    fn open_indications(&mut self) -> Result<()> {
        let transport = self.connector.open(PN_COMMGR)?;
        let announce = subscribe_message(self.resource);
        if let Err(e) = transport.send(&announce) {
            tracing::warn!(resource = self.resource, error = %e, "subscription announcement failed");
        }
        self.indications = Some(Endpoint::new(transport));
        Ok(())
    }

    fn close_indications(&mut self) {
        if let Some(endpoint) = self.indications.take() {
            if let Err(e) = endpoint.transport.send(&unsubscribe_message()) {
                tracing::warn!(resource = self.resource, error = %e, "unsubscribe announcement failed");
            }
        }
    }

    fn deliver_indication(&mut self, ty: u8, object: u16, data: &[u8]) -> bool {
        let Some(sub) = self.subscribers[ty as usize].as_mut() else {
            return false;
        };
        let Some(mut callback) = sub.callback.take() else {
            return false;
        };
        let serial = sub.serial;

        let msg = Message {
            id: ty,
            object,
            data,
        };
        callback(self, &msg);

        if let Some(sub) = self.subscribers[ty as usize].as_mut() {
            if sub.serial == serial && sub.callback.is_none() {
                sub.callback = Some(callback);
            }
        }
        true
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    fn channel_of(&self, fd: RawFd) -> Option<Channel> {
        if fd == self.requests.transport.as_raw_fd() {
            Some(Channel::Request)
        } else if self
            .indications
            .as_ref()
            .is_some_and(|e| e.transport.as_raw_fd() == fd)
        {
            Some(Channel::Indication)
        } else {
            None
        }
    }

    fn endpoint(&self, channel: Channel) -> Option<&Endpoint> {
        match channel {
            Channel::Request => Some(&self.requests),
            Channel::Indication => self.indications.as_ref(),
        }
    }

    fn endpoint_mut(&mut self, channel: Channel) -> Option<&mut Endpoint> {
        match channel {
            Channel::Request => Some(&mut self.requests),
            Channel::Indication => self.indications.as_mut(),
        }
    }

    /// Read one datagram from `channel`.
    fn read_datagram(&self, channel: Channel) -> io::Result<Option<(BytesMut, Received)>> {
        let Some(endpoint) = self.endpoint(channel) else {
            return Ok(None);
        };
        let len = endpoint.transport.pending_length();
        let mut buf = BytesMut::zeroed(len);
        match endpoint.transport.receive(&mut buf) {
            Ok(received) => Ok(Some((buf, received))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn process(&mut self, channel: Channel) {
        let (buf, received) = match self.read_datagram(channel) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(resource = self.resource, error = %e, "receive failed");
                return;
            }
        };

        let len = received.len.min(buf.len());
        if len < MIN_DATAGRAM_LEN || received.resource != self.resource {
            self.stats.dropped += 1;
            tracing::debug!(
                resource = self.resource,
                from = received.resource,
                len,
                "datagram discarded"
            );
            return;
        }

        let id = buf[0];
        let data = &buf[1..len];

        match channel {
            Channel::Request => {
                if self.deliver_response(id, received.object, data, false) {
                    self.stats.responses += 1;
                } else {
                    self.stats.dropped += 1;
                    tracing::debug!(resource = self.resource, id, "response for idle transaction");
                }
            }
            Channel::Indication => {
                if self.deliver_indication(id, received.object, data) {
                    self.stats.indications += 1;
                } else {
                    self.stats.dropped += 1;
                    tracing::debug!(resource = self.resource, ty = id, "unsubscribed indication");
                }
            }
        }
    }
}

impl EventSource for Client {
    fn watched_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::with_capacity(2);
        if !self.requests.hung_up {
            fds.push(self.requests.transport.as_raw_fd());
        }
        if let Some(endpoint) = &self.indications {
            if !endpoint.hung_up {
                fds.push(endpoint.transport.as_raw_fd());
            }
        }
        fds
    }

    fn on_readable(&mut self, fd: RawFd) {
        match self.channel_of(fd) {
            Some(channel) => self.process(channel),
            None => tracing::debug!(resource = self.resource, fd, "readiness on unknown descriptor"),
        }
    }

    fn on_hangup(&mut self, fd: RawFd) {
        let resource = self.resource;
        if let Some(channel) = self.channel_of(fd) {
            if let Some(endpoint) = self.endpoint_mut(channel) {
                endpoint.hung_up = true;
            }
            tracing::warn!(resource, fd, ?channel, "unexpected event on Phonet channel");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.next_deadline()
    }

    fn on_deadline(&mut self, now: Instant) {
        while let Some(id) = self.timeouts.pop_expired(now) {
            self.fire_timeout(id);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Pending callbacks are abandoned, never invoked.
        self.timeouts.clear();
        if self.subscription_count > 0 {
            self.close_indications();
        }
        tracing::debug!(
            resource = self.resource,
            abandoned = self.pool.busy_len(),
            "ISI client destroyed"
        );
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("pending", &self.pool.busy_len())
            .field("subscriptions", &self.subscription_count)
            .finish()
    }
}

// ─── Control messages ────────────────────────────────────────────────────────

/// Announcement that `resource` wants indications.
pub fn subscribe_message(resource: u8) -> [u8; 4] {
    [0, PNS_SUBSCRIBED_RESOURCES_IND, 1, resource]
}

/// Announcement clearing every subscription of the sender.
pub fn unsubscribe_message() -> [u8; 3] {
    [0, PNS_SUBSCRIBED_RESOURCES_IND, 0]
}
