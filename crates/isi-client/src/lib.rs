//! # isi-client
//!
//! Phonet ISI transport for modem control traffic.
//!
//! Each [`Client`] talks to one modem resource over a datagram socket,
//! multiplexing up to 254 concurrent request/response transactions by a
//! one-byte transaction id, delivering subscribed broadcast indications, and
//! timing out transactions that never complete. Everything runs on one
//! reactor thread; see [`reactor`] for the contract with the host loop.
//!
//! ## Crate structure
//!
//! - [`transport`]: `AF_PHONET` socket framing and the `Transport` seam
//! - [`pool`]: O(1) transaction id allocator
//! - [`timeout`]: per-transaction deadlines
//! - [`client`]: request/response multiplexer and indication registry
//! - [`reactor`]: `EventSource` contract and a `poll(2)` event loop
//! - [`config`]: TOML configuration for hosts
//! - [`error`]: error taxonomy

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod timeout;
pub mod transport;

pub use client::{Client, ClientId, ClientStats, IndicationFn, Message, RequestHandle, ResponseFn};
pub use error::{Error, Result};
pub use reactor::{EventLoop, EventSource, SourceId};
pub use transport::{Connector, PhonetConnector, PhonetTransport, Received, Transport};
