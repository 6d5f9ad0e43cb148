//! # isi-netlink
//!
//! Phonet link tracking and configuration over rtnetlink.
//!
//! A [`LinkMonitor`] reports up/down/removed transitions and address
//! changes of Phonet interfaces; [`config_request`] assigns device addresses
//! and routes with a synchronous kernel acknowledgement.
//!
//! ## Crate structure
//!
//! - [`wire`]: rtnetlink record/attribute codec and request builders
//! - [`socket`]: routing sockets, interface bring-up and lookup
//! - [`monitor`]: link state machine and the per-thread registry
//! - [`config_request`]: address and route configuration
//! - [`error`]: error taxonomy

pub mod config_request;
pub mod error;
pub mod monitor;
pub mod socket;
pub mod wire;

pub use config_request::{add_route, set_local_address};
pub use error::{Error, Result};
pub use monitor::{LinkEvent, LinkMonitor, LinkState, MonitorId, MonitorRegistry, ANY_INTERFACE};
pub use socket::{Datagram, NetlinkSocket, RouteSocket};
