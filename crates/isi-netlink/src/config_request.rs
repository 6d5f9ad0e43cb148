//! Phonet address and route configuration.
//!
//! Each call opens a one-shot routing socket, sends a single request and
//! blocks until the kernel acknowledges it. These run once per interface at
//! bring-up, never on the message path.

use isi_client::transport::{PN_DEV_HOST, PN_DEV_PC, PN_DEV_SOS};

use crate::error::{Error, Result};
use crate::socket::{NetlinkSocket, RouteSocket};
use crate::wire::{find_ack, newaddr_request, newroute_request, SIZE_NLMSG};

/// Assign local device address `local` to `ifindex`.
///
/// `local` must be [`PN_DEV_PC`] or [`PN_DEV_SOS`].
pub fn set_local_address(ifindex: u32, local: u8) -> Result<()> {
    check_local(ifindex, local)?;
    let socket = NetlinkSocket::open()?;
    request(&socket, &newaddr_request(1, std::process::id(), ifindex, local))
}

/// Route remote device `remote` through `ifindex`.
///
/// `remote` must be [`PN_DEV_SOS`] or [`PN_DEV_HOST`].
pub fn add_route(ifindex: u32, remote: u8) -> Result<()> {
    check_remote(ifindex, remote)?;
    let socket = NetlinkSocket::open()?;
    request(&socket, &newroute_request(1, std::process::id(), ifindex, remote))
}

pub fn check_local(ifindex: u32, local: u8) -> Result<()> {
    if ifindex == 0 {
        return Err(Error::NoDevice);
    }
    if local != PN_DEV_PC && local != PN_DEV_SOS {
        return Err(Error::InvalidArgument("local address must be PC or SOS"));
    }
    Ok(())
}

pub fn check_remote(ifindex: u32, remote: u8) -> Result<()> {
    if ifindex == 0 {
        return Err(Error::NoDevice);
    }
    if remote != PN_DEV_SOS && remote != PN_DEV_HOST {
        return Err(Error::InvalidArgument("remote address must be SOS or host"));
    }
    Ok(())
}

/// Send `message` on `socket` and wait for the acknowledgement.
pub fn request<S: RouteSocket + ?Sized>(socket: &S, message: &[u8]) -> Result<()> {
    socket.send(message)?;
    let ack = wait_ack(socket);
    match &ack {
        Ok(()) => tracing::debug!("netlink request acknowledged"),
        Err(e) => tracing::warn!(error = %e, "netlink request failed"),
    }
    ack
}

/// Block for one datagram and interpret its terminal record.
///
/// A truncated datagram, or one without `NLMSG_DONE`/`NLMSG_ERROR`, is an
/// I/O failure.
pub fn wait_ack<S: RouteSocket + ?Sized>(socket: &S) -> Result<()> {
    let mut buf = vec![0u8; SIZE_NLMSG];
    let datagram = socket.recv(&mut buf)?;
    if datagram.truncated {
        return Err(Error::Truncated);
    }
    match find_ack(&buf[..datagram.len.min(buf.len())]) {
        Some(0) => Ok(()),
        Some(code) => Err(Error::Kernel(code)),
        None => Err(Error::Protocol("no acknowledgement record")),
    }
}
