//! # Routing Message Codec
//!
//! Just enough rtnetlink to follow Phonet links: record and attribute
//! iteration, the link/address/route payload headers, and a builder for the
//! three requests this crate emits.
//!
//! ```text
//!  nlmsghdr (16)          payload header            attributes (TLV, 4-aligned)
//! +-----+----+-----+---+---+------------------------+-------+------+------+---
//! | len | ty |flags|seq|pid| ifinfomsg / ifaddrmsg  | rta_len rta_ty | data | ..
//! +-----+----+-----+---+---+ / rtmsg / nlmsgerr      +-------+------+------+---
//! ```
//!
//! Everything is host byte order. Parsing never panics on malformed input:
//! a record or attribute whose length field is out of bounds ends iteration.

use bytes::{Buf, BufMut, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

pub const NLMSG_HDRLEN: usize = 16;
pub const RTA_HDRLEN: usize = 4;
pub const IFINFOMSG_LEN: usize = 16;
pub const IFADDRMSG_LEN: usize = 8;
pub const RTMSG_LEN: usize = 12;

/// Receive buffer size, also requested as the socket's `SO_RCVBUF`.
pub const SIZE_NLMSG: usize = 16384;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;

pub const NLM_F_REQUEST: u16 = 0x001;
pub const NLM_F_ACK: u16 = 0x004;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

pub const IFLA_IFNAME: u16 = 3;
pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;
pub const RTA_DST: u16 = 1;
pub const RTA_OIF: u16 = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

pub const IFF_UP: u32 = 0x1;
pub const IFF_RUNNING: u32 = 0x40;
pub const IFF_LOWER_UP: u32 = 0x1_0000;
/// Flags that must all be set for a link to count as up.
pub const IFF_LINK_UP: u32 = IFF_UP | IFF_RUNNING | IFF_LOWER_UP;

pub const ARPHRD_PHONET: u16 = 820;
pub const AF_UNSPEC: u8 = 0;
pub const AF_PHONET: u8 = isi_client::transport::AF_PHONET as u8;

pub const RT_TABLE_MAIN: u8 = 254;
pub const RTPROT_STATIC: u8 = 4;
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RTN_UNICAST: u8 = 1;

/// Prefix length of a Phonet route: device addresses are 6 bits wide.
pub const PHONET_DST_LEN: u8 = 6;

pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

// ─── Message header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NlMsgHdr {
    pub len: u32,
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHdr {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_ne(self.len);
        buf.put_u16_ne(self.ty);
        buf.put_u16_ne(self.flags);
        buf.put_u32_ne(self.seq);
        buf.put_u32_ne(self.pid);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < NLMSG_HDRLEN {
            return None;
        }
        Some(NlMsgHdr {
            len: buf.get_u32_ne(),
            ty: buf.get_u16_ne(),
            flags: buf.get_u16_ne(),
            seq: buf.get_u32_ne(),
            pid: buf.get_u32_ne(),
        })
    }
}

/// One record of a multi-part datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub header: NlMsgHdr,
    /// Bytes after the header, up to `header.len`.
    pub payload: &'a [u8],
}

/// Iterator over the records of one datagram.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    rest: &'a [u8],
    malformed: bool,
}

pub fn records(buf: &[u8]) -> Records<'_> {
    Records {
        rest: buf,
        malformed: false,
    }
}

impl<'a> Records<'a> {
    /// Whether iteration stopped at a record whose length did not fit.
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        if self.rest.is_empty() {
            return None;
        }
        let mut cursor = self.rest;
        let Some(header) = NlMsgHdr::decode(&mut cursor) else {
            // Tail too short for a header.
            self.malformed = true;
            self.rest = &[];
            return None;
        };
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > self.rest.len() {
            self.malformed = true;
            self.rest = &[];
            return None;
        }
        let payload = &self.rest[NLMSG_HDRLEN..len];
        let step = nlmsg_align(len).min(self.rest.len());
        self.rest = &self.rest[step..];
        Some(Record { header, payload })
    }
}

// ─── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr<'a> {
    pub ty: u16,
    pub data: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct Attrs<'a> {
    rest: &'a [u8],
}

pub fn attrs(buf: &[u8]) -> Attrs<'_> {
    Attrs { rest: buf }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Attr<'a>> {
        if self.rest.len() < RTA_HDRLEN {
            return None;
        }
        let mut cursor = self.rest;
        let len = cursor.get_u16_ne() as usize;
        let ty = cursor.get_u16_ne() & NLA_TYPE_MASK;
        if len < RTA_HDRLEN || len > self.rest.len() {
            self.rest = &[];
            return None;
        }
        let data = &self.rest[RTA_HDRLEN..len];
        let step = nlmsg_align(len).min(self.rest.len());
        self.rest = &self.rest[step..];
        Some(Attr { ty, data })
    }
}

// ─── Payload headers ─────────────────────────────────────────────────────────

/// `struct ifinfomsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IfInfoMsg {
    pub family: u8,
    pub ty: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

impl IfInfoMsg {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.family);
        buf.put_u8(0);
        buf.put_u16_ne(self.ty);
        buf.put_i32_ne(self.index);
        buf.put_u32_ne(self.flags);
        buf.put_u32_ne(self.change);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < IFINFOMSG_LEN {
            return None;
        }
        let family = buf.get_u8();
        buf.advance(1);
        Some(IfInfoMsg {
            family,
            ty: buf.get_u16_ne(),
            index: buf.get_i32_ne(),
            flags: buf.get_u32_ne(),
            change: buf.get_u32_ne(),
        })
    }
}

/// `struct ifaddrmsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IfAddrMsg {
    pub family: u8,
    pub prefixlen: u8,
    pub flags: u8,
    pub scope: u8,
    pub index: u32,
}

impl IfAddrMsg {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.family);
        buf.put_u8(self.prefixlen);
        buf.put_u8(self.flags);
        buf.put_u8(self.scope);
        buf.put_u32_ne(self.index);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < IFADDRMSG_LEN {
            return None;
        }
        Some(IfAddrMsg {
            family: buf.get_u8(),
            prefixlen: buf.get_u8(),
            flags: buf.get_u8(),
            scope: buf.get_u8(),
            index: buf.get_u32_ne(),
        })
    }
}

/// `struct rtmsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtMsg {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub kind: u8,
    pub flags: u32,
}

impl RtMsg {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.family);
        buf.put_u8(self.dst_len);
        buf.put_u8(self.src_len);
        buf.put_u8(self.tos);
        buf.put_u8(self.table);
        buf.put_u8(self.protocol);
        buf.put_u8(self.scope);
        buf.put_u8(self.kind);
        buf.put_u32_ne(self.flags);
    }
}

// ─── Decoded records ─────────────────────────────────────────────────────────

/// A `RTM_NEWLINK`/`RTM_DELLINK` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub index: u32,
    pub ty: u16,
    pub flags: u32,
    pub removed: bool,
    pub name: Option<String>,
}

impl LinkRecord {
    /// `None` if the record is not a link record or its header is short.
    pub fn parse(record: &Record<'_>) -> Option<Self> {
        let removed = match record.header.ty {
            RTM_NEWLINK => false,
            RTM_DELLINK => true,
            _ => return None,
        };
        let mut payload = record.payload;
        let ifi = IfInfoMsg::decode(&mut payload)?;
        let name = attrs(payload)
            .filter(|a| a.ty == IFLA_IFNAME)
            .last()
            .map(|a| c_string(a.data));
        Some(LinkRecord {
            index: ifi.index as u32,
            ty: ifi.ty,
            flags: ifi.flags,
            removed,
            name,
        })
    }

    /// All of up, running and lower-layer-up are set.
    pub fn is_up(&self) -> bool {
        self.flags & IFF_LINK_UP == IFF_LINK_UP
    }
}

/// A `RTM_NEWADDR`/`RTM_DELADDR` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRecord {
    pub family: u8,
    pub index: u32,
    pub removed: bool,
    pub local: Option<u8>,
    pub remote: Option<u8>,
}

impl AddrRecord {
    pub fn parse(record: &Record<'_>) -> Option<Self> {
        let removed = match record.header.ty {
            RTM_NEWADDR => false,
            RTM_DELADDR => true,
            _ => return None,
        };
        let mut payload = record.payload;
        let ifa = IfAddrMsg::decode(&mut payload)?;
        let mut local = None;
        let mut remote = None;
        for attr in attrs(payload) {
            match (attr.ty, attr.data.first()) {
                (IFA_LOCAL, Some(&b)) => local = Some(b),
                (IFA_ADDRESS, Some(&b)) => remote = Some(b),
                _ => {}
            }
        }
        Some(AddrRecord {
            family: ifa.family,
            index: ifa.index,
            removed,
            local,
            remote,
        })
    }
}

/// Error code of an `NLMSG_ERROR` record: 0 for an ack, else a negative
/// errno. A payload too short to hold the code reads as `-EIO`.
pub fn error_code(record: &Record<'_>) -> i32 {
    let mut payload = record.payload;
    if payload.remaining() < 4 {
        return -libc::EIO;
    }
    payload.get_i32_ne()
}

/// First terminal record of an acknowledgement datagram: `Some(0)` for
/// `NLMSG_DONE`, `Some(code)` for `NLMSG_ERROR`, `None` if neither appears.
pub fn find_ack(buf: &[u8]) -> Option<i32> {
    for record in records(buf) {
        match record.header.ty {
            NLMSG_DONE => return Some(0),
            NLMSG_ERROR => return Some(error_code(&record)),
            _ => {}
        }
    }
    None
}

fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Builds one netlink message: header, fixed payload header, attributes.
/// The length field is patched in [`finish`](Self::finish).
#[derive(Debug)]
pub struct MessageBuilder {
    buf: BytesMut,
}

impl MessageBuilder {
    pub fn new(ty: u16, flags: u16, seq: u32, pid: u32) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        NlMsgHdr {
            len: 0,
            ty,
            flags,
            seq,
            pid,
        }
        .encode(&mut buf);
        MessageBuilder { buf }
    }

    pub fn link(mut self, ifi: &IfInfoMsg) -> Self {
        ifi.encode(&mut self.buf);
        self
    }

    pub fn addr(mut self, ifa: &IfAddrMsg) -> Self {
        ifa.encode(&mut self.buf);
        self
    }

    pub fn route(mut self, rtm: &RtMsg) -> Self {
        rtm.encode(&mut self.buf);
        self
    }

    /// Raw payload bytes, padded to alignment.
    pub fn raw(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self.pad();
        self
    }

    pub fn attr(mut self, ty: u16, data: &[u8]) -> Self {
        self.buf.put_u16_ne((RTA_HDRLEN + data.len()) as u16);
        self.buf.put_u16_ne(ty);
        self.buf.put_slice(data);
        self.pad();
        self
    }

    pub fn finish(mut self) -> BytesMut {
        let len = (self.buf.len() as u32).to_ne_bytes();
        self.buf[..4].copy_from_slice(&len);
        self.buf
    }

    fn pad(&mut self) {
        let padded = nlmsg_align(self.buf.len());
        self.buf.resize(padded, 0);
    }
}

/// Dump request for every Phonet link.
pub fn getlink_request(seq: u32, pid: u32) -> BytesMut {
    MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST | NLM_F_ROOT | NLM_F_MATCH, seq, pid)
        .link(&IfInfoMsg {
            family: AF_UNSPEC,
            ty: ARPHRD_PHONET,
            change: 0xffff_ffff,
            ..Default::default()
        })
        .finish()
}

/// Assign local Phonet device address `local` to `ifindex`.
pub fn newaddr_request(seq: u32, pid: u32, ifindex: u32, local: u8) -> BytesMut {
    MessageBuilder::new(RTM_NEWADDR, NLM_F_REQUEST | NLM_F_ACK, seq, pid)
        .addr(&IfAddrMsg {
            family: AF_PHONET,
            index: ifindex,
            ..Default::default()
        })
        .attr(IFA_LOCAL, &[local])
        .finish()
}

/// Route Phonet device `remote` through `ifindex`.
pub fn newroute_request(seq: u32, pid: u32, ifindex: u32, remote: u8) -> BytesMut {
    MessageBuilder::new(
        RTM_NEWROUTE,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_APPEND,
        seq,
        pid,
    )
    .route(&RtMsg {
        family: AF_PHONET,
        dst_len: PHONET_DST_LEN,
        table: RT_TABLE_MAIN,
        protocol: RTPROT_STATIC,
        scope: RT_SCOPE_UNIVERSE,
        kind: RTN_UNICAST,
        ..Default::default()
    })
    .attr(RTA_DST, &[remote])
    .attr(RTA_OIF, &ifindex.to_ne_bytes())
    .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_msg(ty: u16, index: i32, flags: u32, name: Option<&str>) -> BytesMut {
        let mut b = MessageBuilder::new(ty, 0, 1, 0).link(&IfInfoMsg {
            ty: ARPHRD_PHONET,
            index,
            flags,
            ..Default::default()
        });
        if let Some(name) = name {
            let mut data = name.as_bytes().to_vec();
            data.push(0);
            b = b.attr(IFLA_IFNAME, &data);
        }
        b.finish()
    }

    #[test]
    fn request_lengths() {
        assert_eq!(getlink_request(1, 0).len(), 32);
        assert_eq!(newaddr_request(1, 0, 3, 0x6C).len(), 32);
        assert_eq!(newroute_request(1, 0, 3, 0x00).len(), 44);
    }

    #[test]
    fn getlink_request_layout() {
        let buf = getlink_request(7, 42);
        let rec = records(&buf).next().unwrap();
        assert_eq!(rec.header.ty, RTM_GETLINK);
        assert_eq!(rec.header.flags, NLM_F_REQUEST | NLM_F_ROOT | NLM_F_MATCH);
        assert_eq!(rec.header.seq, 7);
        assert_eq!(rec.header.pid, 42);
        let ifi = IfInfoMsg::decode(&mut &rec.payload[..]).unwrap();
        assert_eq!(ifi.ty, ARPHRD_PHONET);
        assert_eq!(ifi.family, AF_UNSPEC);
        assert_eq!(ifi.change, 0xffff_ffff);
    }

    #[test]
    fn newroute_request_attributes() {
        let buf = newroute_request(1, 0, 9, 0x6C);
        let rec = records(&buf).next().unwrap();
        assert_eq!(
            rec.header.flags,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_APPEND
        );
        assert_eq!(rec.payload[0], AF_PHONET);
        assert_eq!(rec.payload[1], PHONET_DST_LEN);
        assert_eq!(rec.payload[4], RT_TABLE_MAIN);
        let found: Vec<_> = attrs(&rec.payload[RTMSG_LEN..]).collect();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], Attr { ty: RTA_DST, data: &[0x6C] });
        assert_eq!(found[1].ty, RTA_OIF);
        assert_eq!(found[1].data, &9u32.to_ne_bytes());
    }

    #[test]
    fn parses_link_record_with_name() {
        let buf = link_msg(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0"));
        let rec = records(&buf).next().unwrap();
        let link = LinkRecord::parse(&rec).unwrap();
        assert_eq!(link.index, 4);
        assert_eq!(link.name.as_deref(), Some("phonet0"));
        assert!(link.is_up());
        assert!(!link.removed);
    }

    #[test]
    fn partial_flags_are_not_up() {
        let buf = link_msg(RTM_NEWLINK, 4, IFF_UP | IFF_RUNNING, None);
        let rec = records(&buf).next().unwrap();
        let link = LinkRecord::parse(&rec).unwrap();
        assert!(!link.is_up());
        assert_eq!(link.name, None);
    }

    #[test]
    fn parses_addr_record() {
        let buf = MessageBuilder::new(RTM_NEWADDR, 0, 0, 0)
            .addr(&IfAddrMsg {
                family: AF_PHONET,
                index: 4,
                ..Default::default()
            })
            .attr(IFA_LOCAL, &[0x6C])
            .attr(IFA_ADDRESS, &[0x10])
            .finish();
        let rec = records(&buf).next().unwrap();
        let addr = AddrRecord::parse(&rec).unwrap();
        assert_eq!(addr.local, Some(0x6C));
        assert_eq!(addr.remote, Some(0x10));
        assert_eq!(addr.index, 4);
    }

    #[test]
    fn iterates_multipart_datagram() {
        let mut buf = link_msg(RTM_NEWLINK, 1, 0, Some("a"));
        buf.extend_from_slice(&link_msg(RTM_DELLINK, 2, 0, Some("b")));
        buf.extend_from_slice(&MessageBuilder::new(NLMSG_DONE, 0, 0, 0).raw(&0i32.to_ne_bytes()).finish());
        let types: Vec<u16> = records(&buf).map(|r| r.header.ty).collect();
        assert_eq!(types, vec![RTM_NEWLINK, RTM_DELLINK, NLMSG_DONE]);
    }

    #[test]
    fn overlong_record_stops_iteration() {
        let mut buf = link_msg(RTM_NEWLINK, 1, 0, Some("a"));
        let bogus = (buf.len() as u32 + 100).to_ne_bytes();
        buf[..4].copy_from_slice(&bogus);
        let mut it = records(&buf);
        assert!(it.next().is_none());
        assert!(it.is_malformed());
    }

    #[test]
    fn short_tail_is_malformed() {
        let mut buf = link_msg(RTM_NEWLINK, 1, 0, Some("a")).to_vec();
        buf.extend_from_slice(&[0; 8]);
        let mut it = records(&buf);
        assert!(it.next().is_some());
        assert!(it.next().is_none());
        assert!(it.is_malformed());

        let mut it = records(&buf[..10]);
        assert!(it.next().is_none());
        assert!(it.is_malformed());

        assert!(!records(&[]).is_malformed());
    }

    #[test]
    fn ack_codes() {
        let done = MessageBuilder::new(NLMSG_DONE, 0, 0, 0).finish();
        assert_eq!(find_ack(&done), Some(0));

        let err = MessageBuilder::new(NLMSG_ERROR, 0, 0, 0)
            .raw(&(-libc::EEXIST).to_ne_bytes())
            .finish();
        assert_eq!(find_ack(&err), Some(-libc::EEXIST));

        let short = MessageBuilder::new(NLMSG_ERROR, 0, 0, 0).finish();
        assert_eq!(find_ack(&short), Some(-libc::EIO));

        let noise = link_msg(RTM_NEWLINK, 1, 0, None);
        assert_eq!(find_ack(&noise), None);
        assert_eq!(find_ack(&[]), None);
    }
}
