//! Link monitor and configuration requests against a scripted routing socket.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::rc::Rc;

use isi_client::reactor::EventSource;
use isi_client::transport::{PN_DEV_HOST, PN_DEV_SOS};
use isi_netlink::config_request::request;
use isi_netlink::wire::*;
use isi_netlink::{Datagram, Error, LinkEvent, LinkMonitor, LinkState, MonitorRegistry, RouteSocket, ANY_INTERFACE};

// ────────────────────────────────────────────────────────────────
// Scripted socket
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    inbox: VecDeque<(Vec<u8>, bool)>,
    sent: Vec<Vec<u8>>,
}

#[derive(Clone)]
struct ScriptedSocket {
    sock: Rc<UnixDatagram>,
    script: Rc<RefCell<Script>>,
}

impl ScriptedSocket {
    fn new() -> Self {
        let (sock, _) = UnixDatagram::pair().unwrap();
        ScriptedSocket {
            sock: Rc::new(sock),
            script: Rc::default(),
        }
    }

    fn push(&self, datagram: Vec<u8>) {
        self.script.borrow_mut().inbox.push_back((datagram, false));
    }

    fn push_truncated(&self, datagram: Vec<u8>) {
        self.script.borrow_mut().inbox.push_back((datagram, true));
    }
}

impl RouteSocket for ScriptedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.script.borrow_mut().sent.push(data.to_vec());
        Ok(data.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        let (data, truncated) = self
            .script
            .borrow_mut()
            .inbox
            .pop_front()
            .ok_or(io::ErrorKind::WouldBlock)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Datagram { len, truncated })
    }
}

// ────────────────────────────────────────────────────────────────
// Record builders
// ────────────────────────────────────────────────────────────────

fn link(ty: u16, index: i32, flags: u32, name: Option<&str>) -> Vec<u8> {
    link_of_type(ty, ARPHRD_PHONET, index, flags, name)
}

fn link_of_type(ty: u16, hw: u16, index: i32, flags: u32, name: Option<&str>) -> Vec<u8> {
    let mut b = MessageBuilder::new(ty, 0, 0, 0).link(&IfInfoMsg {
        ty: hw,
        index,
        flags,
        ..Default::default()
    });
    if let Some(name) = name {
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        b = b.attr(IFLA_IFNAME, &data);
    }
    b.finish().to_vec()
}

fn addr(ty: u16, family: u8, index: u32, local: u8) -> Vec<u8> {
    MessageBuilder::new(ty, 0, 0, 0)
        .addr(&IfAddrMsg {
            family,
            index,
            ..Default::default()
        })
        .attr(IFA_LOCAL, &[local])
        .finish()
        .to_vec()
}

fn error(code: i32) -> Vec<u8> {
    MessageBuilder::new(NLMSG_ERROR, 0, 0, 0)
        .raw(&code.to_ne_bytes())
        .finish()
        .to_vec()
}

fn done() -> Vec<u8> {
    MessageBuilder::new(NLMSG_DONE, 0, 0, 0)
        .raw(&0i32.to_ne_bytes())
        .finish()
        .to_vec()
}

type Events = Rc<RefCell<Vec<LinkEvent>>>;

fn monitor(interface: u32) -> (LinkMonitor, ScriptedSocket, Events) {
    let socket = ScriptedSocket::new();
    let events: Events = Rc::default();
    let e = events.clone();
    let monitor = LinkMonitor::with_socket(interface, socket.clone(), move |ev| {
        e.borrow_mut().push(ev.clone())
    })
    .unwrap();
    (monitor, socket, events)
}

fn states(events: &Events) -> Vec<(u32, LinkState)> {
    events
        .borrow()
        .iter()
        .filter_map(|e| match e {
            LinkEvent::Link { ifindex, state, .. } => Some((*ifindex, *state)),
            _ => None,
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────
// 1. Start-up
// ────────────────────────────────────────────────────────────────

#[test]
fn start_requests_phonet_link_dump() {
    let (_monitor, socket, _) = monitor(ANY_INTERFACE);
    let sent = socket.script.borrow().sent.clone();
    assert_eq!(sent.len(), 1);
    let rec = records(&sent[0]).next().unwrap();
    assert_eq!(rec.header.ty, RTM_GETLINK);
    let ifi = IfInfoMsg::decode(&mut &rec.payload[..]).unwrap();
    assert_eq!(ifi.ty, ARPHRD_PHONET);
}

// ────────────────────────────────────────────────────────────────
// 2. Link state
// ────────────────────────────────────────────────────────────────

#[test]
fn deleted_link_is_removed() {
    let (mut monitor, _, events) = monitor(4);
    monitor.process(&link(RTM_DELLINK, 4, IFF_LINK_UP, Some("phonet0"))).unwrap();
    assert_eq!(states(&events), vec![(4, LinkState::Removed)]);
    assert_eq!(monitor.state(4), Some(LinkState::Removed));
}

#[test]
fn all_three_flags_mean_up() {
    let (mut monitor, _, events) = monitor(4);
    monitor.process(&link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0"))).unwrap();
    assert_eq!(states(&events), vec![(4, LinkState::Up)]);
    match &events.borrow()[0] {
        LinkEvent::Link { name, .. } => assert_eq!(name, "phonet0"),
        other => panic!("unexpected event {other:?}"),
    };
}

#[test]
fn any_missing_flag_means_down() {
    let (mut monitor, _, events) = monitor(4);
    for missing in [IFF_UP, IFF_RUNNING, IFF_LOWER_UP] {
        monitor
            .process(&link(RTM_NEWLINK, 4, IFF_LINK_UP & !missing, Some("phonet0")))
            .unwrap();
    }
    assert_eq!(states(&events), vec![(4, LinkState::Down); 3]);
}

#[test]
fn link_without_name_updates_state_silently() {
    let (mut monitor, _, events) = monitor(4);
    assert_eq!(monitor.process(&link(RTM_NEWLINK, 4, IFF_LINK_UP, None)).unwrap(), 0);
    assert!(events.borrow().is_empty());
    assert_eq!(monitor.state(4), Some(LinkState::Up));
}

#[test]
fn foreign_links_are_ignored() {
    let (mut monitor, _, events) = monitor(4);
    monitor.process(&link(RTM_NEWLINK, 5, IFF_LINK_UP, Some("phonet1"))).unwrap();
    monitor
        .process(&link_of_type(RTM_NEWLINK, 1, 4, IFF_LINK_UP, Some("eth0")))
        .unwrap();
    assert!(events.borrow().is_empty());
}

#[test]
fn wildcard_reports_every_phonet_link() {
    let (mut monitor, _, events) = monitor(ANY_INTERFACE);
    let mut dump = link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0"));
    dump.extend(link(RTM_NEWLINK, 7, 0, Some("phonet1")));
    dump.extend(done());
    assert_eq!(monitor.process(&dump).unwrap(), 2);
    assert_eq!(states(&events), vec![(4, LinkState::Up), (7, LinkState::Down)]);
}

// ────────────────────────────────────────────────────────────────
// 3. Addresses
// ────────────────────────────────────────────────────────────────

#[test]
fn phonet_address_is_reported() {
    let (mut monitor, _, events) = monitor(4);
    monitor.process(&addr(RTM_NEWADDR, AF_PHONET, 4, PN_DEV_SOS)).unwrap();
    monitor.process(&addr(RTM_DELADDR, AF_PHONET, 4, PN_DEV_SOS)).unwrap();
    assert_eq!(
        *events.borrow(),
        vec![
            LinkEvent::Address {
                ifindex: 4,
                local: Some(PN_DEV_SOS),
                remote: None,
                removed: false
            },
            LinkEvent::Address {
                ifindex: 4,
                local: Some(PN_DEV_SOS),
                remote: None,
                removed: true
            },
        ]
    );
}

#[test]
fn family_mismatch_yields_no_callback() {
    let (mut monitor, _, events) = monitor(4);
    monitor
        .process(&addr(RTM_NEWADDR, libc::AF_INET as u8, 4, 1))
        .unwrap();
    monitor.process(&addr(RTM_NEWADDR, AF_PHONET, 9, 1)).unwrap();
    assert!(events.borrow().is_empty());
}

// ────────────────────────────────────────────────────────────────
// 4. Malformed and control records
// ────────────────────────────────────────────────────────────────

#[test]
fn truncated_datagram_yields_no_callback() {
    let (mut monitor, socket, events) = monitor(4);
    socket.push_truncated(link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0")));
    assert!(matches!(monitor.receive(), Err(Error::Truncated)));
    assert!(events.borrow().is_empty());
}

#[test]
fn truncated_record_yields_no_callback() {
    let (mut monitor, _, events) = monitor(4);
    let full = link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0"));
    let cut = &full[..full.len() - 6];
    assert!(matches!(monitor.process(cut), Err(Error::Truncated)));
    assert!(events.borrow().is_empty());

    // A record too short for its ifinfomsg is skipped.
    let stub = MessageBuilder::new(RTM_NEWLINK, 0, 0, 0).raw(&[0; 4]).finish();
    assert_eq!(monitor.process(&stub).unwrap(), 0);
}

#[test]
fn datagram_ending_inside_a_header_is_truncated() {
    let (mut monitor, _, events) = monitor(4);
    let full = link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0"));
    assert!(matches!(monitor.process(&full[..10]), Err(Error::Truncated)));
    assert!(events.borrow().is_empty());

    // Records before the stray tail are still delivered.
    let mut tailed = full.clone();
    tailed.extend_from_slice(&[0; 8]);
    assert!(matches!(monitor.process(&tailed), Err(Error::Truncated)));
    assert_eq!(states(&events), vec![(4, LinkState::Up)]);
}

#[test]
fn error_record_aborts_datagram() {
    let (mut monitor, _, events) = monitor(4);
    let mut datagram = error(-libc::EPERM);
    datagram.extend(link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0")));
    assert!(matches!(
        monitor.process(&datagram),
        Err(Error::Kernel(code)) if code == -libc::EPERM
    ));
    assert!(events.borrow().is_empty());

    let mut ack_then_link = error(0);
    ack_then_link.extend(link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0")));
    assert_eq!(monitor.process(&ack_then_link).unwrap(), 0);
}

#[test]
fn done_record_stops_processing() {
    let (mut monitor, _, events) = monitor(4);
    let mut datagram = link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0"));
    datagram.extend(done());
    datagram.extend(link(RTM_DELLINK, 4, 0, Some("phonet0")));
    assert_eq!(monitor.process(&datagram).unwrap(), 1);
    assert_eq!(states(&events), vec![(4, LinkState::Up)]);
}

// ────────────────────────────────────────────────────────────────
// 5. Registry as event source
// ────────────────────────────────────────────────────────────────

#[test]
fn registry_dispatches_by_descriptor() {
    let (a, sock_a, events_a) = monitor(4);
    let (b, sock_b, events_b) = monitor(7);
    let mut registry = MonitorRegistry::new();
    let id_a = registry.insert(a);
    registry.insert(b);

    let fds = registry.watched_fds();
    assert_eq!(fds.len(), 2);

    sock_b.push(link(RTM_NEWLINK, 7, IFF_LINK_UP, Some("phonet1")));
    registry.on_readable(sock_b.as_raw_fd());
    assert!(events_a.borrow().is_empty());
    assert_eq!(states(&events_b), vec![(7, LinkState::Up)]);

    registry.on_hangup(sock_a.as_raw_fd());
    assert_eq!(registry.watched_fds(), vec![sock_b.as_raw_fd()]);

    assert_eq!(registry.by_interface(4), Some(id_a));
    assert!(registry.stop(id_a));
    assert_eq!(registry.by_interface(4), None);
}

#[test]
fn empty_socket_is_not_an_error() {
    let (mut monitor, _, _) = monitor(4);
    assert_eq!(monitor.receive().unwrap(), 0);
    assert_eq!(monitor.datagrams(), 0);
}

#[test]
fn registry_counts_handled_datagrams() {
    let (a, sock_a, _) = monitor(4);
    let mut registry = MonitorRegistry::new();
    registry.insert(a);
    assert_eq!(registry.datagrams(), 0);

    // A dump answer with no Phonet links still counts.
    sock_a.push(done());
    registry.on_readable(sock_a.as_raw_fd());
    assert_eq!(registry.datagrams(), 1);

    sock_a.push_truncated(link(RTM_NEWLINK, 4, IFF_LINK_UP, Some("phonet0")));
    registry.on_readable(sock_a.as_raw_fd());
    assert_eq!(registry.datagrams(), 2);
}

// ────────────────────────────────────────────────────────────────
// 6. Acknowledged requests
// ────────────────────────────────────────────────────────────────

#[test]
fn request_succeeds_on_zero_error() {
    let socket = ScriptedSocket::new();
    socket.push(error(0));
    let msg = newaddr_request(1, 0, 4, PN_DEV_SOS);
    request(&socket, &msg).unwrap();
    assert_eq!(socket.script.borrow().sent, vec![msg.to_vec()]);
}

#[test]
fn request_succeeds_on_done() {
    let socket = ScriptedSocket::new();
    socket.push(done());
    request(&socket, &newroute_request(1, 0, 4, PN_DEV_HOST)).unwrap();
}

#[test]
fn request_reports_kernel_error() {
    let socket = ScriptedSocket::new();
    socket.push(error(-libc::EEXIST));
    let err = request(&socket, &newroute_request(1, 0, 4, PN_DEV_SOS)).unwrap_err();
    assert_eq!(err.errno(), -libc::EEXIST);
}

#[test]
fn request_without_terminal_record_is_eio() {
    let socket = ScriptedSocket::new();
    socket.push(link(RTM_NEWLINK, 4, 0, None));
    let err = request(&socket, &newaddr_request(1, 0, 4, PN_DEV_SOS)).unwrap_err();
    assert_eq!(err.errno(), -libc::EIO);

    socket.push_truncated(done());
    let err = request(&socket, &newaddr_request(1, 0, 4, PN_DEV_SOS)).unwrap_err();
    assert!(matches!(err, Error::Truncated));
    assert_eq!(err.errno(), -libc::EIO);
}
