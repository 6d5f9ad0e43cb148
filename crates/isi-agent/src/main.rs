//! ISI Agent
//!
//! Small daemon driving the Phonet stack on one reactor thread.
//!
//! - Follows the modem's Phonet interface and configures its device
//!   addresses once the link comes up
//! - Opens one ISI client per configured resource and logs subscribed
//!   indications
//! - With `--probe`, sends a raw request on every client and logs the answer
//! - With `--once`, exits after the link monitor has handled its first datagram

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use isi_client::config::{AgentConfig, ClientConfig, InterfaceSelector, NetlinkConfig};
use isi_client::{Client, EventLoop};
use isi_netlink::socket::interface_index;
use isi_netlink::{LinkEvent, LinkMonitor, LinkState, MonitorRegistry, ANY_INTERFACE};
use tracing_subscriber::EnvFilter;

const TURN_WAIT: Duration = Duration::from_millis(200);
const ONCE_DEADLINE: Duration = Duration::from_secs(2);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Phonet modem agent.
#[derive(Parser, Debug)]
#[command(name = "isi-agent", about = "Phonet ISI agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Modem interface, by name or index. Overrides the config file.
    #[arg(long)]
    interface: Option<String>,

    /// Exit once the initial link dump has been handled.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Hex payload to send as a request on every client at start-up.
    #[arg(long)]
    probe: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let selector = match cli.interface.as_deref() {
        Some(raw) => InterfaceSelector::parse(raw),
        None => config.interface.clone(),
    };
    let interface = resolve_interface(selector.as_ref())?;
    let probe = cli.probe.as_deref().map(parse_hex).transpose()?;

    tracing::info!(
        ifindex = interface,
        clients = config.clients.len(),
        once = cli.once,
        "isi-agent starting"
    );

    let mut ev = EventLoop::new();

    // ── Link monitor ────────────────────────────────────────────
    let changes: Rc<RefCell<Vec<(u32, LinkState)>>> = Rc::default();
    let registry = Rc::new(RefCell::new(MonitorRegistry::new()));
    {
        let changes = changes.clone();
        let on_event = move |event: &LinkEvent| log_link_event(event, &changes);
        let mut registry = registry.borrow_mut();
        let started = if config.netlink.bring_up {
            registry.start(interface, on_event)
        } else {
            LinkMonitor::start_passive(interface, on_event).map(|m| registry.insert(m))
        };
        started.context("starting link monitor")?;
    }
    ev.register(registry.clone());

    // ── ISI clients ─────────────────────────────────────────────
    let mut clients = Vec::new();
    for cfg in &config.clients {
        match open_client(cfg, probe.as_deref()) {
            Ok(client) => {
                ev.register(client.clone());
                clients.push(client);
            }
            Err(e) => tracing::warn!(resource = cfg.resource, error = %e, "client unavailable"),
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    // ── Main loop ───────────────────────────────────────────────
    let started = Instant::now();
    let mut last_stats = Instant::now();
    let mut configured = HashSet::new();

    while running.load(Ordering::Relaxed) {
        ev.turn(Some(TURN_WAIT)).context("event loop")?;

        let pending: Vec<(u32, LinkState)> = changes.borrow_mut().drain(..).collect();
        for ifindex in links_to_configure(pending, &mut configured) {
            configure_link(ifindex, &config.netlink);
        }

        if cli.once && (registry.borrow().datagrams() > 0 || started.elapsed() >= ONCE_DEADLINE) {
            break;
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            for client in &clients {
                let client = client.borrow();
                let stats = client.stats();
                tracing::info!(
                    resource = client.resource(),
                    pending = client.pending(),
                    sent = stats.requests_sent,
                    responses = stats.responses,
                    indications = stats.indications,
                    timeouts = stats.timeouts,
                    dropped = stats.dropped,
                    "client stats"
                );
            }
            last_stats = Instant::now();
        }
    }

    tracing::info!("isi-agent stopped");
    Ok(())
}

fn load_config(path: Option<&str>) -> anyhow::Result<AgentConfig> {
    let Some(path) = path else {
        return Ok(AgentConfig::default());
    };
    let text = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("reading config {path}"))?;
    AgentConfig::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{path}: {e}"))
}

fn resolve_interface(selector: Option<&InterfaceSelector>) -> anyhow::Result<u32> {
    match selector {
        None => Ok(ANY_INTERFACE),
        Some(InterfaceSelector::Index(index)) => Ok(*index),
        Some(InterfaceSelector::Name(name)) => {
            interface_index(name).with_context(|| format!("looking up interface {name}"))
        }
    }
}

fn parse_hex(raw: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        bail!("probe payload must be an even number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}

fn open_client(cfg: &ClientConfig, probe: Option<&[u8]>) -> anyhow::Result<Rc<RefCell<Client>>> {
    let mut client = Client::new(cfg.resource).context("opening Phonet socket")?;
    let resource = cfg.resource;

    for &ty in &cfg.indications {
        client
            .subscribe(ty, move |_, msg| {
                tracing::info!(
                    resource,
                    ty,
                    object = msg.object(),
                    len = msg.data().len(),
                    "indication"
                );
            })
            .with_context(|| format!("subscribing to indication 0x{ty:02x}"))?;
    }

    if let Some(payload) = probe {
        client
            .send_request(payload, cfg.default_timeout, move |client, msg| {
                if msg.is_timeout() {
                    tracing::warn!(resource, errno = client.error(), "probe timed out");
                } else {
                    tracing::info!(resource, id = msg.id(), data = ?msg.data(), "probe answered");
                }
                true
            })
            .context("sending probe")?;
    }

    Ok(Rc::new(RefCell::new(client)))
}

fn log_link_event(event: &LinkEvent, changes: &RefCell<Vec<(u32, LinkState)>>) {
    match event {
        LinkEvent::Link {
            ifindex,
            state,
            name,
        } => {
            tracing::info!(ifindex, %state, name = %name, "phonet link");
            changes.borrow_mut().push((*ifindex, *state));
        }
        LinkEvent::Address {
            ifindex,
            local,
            remote,
            removed,
        } => {
            tracing::info!(ifindex, ?local, ?remote, removed, "phonet address");
        }
    }
}

/// Links that came up since they were last configured. A link going down
/// or away loses its addresses, so it is configured again on the next up.
fn links_to_configure(
    changes: impl IntoIterator<Item = (u32, LinkState)>,
    configured: &mut HashSet<u32>,
) -> Vec<u32> {
    let mut up = Vec::new();
    for (ifindex, state) in changes {
        match state {
            LinkState::Up => {
                if configured.insert(ifindex) {
                    up.push(ifindex);
                }
            }
            LinkState::Down | LinkState::Removed => {
                configured.remove(&ifindex);
            }
        }
    }
    up
}

/// Assign the configured device addresses to a link that just came up.
fn configure_link(ifindex: u32, netlink: &NetlinkConfig) {
    if let Some(local) = netlink.local_address {
        match isi_netlink::set_local_address(ifindex, local) {
            Ok(()) => tracing::info!(ifindex, local, "local address set"),
            Err(e) => tracing::warn!(ifindex, local, errno = e.errno(), error = %e, "setting local address failed"),
        }
    }
    if let Some(remote) = netlink.remote_address {
        match isi_netlink::add_route(ifindex, remote) {
            Ok(()) => tracing::info!(ifindex, remote, "route added"),
            Err(e) => tracing::warn!(ifindex, remote, errno = e.errno(), error = %e, "adding route failed"),
        }
    }
}
