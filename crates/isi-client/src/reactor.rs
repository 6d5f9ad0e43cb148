//! # Reactor Contract
//!
//! Everything in this workspace is driven from a single reactor thread. An
//! [`EventSource`] tells the reactor which descriptors to watch for read
//! readiness and when its next deadline is; the reactor calls back when
//! either fires. Watching a descriptor is "registering a read watch",
//! reporting a deadline is "arming a one-shot timer", and no longer
//! reporting it is "disarming".
//!
//! [`EventLoop`] is a reference implementation on `poll(2)`. Daemons with an
//! event loop of their own can drive sources directly instead.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use quanta::{Clock, Instant};
use slab::Slab;

/// Something the reactor dispatches readiness and deadlines to.
pub trait EventSource {
    /// Descriptors to poll for readability.
    fn watched_fds(&self) -> Vec<RawFd>;

    /// `fd` has data ready.
    fn on_readable(&mut self, fd: RawFd);

    /// `fd` reported hang-up or became invalid.
    fn on_hangup(&mut self, fd: RawFd) {
        tracing::warn!(fd, "unexpected hang-up on watched descriptor");
    }

    /// Earliest instant at which [`on_deadline`](Self::on_deadline) should run.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    /// Run expired timers. `now` is the reactor's clock reading.
    fn on_deadline(&mut self, _now: Instant) {}
}

/// Key of a source registered with an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub usize);

type SharedSource = Rc<RefCell<dyn EventSource>>;

// ─── EventLoop ───────────────────────────────────────────────────────────────

/// Single-threaded `poll(2)` reactor.
///
/// Sources are shared (`Rc<RefCell<_>>`) so the host keeps its own handle to
/// issue requests between turns. A source must not be borrowed by the host
/// while [`turn`](Self::turn) runs; callbacks receive `&mut` access to their
/// client instead.
pub struct EventLoop {
    sources: Slab<SharedSource>,
    clock: Clock,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Use `clock` for deadlines (e.g. a `Clock::mock()` in tests).
    pub fn with_clock(clock: Clock) -> Self {
        EventLoop {
            sources: Slab::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn register<S: EventSource + 'static>(&mut self, source: Rc<RefCell<S>>) -> SourceId {
        let shared: SharedSource = source;
        SourceId(self.sources.insert(shared))
    }

    pub fn deregister(&mut self, id: SourceId) -> bool {
        self.sources.try_remove(id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Earliest deadline over all sources.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sources
            .iter()
            .filter_map(|(_, s)| s.borrow().next_deadline())
            .min()
    }

    /// Poll once, waiting at most `max_wait` (or until the next deadline),
    /// then dispatch readiness and expired deadlines.
    ///
    /// Returns the number of callbacks dispatched. With nothing to watch, no
    /// deadline and no `max_wait`, returns immediately.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        let mut pollfds = Vec::new();
        let mut owners = Vec::new();
        for (key, source) in self.sources.iter() {
            for fd in source.borrow().watched_fds() {
                pollfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
                owners.push(key);
            }
        }

        let now = self.clock.now();
        let until_deadline = self.next_deadline().map(|deadline| {
            if deadline > now {
                deadline.duration_since(now)
            } else {
                Duration::ZERO
            }
        });
        let wait = match (max_wait, until_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if pollfds.is_empty() && wait.is_none() {
            return Ok(0);
        }
        let timeout_ms: libc::c_int = match wait {
            None => -1,
            Some(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut dispatched = 0;
        for (pfd, key) in pollfds.iter().zip(owners) {
            if pfd.revents == 0 {
                continue;
            }
            // A previous callback may have deregistered this source.
            let Some(source) = self.sources.get(key).cloned() else {
                continue;
            };
            let mut source = source.borrow_mut();
            if pfd.revents & (libc::POLLHUP | libc::POLLNVAL) != 0 {
                source.on_hangup(pfd.fd);
            } else {
                source.on_readable(pfd.fd);
            }
            dispatched += 1;
        }

        dispatched += self.fire_deadlines();
        Ok(dispatched)
    }

    /// Dispatch [`EventSource::on_deadline`] to every source whose deadline
    /// has passed on this loop's clock.
    pub fn fire_deadlines(&mut self) -> usize {
        let now = self.clock.now();
        let due: Vec<SharedSource> = self
            .sources
            .iter()
            .filter(|(_, s)| s.borrow().next_deadline().is_some_and(|d| d <= now))
            .map(|(_, s)| s.clone())
            .collect();
        for source in &due {
            source.borrow_mut().on_deadline(now);
        }
        due.len()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
