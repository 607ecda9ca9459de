//! Single-threaded readiness reactor
//!
//! The [`Reactor`] keeps the interest set of every registered descriptor and
//! a set of one-shot timers. Each call to [`Reactor::turn`] waits once until
//! at least one registered source is ready or the nearest timer expires,
//! dispatches the read and write callbacks of the [`Handler`], and then fires
//! the expired timers.
//!
//! The reactor never owns the descriptors themselves: the handler maps a
//! [`Token`] to its [`EventSource`] on demand. This keeps every connection
//! and device in one owned table inside the handler, so a callback may
//! unregister any token (including its own) without invalidating the
//! dispatch loop.

mod source;
mod timer;

pub use source::{EventSource, Link};
pub use timer::TimerId;

use futures::future::poll_fn;
use std::collections::BTreeMap;
use std::fmt;
use std::task::Poll;
use std::time::Duration;
use timer::Timers;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Handle to a registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read/write interest of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    /// No interest
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    /// Interested in readability
    pub const READABLE: Interest = Interest {
        read: true,
        write: false,
    };
    /// Interested in writability
    pub const WRITABLE: Interest = Interest {
        read: false,
        write: true,
    };
    /// Interested in both
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    /// Whether readability is wanted
    pub fn is_readable(self) -> bool {
        self.read
    }

    /// Whether writability is wanted
    pub fn is_writable(self) -> bool {
        self.write
    }

    /// Whether nothing is wanted
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    /// Copy with the read flag replaced
    pub fn with_read(self, read: bool) -> Self {
        Interest { read, ..self }
    }

    /// Copy with the write flag replaced
    pub fn with_write(self, write: bool) -> Self {
        Interest { write, ..self }
    }
}

/// Readiness observed for one token in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Source is readable
    pub readable: bool,
    /// Source is writable
    pub writable: bool,
}

/// Callbacks invoked by the reactor
pub trait Handler {
    /// Tag carried by the handler's timers
    type Timer;

    /// Look up the source registered under `token`
    fn source(&self, token: Token) -> Option<&dyn EventSource>;

    /// `token` became readable
    fn on_readable(&mut self, reactor: &mut Reactor<Self::Timer>, token: Token);

    /// `token` became writable
    fn on_writable(&mut self, reactor: &mut Reactor<Self::Timer>, token: Token);

    /// A timer expired; it is already removed from the reactor
    fn on_timeout(&mut self, reactor: &mut Reactor<Self::Timer>, id: TimerId, tag: Self::Timer);
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: Interest,
}

/// Readiness dispatcher with one-shot timers
#[derive(Debug)]
pub struct Reactor<T> {
    registrations: BTreeMap<Token, Registration>,
    timers: Timers<T>,
    next_token: usize,
}

impl<T> Default for Reactor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Reactor<T> {
    /// Create an empty reactor
    pub fn new() -> Self {
        Reactor {
            registrations: BTreeMap::new(),
            timers: Timers::new(),
            next_token: 0,
        }
    }

    /// Register a new descriptor with the given interest
    ///
    /// Tokens are never reused, so a stale token can only miss.
    pub fn register(&mut self, interest: Interest) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.registrations.insert(
            token,
            Registration { interest },
        );
        trace!("Registered {} with {:?}", token, interest);
        token
    }

    /// Remove a registration; returns whether it existed
    pub fn unregister(&mut self, token: Token) -> bool {
        let removed = self.registrations.remove(&token).is_some();
        if removed {
            trace!("Unregistered {}", token);
        }
        removed
    }

    /// Replace the interest of a registration
    pub fn set_interest(&mut self, token: Token, interest: Interest) {
        if let Some(registration) = self.registrations.get_mut(&token) {
            registration.interest = interest;
        }
    }

    /// Toggle read interest
    pub fn set_read(&mut self, token: Token, read: bool) {
        if let Some(registration) = self.registrations.get_mut(&token) {
            registration.interest = registration.interest.with_read(read);
        }
    }

    /// Toggle write interest
    pub fn set_write(&mut self, token: Token, write: bool) {
        if let Some(registration) = self.registrations.get_mut(&token) {
            registration.interest = registration.interest.with_write(write);
        }
    }

    /// Current interest of a registration
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registrations.get(&token).map(|r| r.interest)
    }

    /// Number of registrations
    pub fn registrations(&self) -> usize {
        self.registrations.len()
    }

    /// Schedule a one-shot timer
    pub fn add_timer(&mut self, after: Duration, tag: T) -> TimerId {
        let id = self.timers.add(Instant::now() + after, tag);
        trace!("Scheduled {} in {:?}", id, after);
        id
    }

    /// Cancel a timer; returns its tag if it was still pending
    pub fn cancel_timer(&mut self, id: TimerId) -> Option<T> {
        self.timers.cancel(id)
    }

    /// Number of pending timers
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn wants(&self, token: Token, readable: bool) -> bool {
        self.registrations
            .get(&token)
            .map(|r| {
                if readable {
                    r.interest.is_readable()
                } else {
                    r.interest.is_writable()
                }
            })
            .unwrap_or(false)
    }

    async fn wait<H>(&self, handler: &H) -> Vec<(Token, Readiness)>
    where
        H: Handler<Timer = T>,
    {
        let ready = poll_fn(|cx| {
            let mut ready = Vec::new();
            for (token, registration) in &self.registrations {
                if registration.interest.is_empty() {
                    continue;
                }
                let Some(source) = handler.source(*token) else {
                    continue;
                };
                // An error counts as ready; the callback sees it on its next I/O call.
                let readiness = Readiness {
                    readable: registration.interest.is_readable()
                        && source.poll_readable(cx).is_ready(),
                    writable: registration.interest.is_writable()
                        && source.poll_writable(cx).is_ready(),
                };
                if readiness.readable || readiness.writable {
                    ready.push((*token, readiness));
                }
            }
            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        });

        match self.timers.next_deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, ready)
                .await
                .unwrap_or_default(),
            None => ready.await,
        }
    }

    /// Run one cycle: wait, dispatch I/O callbacks, fire expired timers
    ///
    /// Returns the number of callbacks invoked.
    pub async fn turn<H>(&mut self, handler: &mut H) -> usize
    where
        H: Handler<Timer = T>,
    {
        let ready = self.wait(handler).await;
        let mut dispatched = 0;

        for (token, readiness) in ready {
            if readiness.readable && self.wants(token, true) {
                handler.on_readable(self, token);
                dispatched += 1;
            }
            if readiness.writable && self.wants(token, false) {
                handler.on_writable(self, token);
                dispatched += 1;
            }
        }

        let now = Instant::now();
        while let Some((id, tag)) = self.timers.pop_expired(now) {
            debug!("{} expired", id);
            handler.on_timeout(self, id, tag);
            dispatched += 1;
        }

        dispatched
    }

    /// Run cycles until the shutdown signal fires
    pub async fn run_forever<H>(&mut self, handler: &mut H, shutdown: &mut broadcast::Receiver<bool>)
    where
        H: Handler<Timer = T>,
    {
        info!("Reactor started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Reactor received shutdown signal");
                    break;
                }
                _ = self.turn(handler) => {}
            }
        }
    }
}
