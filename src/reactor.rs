//! A thin wrapper over [`mio::Poll`] providing the handful of operations the
//! connection engine needs: register/adjust a watcher's interest, inject a
//! synthetic ready event, and register a signal source (§4.4).

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{ProxyError, Result};

/// One descriptor's `mio` registration.
///
/// `mio` allows exactly one `register()` per descriptor; changing which
/// readiness a descriptor is watched for after that first call requires
/// `reregister()`, never a second `register()`. A `Watcher` owns that
/// discipline: callers flip the readable/writable bits they individually
/// care about with [`Watcher::set_readable`]/[`Watcher::set_writable`], and
/// the watcher registers on the first bit that goes up, reregisters the
/// combined interest on every change after that, and deregisters once both
/// bits go back down.
///
/// This matters because a connection's client and server sockets each back
/// *two* independent concerns (this direction reads from it, the other
/// direction writes to it) that must not fight over the same descriptor's
/// registration — exactly the trap of keeping one `Watcher` per `(fd,
/// direction)` pair instead of one per descriptor.
pub struct Watcher {
    fd: RawFd,
    token: Token,
    readable: bool,
    writable: bool,
    registered: bool,
}

impl Watcher {
    pub fn new(fd: RawFd, token: Token) -> Watcher {
        Watcher {
            fd,
            token,
            readable: false,
            writable: false,
            registered: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Arm or disarm this descriptor's READABLE interest, leaving WRITABLE
    /// untouched. A no-op if the bit already has the requested value.
    pub fn set_readable(&mut self, reactor: &Reactor, want: bool) -> Result<()> {
        if self.readable == want {
            return Ok(());
        }
        self.readable = want;
        self.sync(reactor)
    }

    /// Arm or disarm this descriptor's WRITABLE interest, leaving READABLE
    /// untouched. A no-op if the bit already has the requested value.
    pub fn set_writable(&mut self, reactor: &Reactor, want: bool) -> Result<()> {
        if self.writable == want {
            return Ok(());
        }
        self.writable = want;
        self.sync(reactor)
    }

    /// Set both bits in one registry call, avoiding a redundant reregister
    /// when a caller needs to change both at once (e.g. leaving the
    /// write-only connect phase for the steady-state read phase).
    pub fn set_interest(&mut self, reactor: &Reactor, readable: bool, writable: bool) -> Result<()> {
        if self.readable == readable && self.writable == writable {
            return Ok(());
        }
        self.readable = readable;
        self.writable = writable;
        self.sync(reactor)
    }

    fn sync(&mut self, reactor: &Reactor) -> Result<()> {
        let wanted = match (self.readable, self.writable) {
            (false, false) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        };

        match (self.registered, wanted) {
            (false, None) => Ok(()),
            (false, Some(interest)) => {
                reactor
                    .registry
                    .register(&mut SourceFd(&self.fd), self.token, interest)
                    .map_err(|e| ProxyError::system("could not register watcher", e))?;
                self.registered = true;
                Ok(())
            }
            (true, Some(interest)) => {
                reactor
                    .registry
                    .reregister(&mut SourceFd(&self.fd), self.token, interest)
                    .map_err(|e| ProxyError::system("could not reregister watcher", e))?;
                Ok(())
            }
            (true, None) => {
                // A watcher whose fd has already been closed has nothing to
                // deregister; ignore ENOENT-shaped failures from a dead fd.
                let _ = reactor.registry.deregister(&mut SourceFd(&self.fd));
                self.registered = false;
                Ok(())
            }
        }
    }
}

/// One readiness notification, either real (from `mio::Poll`) or synthetic
/// (injected via [`Reactor::notify_writable`]).
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Wraps [`mio::Poll`] plus the bookkeeping needed to inject a synthetic
/// ready event (for a `connect()` that completed synchronously) through the
/// same code path as a real, deferred readiness notification.
pub struct Reactor {
    poll: Poll,
    registry: mio::Registry,
    pending: Vec<ReadyEvent>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        let poll = Poll::new().map_err(|e| ProxyError::system("could not create event loop", e))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| ProxyError::system("could not clone event loop registry", e))?;
        Ok(Reactor {
            poll,
            registry,
            pending: Vec::new(),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        &self.registry
    }

    /// Register a [`Source`] (used for the signal-hook pipe, which is not a
    /// raw fd the engine owns directly). Registered exactly once, for the
    /// lifetime of the engine; its interest never changes.
    pub fn register_source<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        self.registry
            .register(source, token, interest)
            .map_err(|e| ProxyError::system("could not register signal source", e))
    }

    /// Queue a synthetic writable-ready event for `token`, to be delivered
    /// on the next call to [`Reactor::poll_tokens`] alongside any real
    /// events. Used when a non-blocking `connect()` succeeds immediately,
    /// so the connect-completion path runs through the same dispatch code
    /// as a deferred connect.
    pub fn notify_writable(&mut self, token: Token) {
        self.pending.push(ReadyEvent {
            token,
            readable: false,
            writable: true,
        });
    }

    /// Block until at least one event is ready (or `timeout` elapses), then
    /// return every ready event — synthetic ones first, in the order they
    /// were injected, followed by whatever `mio` reports as real events.
    ///
    /// Returning a plain `Vec` instead of taking a per-event callback keeps
    /// this call free of `self`-borrow conflicts at the caller: the engine
    /// dispatches each event in a second, ordinary loop rather than from
    /// inside a closure that would need simultaneous mutable access to both
    /// the reactor and the connection registry.
    pub fn poll_tokens(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        let mut ready: Vec<ReadyEvent> = self.pending.drain(..).collect();

        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ready),
            Err(e) => return Err(ProxyError::system("event loop poll() failed", e)),
        }

        ready.extend(events.iter().map(|e| ReadyEvent {
            token: e.token(),
            readable: e.is_readable(),
            writable: e.is_writable(),
        }));
        Ok(ready)
    }
}
