//! Readiness-based I/O multiplexer over epoll (via `mio`).
//!
//! The reactor's only job is to turn a batch of ready file descriptors
//! into `(Token, EventSet)` pairs with a bounded wait. Timer servicing is
//! not the reactor's concern: the engine drives its own periodic tick
//! from a monotonic clock comparison, independent of whether a given
//! `wait()` call returned because of I/O or because of the timeout.

use crate::error::{Error, Result};
use mio::{Events, Interest, Poll, Token};
use std::time::Duration;

/// Token identifying a registered source. Thin wrapper so callers never
/// touch `mio::Token` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventToken(pub usize);

impl From<Token> for EventToken {
    fn from(token: Token) -> Self {
        Self(token.0)
    }
}

impl From<EventToken> for Token {
    fn from(token: EventToken) -> Self {
        Token(token.0)
    }
}

/// A single dispatch-worthy event for one registered token.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: EventToken,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Readiness-notification multiplexer over file descriptors with a timeout.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(max_events: usize) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::init(format!("failed to create reactor: {e}")))?;
        Ok(Self { poll, events: Events::with_capacity(max_events) })
    }

    /// Register an I/O source under `token` with the given interest set.
    pub fn add<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        interests: Interest,
        token: EventToken,
    ) -> Result<()> {
        self.poll
            .registry()
            .register(source, token.into(), interests)
            .map_err(|e| Error::flow_setup(format!("failed to register fd: {e}")))
    }

    pub fn remove<S: mio::event::Source + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        self.poll
            .registry()
            .deregister(source)
            .map_err(|e| Error::flow_setup(format!("failed to deregister fd: {e}")))
    }

    /// Block for up to `timeout` waiting for readiness, returning the
    /// batch of ready events (possibly empty, if the timeout elapsed).
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<ReadyEvent>> {
        self.poll
            .poll(&mut self.events, Some(timeout))
            .map_err(|e| Error::flow_relay(format!("poll failed: {e}")))?;

        Ok(self
            .events
            .iter()
            .map(|event| ReadyEvent {
                token: EventToken::from(event.token()),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrips_through_mio_token() {
        let ours = EventToken(42);
        let mio_token: Token = ours.into();
        assert_eq!(EventToken::from(mio_token), ours);
    }
}
