use crate::net::shared::NetworkResult;
use std::sync::Arc;
use std::time::Duration;

/// Cloneable handle over the readiness notifier. Connection registrations
/// are level-triggered oneshots: after an event fires, the fd stays silent
/// until `rearm`, which serialises all work per connection.
#[derive(Clone)]
pub struct Notifier {
    poll: Arc<mio::Poll>,
}

impl Notifier {
    /// Registers a handle for readable events that keep firing while data
    /// is pending. Used for the listening socket.
    pub fn register_persistent<E: mio::event::Evented>(
        &self,
        handle: &E,
        token: mio::Token,
    ) -> NetworkResult<()> {
        self.poll
            .register(handle, token, mio::Ready::readable(), mio::PollOpt::level())
            .map_err(Into::into)
    }

    /// Registers a handle for a single readable event.
    pub fn register_oneshot<E: mio::event::Evented>(
        &self,
        handle: &E,
        token: mio::Token,
    ) -> NetworkResult<()> {
        self.poll
            .register(
                handle,
                token,
                mio::Ready::readable(),
                mio::PollOpt::level() | mio::PollOpt::oneshot(),
            )
            .map_err(Into::into)
    }

    /// Re-arms a oneshot registration after its event has been handled.
    pub fn rearm<E: mio::event::Evented>(&self, handle: &E, token: mio::Token) -> NetworkResult<()> {
        self.poll
            .reregister(
                handle,
                token,
                mio::Ready::readable(),
                mio::PollOpt::level() | mio::PollOpt::oneshot(),
            )
            .map_err(Into::into)
    }

    pub fn deregister<E: mio::event::Evented>(&self, handle: &E) -> NetworkResult<()> {
        self.poll.deregister(handle).map_err(Into::into)
    }
}

/// Owns the poll and its event buffer. The loop thread polls here and hands
/// the ready tokens off; it performs no I/O itself.
pub struct EventLoop {
    notifier: Notifier,
    events: mio::Events,
}

impl EventLoop {
    pub fn new() -> NetworkResult<EventLoop> {
        Ok(EventLoop {
            notifier: Notifier {
                poll: Arc::new(mio::Poll::new()?),
            },
            events: mio::Events::with_capacity(1024),
        })
    }

    #[inline]
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Waits for readiness events up to the timeout. The events are
    /// available through `events` afterwards.
    pub fn poll(&mut self, timeout: Option<Duration>) -> NetworkResult<usize> {
        self.notifier
            .poll
            .poll(&mut self.events, timeout)
            .map_err(Into::into)
    }

    #[inline]
    pub fn events(&self) -> impl Iterator<Item = mio::event::Event> + '_ {
        self.events.iter()
    }
}
