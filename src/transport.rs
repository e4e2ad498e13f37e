//! Mass-storage transport bracket.
//!
//! The host must never observe a half-switched volume, so every mutation of
//! the active partition or table happens while the transport is stopped.
//! `TransportPause` is the scoped form of that bracket: acquiring it stops
//! the transport, dropping it waits for the settle delay and restarts it,
//! whichever way the enclosing scope is left.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::debug;

/// Host-facing mass-storage transport
pub trait Transport {
    /// Detach the medium from the host
    fn stop(&mut self);

    /// Re-attach the medium
    fn start(&mut self);

    /// Block for `duration` before restarting
    fn delay(&mut self, duration: Duration);
}

/// Stopped transport; restarted when dropped
pub struct TransportPause<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    settle: Duration,
}

impl<'a, T: Transport + ?Sized> TransportPause<'a, T> {
    /// Stop the transport until the returned guard is dropped
    pub fn acquire(transport: &'a mut T, settle: Duration) -> Self {
        debug!("transport stopped");
        transport.stop();
        Self { transport, settle }
    }
}

impl<T: Transport + ?Sized> Drop for TransportPause<'_, T> {
    fn drop(&mut self) {
        self.transport.delay(self.settle);
        self.transport.start();
        debug!("transport restarted");
    }
}

/// Observable transport event (for testing)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Stop,
    Delay(Duration),
    Start,
}

/// Transport that records its events
/// Uses Rc<RefCell<...>> so clones share the same log
#[derive(Clone, Default)]
pub struct RecordingTransport {
    events: Rc<RefCell<Vec<TransportEvent>>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.borrow().clone()
    }

    /// Whether the last event left the transport running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !matches!(
            self.events.borrow().last(),
            Some(TransportEvent::Stop) | Some(TransportEvent::Delay(_))
        )
    }

    /// Number of stop/start brackets
    #[must_use]
    pub fn restarts(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| **e == TransportEvent::Start)
            .count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl Transport for RecordingTransport {
    fn stop(&mut self) {
        self.events.borrow_mut().push(TransportEvent::Stop);
    }

    fn start(&mut self) {
        self.events.borrow_mut().push(TransportEvent::Start);
    }

    fn delay(&mut self, duration: Duration) {
        self.events.borrow_mut().push(TransportEvent::Delay(duration));
    }
}
