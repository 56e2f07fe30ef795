//! Per-endpoint fan-out of decoded messages
//!
//! A [`Dispatcher`] owns the set of [`Transmitter`]s attached to one source.
//! Each transmitter optionally points at a [`MessageReceiver`]. Delivery
//! snapshots the sink set under the lock and invokes receivers outside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::decoder::DecodedMessage;

/// Downstream consumer of decoded messages
pub trait MessageReceiver: Send + Sync {
    /// Handle one message. Called from the transport's delivery thread.
    fn send(&self, message: &DecodedMessage);

    /// The transmitter feeding this receiver was closed
    fn close(&self) {}
}

impl<F> MessageReceiver for F
where
    F: Fn(&DecodedMessage) + Send + Sync,
{
    fn send(&self, message: &DecodedMessage) {
        self(message)
    }
}

/// A sink attached to a source's dispatcher
///
/// The receiver can be swapped or detached at any time; a transmitter with
/// no receiver is skipped during delivery.
pub struct Transmitter {
    receiver: Mutex<Option<Arc<dyn MessageReceiver>>>,
    closed: AtomicBool,
}

impl Transmitter {
    pub fn new() -> Self {
        Self {
            receiver: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a transmitter already pointing at `receiver`
    pub fn with_receiver(receiver: Arc<dyn MessageReceiver>) -> Self {
        Self {
            receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach (or replace) the receiver
    pub fn set_receiver(&self, receiver: Option<Arc<dyn MessageReceiver>>) {
        if self.is_closed() {
            debug!("Ignoring receiver change on closed transmitter");
            return;
        }
        *self.receiver.lock() = receiver;
    }

    pub fn receiver(&self) -> Option<Arc<dyn MessageReceiver>> {
        self.receiver.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Detach permanently. Returns false if already closed.
    ///
    /// The dispatcher prunes closed transmitters on its next snapshot.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(receiver) = self.receiver.lock().take() {
            receiver.close();
        }
        true
    }
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("attached", &self.receiver.lock().is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Thread-safe sink set for one endpoint
#[derive(Default)]
pub struct Dispatcher {
    sinks: Mutex<Vec<Arc<Transmitter>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Registering the same transmitter twice is a no-op.
    pub fn add_sink(&self, sink: Arc<Transmitter>) -> bool {
        let mut sinks = self.sinks.lock();
        if sinks.iter().any(|s| Arc::ptr_eq(s, &sink)) {
            return false;
        }
        sinks.push(sink);
        true
    }

    /// Remove a sink by identity
    pub fn remove_sink(&self, sink: &Arc<Transmitter>) -> bool {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    }

    /// Create a transmitter, register it, and return it
    pub fn transmitter(&self) -> Arc<Transmitter> {
        let transmitter = Arc::new(Transmitter::new());
        self.add_sink(transmitter.clone());
        transmitter
    }

    /// Consistent snapshot of the live sinks
    pub fn sinks(&self) -> Vec<Arc<Transmitter>> {
        let mut sinks = self.sinks.lock();
        sinks.retain(|s| !s.is_closed());
        sinks.clone()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks().len()
    }

    /// Deliver `message` to every sink registered at the time of the call.
    ///
    /// Returns how many receivers were invoked.
    pub fn dispatch(&self, message: &DecodedMessage) -> usize {
        let snapshot = self.sinks();
        let mut delivered = 0;

        for sink in &snapshot {
            let Some(receiver) = sink.receiver() else {
                continue;
            };
            receiver.send(message);
            delivered += 1;
        }

        trace!("Dispatched {} to {}/{} sinks", message, delivered, snapshot.len());
        delivered
    }

    /// Close and drop every sink
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = std::mem::take(&mut *self.sinks.lock());
        let count = drained.len();
        for sink in drained {
            sink.close();
        }
        count
    }
}
