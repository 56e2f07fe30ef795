//! In-process transport
//!
//! Endpoints are plugged and unplugged programmatically and bytes are pushed
//! by hand. Used by the test suites and for running the system without
//! hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{PacketSink, Transport};
use crate::coalescer::Signaller;
use crate::directory::{EndpointRecord, EndpointSnapshot};
use crate::error::{Error, Result};

pub struct MemoryTransport {
    sources: Mutex<Vec<EndpointSnapshot>>,
    destinations: Mutex<Vec<EndpointSnapshot>>,
    sinks: Mutex<HashMap<u32, PacketSink>>,
    signaller: Mutex<Option<Signaller>>,
    push: bool,
    available: AtomicBool,
    clock_micros: AtomicU64,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MemoryTransport {
    /// Transport that pushes a topology signal on every plug/unplug
    pub fn new() -> Self {
        Self::with_push(true)
    }

    /// Transport that needs polling to notice changes
    pub fn polling_only() -> Self {
        Self::with_push(false)
    }

    /// Transport whose backend reports itself missing
    pub fn unavailable() -> Self {
        let transport = Self::with_push(false);
        transport.available.store(false, Ordering::Release);
        transport
    }

    fn with_push(push: bool) -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
            destinations: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
            signaller: Mutex::new(None),
            push,
            available: AtomicBool::new(true),
            clock_micros: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn plug_source(&self, snapshot: EndpointSnapshot) {
        debug!("Plugging source {}", snapshot.unique_id);
        self.sources.lock().push(snapshot);
        self.changed();
    }

    pub fn plug_destination(&self, snapshot: EndpointSnapshot) {
        debug!("Plugging destination {}", snapshot.unique_id);
        self.destinations.lock().push(snapshot);
        self.changed();
    }

    /// Remove an endpoint of either role. The connection sink is dropped
    /// without notifying anyone, like a device yanked from the bus.
    pub fn unplug(&self, unique_id: u32) -> bool {
        let removed = {
            let mut sources = self.sources.lock();
            let mut destinations = self.destinations.lock();
            let before = sources.len() + destinations.len();
            sources.retain(|s| s.unique_id != unique_id);
            destinations.retain(|d| d.unique_id != unique_id);
            before != sources.len() + destinations.len()
        };

        if removed {
            self.sinks.lock().remove(&unique_id);
            self.changed();
        }
        removed
    }

    /// Change the reported name of an endpoint
    pub fn rename(&self, unique_id: u32, name: &str) -> bool {
        let renamed = {
            let mut sources = self.sources.lock();
            let mut destinations = self.destinations.lock();
            match sources
                .iter_mut()
                .chain(destinations.iter_mut())
                .find(|s| s.unique_id == unique_id)
            {
                Some(snapshot) => {
                    snapshot.name = name.to_string();
                    true
                }
                None => false,
            }
        };

        if renamed {
            self.changed();
        }
        renamed
    }

    /// Deliver a packet as if the device sent it. Returns false if the
    /// source is not connected.
    pub fn push_bytes(&self, unique_id: u32, raw_timestamp: u64, bytes: &[u8]) -> bool {
        let sink = self.sinks.lock().get(&unique_id).cloned();
        match sink {
            Some(sink) => {
                sink(raw_timestamp, bytes);
                true
            }
            None => false,
        }
    }

    pub fn set_clock(&self, micros: u64) {
        self.clock_micros.store(micros, Ordering::Release);
    }

    pub fn is_connected(&self, unique_id: u32) -> bool {
        self.sinks.lock().contains_key(&unique_id)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::Acquire)
    }

    fn changed(&self) {
        if !self.push {
            return;
        }
        if let Some(signaller) = self.signaller.lock().as_ref() {
            signaller.signal();
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn enumerate_sources(&self) -> Result<Vec<EndpointSnapshot>> {
        if !self.is_available() {
            return Err(Error::NativeUnavailable("memory transport disabled".into()));
        }
        Ok(self.sources.lock().clone())
    }

    fn enumerate_destinations(&self) -> Result<Vec<EndpointSnapshot>> {
        if !self.is_available() {
            return Err(Error::NativeUnavailable("memory transport disabled".into()));
        }
        Ok(self.destinations.lock().clone())
    }

    fn connect_source(&self, record: &EndpointRecord, sink: PacketSink) -> Result<()> {
        let unique_id = record.unique_id();
        if !self.sources.lock().iter().any(|s| s.unique_id == unique_id) {
            return Err(Error::UnknownEndpoint(unique_id));
        }
        self.sinks.lock().insert(unique_id, sink);
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn disconnect_source(&self, unique_id: u32) -> Result<()> {
        if self.sinks.lock().remove(&unique_id).is_some() {
            self.disconnects.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        self.clock_micros.load(Ordering::Acquire)
    }

    fn supports_push(&self) -> bool {
        self.push
    }

    fn set_topology_signaller(&self, signaller: Signaller) {
        *self.signaller.lock() = Some(signaller);
    }
}
