//! Endpoint records held by the directory
//!
//! A record keeps a stable identity for the lifetime of the device. Metadata
//! is refreshed in place on every sighting while open connections, decoder
//! state and attached transmitters stay with the record.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::decoder::{DecodedMessage, IncompleteSysex, MalformedPolicy, MessageDecoder};
use crate::dispatcher::{Dispatcher, Transmitter};
use crate::error::{Error, Result};

/// Vendor reported when the transport has none
pub const UNKNOWN_VENDOR: &str = "<Unknown vendor>";

/// Direction of an endpoint as seen from this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces MIDI bytes (an input port)
    Source,
    /// Consumes MIDI bytes (an output port)
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Destination => write!(f, "destination"),
        }
    }
}

/// One endpoint as reported by a single enumeration pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub unique_id: u32,
    /// Transport-specific handle (port id for midir)
    pub native_ref: String,
    pub name: String,
    pub entity_name: Option<String>,
    pub device_name: Option<String>,
    pub vendor: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
}

impl EndpointSnapshot {
    pub fn new(unique_id: u32, native_ref: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            unique_id,
            native_ref: native_ref.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }
}

/// Refreshable metadata of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub name: String,
    pub display_name: String,
    pub entity_name: Option<String>,
    pub device_name: Option<String>,
    pub vendor: String,
    pub description: String,
    pub version: Option<String>,
    #[serde(skip)]
    pub native_ref: String,
}

impl EndpointInfo {
    /// Build metadata from a sighting, filling defaults for missing fields
    pub fn from_snapshot(prefix: &str, snapshot: &EndpointSnapshot) -> Self {
        let display_name = if prefix.is_empty() {
            snapshot.name.clone()
        } else {
            format!("{} - {}", prefix, snapshot.name)
        };

        Self {
            name: snapshot.name.clone(),
            display_name,
            entity_name: snapshot.entity_name.clone(),
            device_name: snapshot.device_name.clone(),
            vendor: snapshot
                .vendor
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| UNKNOWN_VENDOR.to_string()),
            description: snapshot
                .description
                .clone()
                .unwrap_or_else(|| snapshot.name.clone()),
            version: snapshot.version.clone(),
            native_ref: snapshot.native_ref.clone(),
        }
    }

    /// "vendor: display name"
    pub fn information_string(&self) -> String {
        format!("{}: {}", self.vendor, self.display_name)
    }
}

/// Result of feeding one packet into a source
#[derive(Debug, Default)]
pub struct Delivery {
    /// Messages handed to the dispatcher
    pub messages: usize,
    /// Malformed-stream errors seen while decoding
    pub malformed: Vec<Error>,
}

#[derive(Debug)]
struct OpenSource {
    decoder: MessageDecoder,
    origin_micros: u64,
}

/// Source-side state: decoder while open, plus the sink set
pub struct Source {
    unique_id: u32,
    open: Mutex<Option<OpenSource>>,
    dispatcher: Dispatcher,
    vanished: AtomicBool,
}

impl Source {
    fn new(unique_id: u32) -> Self {
        Self {
            unique_id,
            open: Mutex::new(None),
            dispatcher: Dispatcher::new(),
            vanished: AtomicBool::new(false),
        }
    }

    /// Open with a fresh decoder. Returns false if it was already open.
    pub fn open(&self, origin_micros: u64, incomplete_sysex: IncompleteSysex) -> Result<bool> {
        self.ensure_present()?;

        let mut open = self.open.lock();
        if open.is_some() {
            return Ok(false);
        }

        *open = Some(OpenSource {
            decoder: MessageDecoder::new(origin_micros).with_incomplete_sysex(incomplete_sysex),
            origin_micros,
        });
        debug!("Source {} opened (origin {}us)", self.unique_id, origin_micros);
        Ok(true)
    }

    /// Close, discarding decoder state and closing every transmitter
    pub fn close(&self) -> bool {
        let was_open = self.open.lock().take().is_some();
        let sinks = self.dispatcher.close_all();
        if was_open {
            debug!("Source {} closed ({} transmitters)", self.unique_id, sinks);
        }
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.open.lock().is_some()
    }

    /// Microseconds since the source was opened, measured against `now_micros`
    pub fn microsecond_position(&self, now_micros: u64) -> Option<i64> {
        self.open
            .lock()
            .as_ref()
            .map(|o| (now_micros as i64).wrapping_sub(o.origin_micros as i64))
    }

    /// Create and register a transmitter on this source
    pub fn transmitter(&self) -> Result<Arc<Transmitter>> {
        self.ensure_present()?;
        Ok(self.dispatcher.transmitter())
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Decode a packet and fan the messages out to the transmitters.
    ///
    /// Messages are collected while the decoder is locked and dispatched
    /// after the lock is released, so receivers may close this source.
    pub fn deliver(&self, raw_timestamp: u64, bytes: &[u8], policy: MalformedPolicy) -> Result<Delivery> {
        self.ensure_present()?;

        let mut messages: Vec<DecodedMessage> = Vec::new();
        let mut delivery = Delivery::default();
        {
            let mut open = self.open.lock();
            let Some(state) = open.as_mut() else {
                return Err(Error::EndpointClosed(self.unique_id));
            };

            match policy {
                MalformedPolicy::Resume => {
                    delivery.malformed =
                        state.decoder.receive_resuming(raw_timestamp, bytes, |m| messages.push(m));
                }
                MalformedPolicy::AbortPacket => {
                    if let Err(e) = state.decoder.receive(raw_timestamp, bytes, |m| messages.push(m)) {
                        delivery.malformed.push(e);
                    }
                }
            }
        }

        for err in &delivery.malformed {
            warn!("Source {}: {}", self.unique_id, err);
        }

        for message in &messages {
            self.dispatcher.dispatch(message);
        }
        delivery.messages = messages.len();
        Ok(delivery)
    }

    /// Tear down after the device vanished.
    ///
    /// Never touches the native handle. Only the first call does any work;
    /// it returns true.
    pub fn device_disappeared(&self) -> bool {
        if self
            .vanished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.open.lock().take();
        let sinks = self.dispatcher.close_all();
        info!("Source {} disappeared ({} transmitters closed)", self.unique_id, sinks);
        true
    }

    pub fn is_vanished(&self) -> bool {
        self.vanished.load(Ordering::Acquire)
    }

    fn ensure_present(&self) -> Result<()> {
        if self.is_vanished() {
            return Err(Error::VanishedDeviceTeardown {
                unique_id: self.unique_id,
            });
        }
        Ok(())
    }
}

/// Destination-side state
pub struct Destination {
    unique_id: u32,
    open: AtomicBool,
    origin_micros: AtomicU64,
}

impl Destination {
    fn new(unique_id: u32) -> Self {
        Self {
            unique_id,
            open: AtomicBool::new(false),
            origin_micros: AtomicU64::new(0),
        }
    }

    /// Returns false if it was already open
    pub fn open(&self, origin_micros: u64) -> bool {
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.origin_micros.store(origin_micros, Ordering::Release);
        debug!("Destination {} opened", self.unique_id);
        true
    }

    /// Idempotent; returns true if this call closed it
    pub fn close(&self) -> bool {
        let closed = self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if closed {
            debug!("Destination {} closed", self.unique_id);
        }
        closed
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn microsecond_position(&self, now_micros: u64) -> Option<i64> {
        self.is_open().then(|| {
            (now_micros as i64).wrapping_sub(self.origin_micros.load(Ordering::Acquire) as i64)
        })
    }
}

/// Role-specific half of a record
pub enum Endpoint {
    Source(Source),
    Destination(Destination),
}

/// A directory entry
pub struct EndpointRecord {
    unique_id: u32,
    info: RwLock<EndpointInfo>,
    endpoint: Endpoint,
}

impl EndpointRecord {
    pub fn new(role: Role, info: EndpointInfo, unique_id: u32) -> Self {
        let endpoint = match role {
            Role::Source => Endpoint::Source(Source::new(unique_id)),
            Role::Destination => Endpoint::Destination(Destination::new(unique_id)),
        };
        Self {
            unique_id,
            info: RwLock::new(info),
            endpoint,
        }
    }

    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    pub fn role(&self) -> Role {
        match self.endpoint {
            Endpoint::Source(_) => Role::Source,
            Endpoint::Destination(_) => Role::Destination,
        }
    }

    pub fn info(&self) -> EndpointInfo {
        self.info.read().clone()
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn display_name(&self) -> String {
        self.info.read().display_name.clone()
    }

    pub fn native_ref(&self) -> String {
        self.info.read().native_ref.clone()
    }

    /// Replace metadata; returns true if anything changed
    pub fn refresh(&self, info: EndpointInfo) -> bool {
        let mut current = self.info.write();
        if *current == info {
            return false;
        }
        *current = info;
        true
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn as_source(&self) -> Option<&Source> {
        match &self.endpoint {
            Endpoint::Source(s) => Some(s),
            Endpoint::Destination(_) => None,
        }
    }

    pub fn as_destination(&self) -> Option<&Destination> {
        match &self.endpoint {
            Endpoint::Destination(d) => Some(d),
            Endpoint::Source(_) => None,
        }
    }

    /// Source or error naming the expected role
    pub fn source(&self) -> Result<&Source> {
        self.as_source().ok_or(Error::WrongRole {
            unique_id: self.unique_id,
            expected: Role::Source,
        })
    }

    pub fn destination(&self) -> Result<&Destination> {
        self.as_destination().ok_or(Error::WrongRole {
            unique_id: self.unique_id,
            expected: Role::Destination,
        })
    }

    pub fn is_open(&self) -> bool {
        match &self.endpoint {
            Endpoint::Source(s) => s.is_open(),
            Endpoint::Destination(d) => d.is_open(),
        }
    }

    /// Removal path used by reconciliation and shutdown.
    ///
    /// Sources take the vanished-device path; destinations are closed.
    pub fn teardown(&self) -> bool {
        match &self.endpoint {
            Endpoint::Source(s) => s.device_disappeared(),
            Endpoint::Destination(d) => d.close(),
        }
    }

    pub fn summary(&self) -> EndpointSummary {
        let info = self.info();
        EndpointSummary {
            unique_id: self.unique_id,
            role: self.role(),
            open: self.is_open(),
            name: info.name,
            display_name: info.display_name,
            vendor: info.vendor,
            description: info.description,
            version: info.version,
        }
    }
}

impl fmt::Debug for EndpointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRecord")
            .field("unique_id", &self.unique_id)
            .field("role", &self.role())
            .field("name", &self.name())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Serializable view for listings
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub unique_id: u32,
    pub role: Role,
    pub open: bool,
    pub name: String,
    pub display_name: String,
    pub vendor: String,
    pub description: String,
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn source_record(id: u32) -> EndpointRecord {
        let snapshot = EndpointSnapshot::new(id, format!("in-{}", id), "Keys");
        EndpointRecord::new(Role::Source, EndpointInfo::from_snapshot("MIDI", &snapshot), id)
    }

    #[test]
    fn test_info_defaults() {
        let info = EndpointInfo::from_snapshot("MIDI", &EndpointSnapshot::new(1, "p1", "Pads"));
        assert_eq!(info.vendor, UNKNOWN_VENDOR);
        assert_eq!(info.description, "Pads");
        assert_eq!(info.display_name, "MIDI - Pads");
        assert_eq!(info.information_string(), "<Unknown vendor>: MIDI - Pads");

        let named = EndpointInfo::from_snapshot("", &EndpointSnapshot::new(1, "p1", "Pads").with_vendor("Acme"));
        assert_eq!(named.display_name, "Pads");
        assert_eq!(named.vendor, "Acme");
    }

    #[test]
    fn test_source_deliver_requires_open() {
        let record = source_record(7);
        let source = record.source().unwrap();
        assert!(matches!(
            source.deliver(0, &[0xF8], MalformedPolicy::Resume),
            Err(Error::EndpointClosed(7))
        ));

        assert!(source.open(0, IncompleteSysex::Deliver).unwrap());
        assert!(!source.open(0, IncompleteSysex::Deliver).unwrap());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        source.transmitter().unwrap().set_receiver(Some(Arc::new(move |_: &DecodedMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let delivery = source.deliver(0, &[0x90, 0x40, 0x7F, 0x41, 0x00], MalformedPolicy::Resume).unwrap();
        assert_eq!(delivery.messages, 2);
        assert!(delivery.malformed.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_malformed_policies() {
        let record = source_record(1);
        let source = record.source().unwrap();
        source.open(0, IncompleteSysex::Deliver).unwrap();

        let packet = [0x40, 0x90, 0x40, 0x7F];
        let resumed = source.deliver(0, &packet, MalformedPolicy::Resume).unwrap();
        assert_eq!(resumed.messages, 1);
        assert_eq!(resumed.malformed.len(), 1);

        // Running status from the previous packet would absorb the leading data byte
        source.close();
        source.open(0, IncompleteSysex::Deliver).unwrap();
        let aborted = source.deliver(0, &packet, MalformedPolicy::AbortPacket).unwrap();
        assert_eq!(aborted.messages, 0);
        assert_eq!(aborted.malformed.len(), 1);
    }

    #[test]
    fn test_close_discards_partial_sysex() {
        let record = source_record(1);
        let source = record.source().unwrap();
        source.open(0, IncompleteSysex::Deliver).unwrap();
        source.deliver(0, &[0xF0, 0x01], MalformedPolicy::Resume).unwrap();

        assert!(source.close());
        source.open(0, IncompleteSysex::Deliver).unwrap();
        let delivery = source.deliver(0, &[0x02, 0xF7], MalformedPolicy::Resume).unwrap();
        assert_eq!(delivery.messages, 0);
        assert_eq!(delivery.malformed.len(), 2);
    }

    #[test]
    fn test_device_disappeared_is_idempotent() {
        let record = source_record(3);
        let source = record.source().unwrap();
        source.open(0, IncompleteSysex::Deliver).unwrap();
        let transmitter = source.transmitter().unwrap();

        assert!(record.teardown());
        assert!(!record.teardown());
        assert!(source.is_vanished());
        assert!(!source.is_open());
        assert!(transmitter.is_closed());
        assert!(matches!(
            source.deliver(0, &[0xF8], MalformedPolicy::Resume),
            Err(Error::VanishedDeviceTeardown { unique_id: 3 })
        ));
        assert!(source.open(0, IncompleteSysex::Deliver).is_err());
    }

    #[test]
    fn test_destination_open_close() {
        let snapshot = EndpointSnapshot::new(9, "out-9", "Synth");
        let record = EndpointRecord::new(Role::Destination, EndpointInfo::from_snapshot("", &snapshot), 9);
        assert!(matches!(record.source(), Err(Error::WrongRole { unique_id: 9, expected: Role::Source })));

        let dest = record.destination().unwrap();
        assert!(dest.open(100));
        assert!(!dest.open(200));
        assert_eq!(dest.microsecond_position(350), Some(250));
        assert!(dest.close());
        assert!(!dest.close());
        assert_eq!(dest.microsecond_position(350), None);
    }

    #[test]
    fn test_microsecond_position() {
        let record = source_record(1);
        let source = record.source().unwrap();
        assert_eq!(source.microsecond_position(10), None);
        source.open(1_000, IncompleteSysex::Deliver).unwrap();
        assert_eq!(source.microsecond_position(4_000), Some(3_000));
    }

    #[test]
    fn test_refresh_reports_change() {
        let record = source_record(1);
        let same = record.info();
        assert!(!record.refresh(same.clone()));

        let renamed = EndpointInfo { name: "Keys 2".into(), ..same };
        assert!(record.refresh(renamed));
        assert_eq!(record.name(), "Keys 2");
    }
}
