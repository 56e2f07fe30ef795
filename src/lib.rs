//! MIDI Directory
//!
//! Hot-plug aware directory of MIDI endpoints with a streaming message
//! decoder. Native byte packets are rebuilt into complete messages per
//! source and fanned out to transmitters; bursts of topology signals are
//! coalesced into ordered rounds that reconcile the directory before any
//! external listener is notified.

pub mod coalescer;
pub mod config;
pub mod decoder;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod midi;
pub mod system;
pub mod transport;

pub use coalescer::{NotificationCoalescer, PollingFallback, Signaller, TopologyListener};
pub use config::AppConfig;
pub use decoder::{DecodedMessage, IncompleteSysex, MalformedPolicy, MessageDecoder, MessageKind, Timestamp};
pub use directory::{DeviceDirectory, EndpointRecord, EndpointSnapshot, ReconcileReport, Role};
pub use dispatcher::{Dispatcher, MessageReceiver, Transmitter};
pub use error::{Error, Result};
pub use system::MidiSystem;
pub use transport::{MemoryTransport, MidirTransport, Transport};
