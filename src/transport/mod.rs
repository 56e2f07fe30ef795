//! Native transport boundary
//!
//! The transport enumerates endpoints, connects sources so their bytes flow
//! into the system, and optionally pushes topology signals. Platforms that
//! cannot push are covered by [`TopologyPoller`].

pub mod memory;
pub mod native;
pub mod poller;

pub use self::memory::MemoryTransport;
pub use self::native::MidirTransport;
pub use self::poller::TopologyPoller;

use std::sync::Arc;

use crate::coalescer::Signaller;
use crate::directory::{EndpointRecord, EndpointSnapshot, Role};
use crate::error::Result;

/// Callback receiving `(raw timestamp, bytes)` for one connected source
pub type PacketSink = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

/// Enumeration and byte delivery provided by a native MIDI layer
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn enumerate_sources(&self) -> Result<Vec<EndpointSnapshot>>;

    fn enumerate_destinations(&self) -> Result<Vec<EndpointSnapshot>>;

    /// Start delivering the source's bytes into `sink`
    fn connect_source(&self, record: &EndpointRecord, sink: PacketSink) -> Result<()>;

    /// Stop delivery. Must tolerate sources that are not connected and
    /// ports that have already vanished.
    fn disconnect_source(&self, unique_id: u32) -> Result<()>;

    /// Current device clock in microseconds
    fn now_micros(&self) -> u64;

    /// Whether the transport raises topology signals by itself
    fn supports_push(&self) -> bool {
        false
    }

    /// Hand the transport a way to raise topology signals
    fn set_topology_signaller(&self, _signaller: Signaller) {}
}

/// Order-sensitive summary of an enumeration, compared by the poller
pub type Fingerprint = Vec<(Role, u32, String)>;

/// Enumerate both roles into a fingerprint
pub fn fingerprint(transport: &dyn Transport) -> Result<Fingerprint> {
    let sources = transport.enumerate_sources()?;
    let destinations = transport.enumerate_destinations()?;

    Ok(sources
        .into_iter()
        .map(|s| (Role::Source, s.unique_id, s.name))
        .chain(destinations.into_iter().map(|d| (Role::Destination, d.unique_id, d.name)))
        .collect())
}
