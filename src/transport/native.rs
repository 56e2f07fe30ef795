//! midir-backed transport
//!
//! midir cannot push hot-plug notifications, so this transport relies on
//! the topology poller. Unique IDs are derived from the port identifiers
//! midir exposes, which stay stable across re-enumeration.

use std::collections::HashMap;
use std::time::Instant;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::{PacketSink, Transport};
use crate::directory::{EndpointRecord, EndpointSnapshot, Role};
use crate::error::{Error, Result};

/// Stable 32-bit ID for a native port.
///
/// Input and output ports may share an identifier string, so the role is
/// part of the hashed key.
pub fn endpoint_id(role: Role, port_id: &str) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:{}", role, port_id).as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Microseconds on the transport clock, never 0.
///
/// midir stamps come from backend clocks with unrelated epochs, so packets
/// are stamped on arrival with the same clock that provides open origins.
/// 0 is reserved for "now" and is never produced.
fn clock_micros(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_micros()).unwrap_or(u64::MAX).max(1)
}

/// Transport over the platform MIDI API via midir
pub struct MidirTransport {
    client_name: String,
    connections: Mutex<HashMap<u32, MidiInputConnection<()>>>,
    clock: Instant,
}

impl MidirTransport {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            connections: Mutex::new(HashMap::new()),
            clock: Instant::now(),
        }
    }

    fn input(&self, suffix: &str) -> Result<MidiInput> {
        let mut input = MidiInput::new(&format!("{}-{}", self.client_name, suffix))?;
        input.ignore(Ignore::None);
        Ok(input)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Transport for MidirTransport {
    fn name(&self) -> &str {
        "midir"
    }

    fn is_available(&self) -> bool {
        match MidiInput::new(&format!("{}-probe", self.client_name)) {
            Ok(_) => true,
            Err(e) => {
                warn!("MIDI backend unavailable: {}", e);
                false
            }
        }
    }

    fn enumerate_sources(&self) -> Result<Vec<EndpointSnapshot>> {
        let input = self.input("scan")?;
        let mut snapshots = Vec::new();

        for port in input.ports() {
            let name = match input.port_name(&port) {
                Ok(name) => name,
                Err(e) => {
                    // Port vanished mid-enumeration
                    debug!("Skipping input port: {}", e);
                    continue;
                }
            };
            let port_id = port.id();
            snapshots.push(EndpointSnapshot::new(endpoint_id(Role::Source, &port_id), port_id, name));
        }
        Ok(snapshots)
    }

    fn enumerate_destinations(&self) -> Result<Vec<EndpointSnapshot>> {
        let output = MidiOutput::new(&format!("{}-scan", self.client_name))
            .map_err(|e| Error::NativeUnavailable(e.to_string()))?;
        let mut snapshots = Vec::new();

        for port in output.ports() {
            let name = match output.port_name(&port) {
                Ok(name) => name,
                Err(e) => {
                    debug!("Skipping output port: {}", e);
                    continue;
                }
            };
            let port_id = port.id();
            snapshots.push(EndpointSnapshot::new(
                endpoint_id(Role::Destination, &port_id),
                port_id,
                name,
            ));
        }
        Ok(snapshots)
    }

    fn connect_source(&self, record: &EndpointRecord, sink: PacketSink) -> Result<()> {
        let unique_id = record.unique_id();
        if self.connections.lock().contains_key(&unique_id) {
            return Ok(());
        }

        let input = self.input("in")?;
        let native_ref = record.native_ref();
        let port = input
            .ports()
            .into_iter()
            .find(|p| p.id() == native_ref)
            .ok_or(Error::UnknownEndpoint(unique_id))?;

        let clock = self.clock;
        let connection = input.connect(
            &port,
            &format!("{}-{}", self.client_name, unique_id),
            move |_backend_stamp, bytes, _| sink(clock_micros(clock), bytes),
            (),
        )?;

        self.connections.lock().insert(unique_id, connection);
        info!("Connected source '{}' ({})", record.name(), unique_id);
        Ok(())
    }

    fn disconnect_source(&self, unique_id: u32) -> Result<()> {
        let connection = self.connections.lock().remove(&unique_id);
        if let Some(connection) = connection {
            connection.close();
            info!("Disconnected source {}", unique_id);
        }
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        clock_micros(self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_id_is_stable_and_role_scoped() {
        let a = endpoint_id(Role::Source, "128:0");
        assert_eq!(a, endpoint_id(Role::Source, "128:0"));
        assert_ne!(a, endpoint_id(Role::Destination, "128:0"));
        assert_ne!(a, endpoint_id(Role::Source, "128:1"));
    }

    #[test]
    fn test_packet_stamps_share_the_origin_clock() {
        let transport = MidirTransport::new("test");
        assert!(clock_micros(Instant::now()) >= 1);

        let origin = transport.now_micros();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let stamp = clock_micros(transport.clock);
        assert!(stamp >= origin + 5_000);

        match crate::decoder::Timestamp::normalize(stamp, origin) {
            crate::decoder::Timestamp::Micros(us) => assert!((5_000..1_000_000).contains(&us)),
            other => panic!("expected a relative stamp, got {:?}", other),
        }
    }

    #[test]
    fn test_now_micros_is_monotonic() {
        let transport = MidirTransport::new("test");
        let first = transport.now_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(transport.now_micros() > first);
        assert!(!transport.supports_push());
        assert_eq!(transport.connected_count(), 0);
    }
}
