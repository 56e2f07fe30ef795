//! MIDI system service
//!
//! Owns the directory, the coalescer and the transport. Constructed
//! explicitly with [`MidiSystem::start`] and torn down with
//! [`MidiSystem::shutdown`]; collaborators receive an `Arc<MidiSystem>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::coalescer::{NotificationCoalescer, TopologyListener};
use crate::config::AppConfig;
use crate::directory::{Delivery, DeviceDirectory, EndpointRecord, ReconcileReport, Role};
use crate::dispatcher::Transmitter;
use crate::error::{Error, Result};
use crate::transport::{PacketSink, TopologyPoller, Transport};

/// Directory consumer: reconciles from a fresh enumeration each round
struct DirectoryRefresh {
    system: Weak<MidiSystem>,
}

impl TopologyListener for DirectoryRefresh {
    fn name(&self) -> &str {
        "directory"
    }

    fn midi_system_updated(&self) -> Result<()> {
        match self.system.upgrade() {
            Some(system) => system.refresh_directory().map(|_| ()),
            None => Ok(()),
        }
    }
}

pub struct MidiSystem {
    transport: Arc<dyn Transport>,
    directory: Arc<DeviceDirectory>,
    coalescer: NotificationCoalescer,
    config: AppConfig,
    available: bool,
    shut_down: AtomicBool,
    self_ref: Weak<MidiSystem>,
}

impl MidiSystem {
    /// Build the service and run the initial reconciliation.
    ///
    /// An unavailable transport is not an error: the directory stays empty
    /// and opening endpoints fails with [`Error::NativeUnavailable`].
    pub fn start(transport: Arc<dyn Transport>, config: AppConfig, runtime: Handle) -> Result<Arc<Self>> {
        config.validate()?;

        let available = transport.is_available();
        let coalescer = NotificationCoalescer::new(runtime.clone());
        let directory = Arc::new(DeviceDirectory::new(config.client_name.clone()));

        let system = Arc::new_cyclic(|weak| Self {
            transport: transport.clone(),
            directory,
            coalescer: coalescer.clone(),
            config,
            available,
            shut_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        });

        coalescer.register_directory_consumer(Arc::new(DirectoryRefresh {
            system: Arc::downgrade(&system),
        }));

        if !available {
            warn!("Transport '{}' unavailable, directory stays empty", transport.name());
            return Ok(system);
        }

        transport.set_topology_signaller(coalescer.signaller());
        if system.config.polling.enabled(transport.supports_push()) {
            let poller = TopologyPoller::new(
                transport.clone(),
                coalescer.signaller(),
                system.config.polling.interval(),
                runtime,
            );
            coalescer.set_polling_fallback(Arc::new(poller));
            debug!("Polling fallback attached ({:?})", system.config.polling.interval());
        }

        system.refresh_directory()?;
        info!(
            "MIDI system started on '{}' with {} endpoints",
            transport.name(),
            system.directory.len()
        );
        Ok(system)
    }

    /// Stop polling, let the current round finish, close everything
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.coalescer.stop_polling();
        self.coalescer.wait_idle().await;

        for record in self.directory.sources() {
            if record.is_open() {
                if let Err(e) = self.transport.disconnect_source(record.unique_id()) {
                    warn!("Disconnect of {} failed: {}", record.unique_id(), e);
                }
            }
        }
        let cleared = self.directory.clear();
        info!("MIDI system shut down ({} endpoints released)", cleared);
    }

    pub fn directory(&self) -> &Arc<DeviceDirectory> {
        &self.directory
    }

    pub fn coalescer(&self) -> &NotificationCoalescer {
        &self.coalescer
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Entry point for native topology notifications
    pub fn raw_topology_changed(&self) {
        self.coalescer.signal();
    }

    /// Enumerate and reconcile now. Runs inside delivery rounds and at
    /// startup.
    pub fn refresh_directory(&self) -> Result<ReconcileReport> {
        if !self.available || self.is_shut_down() {
            return Ok(ReconcileReport::default());
        }

        let sources = self.transport.enumerate_sources()?;
        let destinations = self.transport.enumerate_destinations()?;
        let report = self.directory.reconcile(&sources, &destinations);

        for (unique_id, role) in &report.removed {
            if *role == Role::Source {
                // Transport bookkeeping only; the port is already gone
                if let Err(e) = self.transport.disconnect_source(*unique_id) {
                    debug!("Cleanup of vanished source {} failed: {}", unique_id, e);
                }
            }
        }
        Ok(report)
    }

    /// Entry point for native byte delivery
    pub fn deliver_bytes(&self, unique_id: u32, raw_timestamp: u64, bytes: &[u8]) -> Result<Delivery> {
        let record = self.record(unique_id)?;
        record.source()?.deliver(raw_timestamp, bytes, self.config.malformed)
    }

    /// Open a source and connect it to the transport
    pub fn open_source(&self, unique_id: u32) -> Result<Arc<EndpointRecord>> {
        self.ensure_available()?;
        let record = self.record(unique_id)?;
        let source = record.source()?;

        if !source.open(self.transport.now_micros(), self.config.sysex.incomplete)? {
            return Ok(record);
        }

        if let Err(e) = self.transport.connect_source(&record, self.packet_sink(unique_id)) {
            source.close();
            return Err(e);
        }
        info!("Opened source '{}'", record.display_name());
        Ok(record)
    }

    /// Disconnect and close a source; false if it was not open
    pub fn close_source(&self, unique_id: u32) -> Result<bool> {
        let record = self.record(unique_id)?;
        let source = record.source()?;
        self.transport.disconnect_source(unique_id)?;
        Ok(source.close())
    }

    pub fn open_destination(&self, unique_id: u32) -> Result<Arc<EndpointRecord>> {
        self.ensure_available()?;
        let record = self.record(unique_id)?;
        if record.destination()?.open(self.transport.now_micros()) {
            info!("Opened destination '{}'", record.display_name());
        }
        Ok(record)
    }

    pub fn close_destination(&self, unique_id: u32) -> Result<bool> {
        let record = self.record(unique_id)?;
        Ok(record.destination()?.close())
    }

    /// New transmitter on a source
    pub fn transmitter(&self, unique_id: u32) -> Result<Arc<Transmitter>> {
        self.record(unique_id)?.source()?.transmitter()
    }

    fn record(&self, unique_id: u32) -> Result<Arc<EndpointRecord>> {
        self.directory.get(unique_id).ok_or(Error::UnknownEndpoint(unique_id))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::NativeUnavailable(format!(
                "transport '{}' is not available",
                self.transport.name()
            )))
        }
    }

    fn packet_sink(&self, unique_id: u32) -> PacketSink {
        let system = self.self_ref.clone();
        Arc::new(move |raw_timestamp: u64, bytes: &[u8]| {
            let Some(system) = system.upgrade() else {
                return;
            };
            if let Err(e) = system.deliver_bytes(unique_id, raw_timestamp, bytes) {
                debug!("Dropped packet for {}: {}", unique_id, e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodedMessage;
    use crate::directory::EndpointSnapshot;
    use crate::transport::MemoryTransport;
    use parking_lot::Mutex;

    fn start(transport: &Arc<MemoryTransport>) -> Arc<MidiSystem> {
        MidiSystem::start(transport.clone(), AppConfig::default(), Handle::current()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_reconcile() {
        let transport = Arc::new(MemoryTransport::new());
        transport.plug_source(EndpointSnapshot::new(1, "in-1", "Keys"));
        transport.plug_destination(EndpointSnapshot::new(2, "out-2", "Synth"));

        let system = start(&transport);
        assert_eq!(system.directory().len(), 2);
        assert_eq!(
            system.directory().get(1).unwrap().display_name(),
            "midi-directory - Keys"
        );
        system.shutdown().await;
        assert!(system.directory().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bytes_flow_to_transmitter() {
        let transport = Arc::new(MemoryTransport::new());
        transport.plug_source(EndpointSnapshot::new(1, "in-1", "Keys"));
        let system = start(&transport);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        system
            .transmitter(1)
            .unwrap()
            .set_receiver(Some(Arc::new(move |m: &DecodedMessage| sink.lock().push(m.bytes()))));

        transport.set_clock(1_000);
        system.open_source(1).unwrap();
        assert!(transport.is_connected(1));

        assert!(transport.push_bytes(1, 0, &[0x90, 0x40]));
        assert!(transport.push_bytes(1, 0, &[0x7F, 0xF0, 0x01]));
        assert!(transport.push_bytes(1, 0, &[0xF7]));
        assert_eq!(
            *received.lock(),
            vec![vec![0x90, 0x40, 0x7F], vec![0xF0, 0x01, 0xF7]]
        );

        assert!(system.close_source(1).unwrap());
        assert!(!transport.is_connected(1));
        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_role_and_identity_errors() {
        let transport = Arc::new(MemoryTransport::new());
        transport.plug_destination(EndpointSnapshot::new(2, "out-2", "Synth"));
        let system = start(&transport);

        assert!(matches!(system.open_source(2), Err(Error::WrongRole { unique_id: 2, .. })));
        assert!(matches!(system.open_source(9), Err(Error::UnknownEndpoint(9))));
        assert!(matches!(system.deliver_bytes(2, 0, &[0xF8]), Err(Error::WrongRole { .. })));

        system.open_destination(2).unwrap();
        assert!(system.close_destination(2).unwrap());
        assert!(!system.close_destination(2).unwrap());
        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unavailable_transport() {
        let transport = Arc::new(MemoryTransport::unavailable());
        let system = MidiSystem::start(transport, AppConfig::default(), Handle::current()).unwrap();

        assert!(!system.is_available());
        assert!(system.directory().is_empty());
        assert!(matches!(system.open_source(1), Err(Error::NativeUnavailable(_))));

        system.raw_topology_changed();
        system.coalescer().wait_idle().await;
        assert!(system.directory().is_empty());
        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.polling.interval_ms = 1;
        let result = MidiSystem::start(Arc::new(MemoryTransport::new()), config, Handle::current());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
