//! Terminal output for the `list` and `monitor` commands

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use colored::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use midi_directory::directory::{DeviceDirectory, EndpointSummary, Role};
use midi_directory::midi::{format_hex, MidiMessage};
use midi_directory::{DecodedMessage, MessageReceiver, MidiSystem, TopologyListener};

/// Event forwarded from transmitters to the printing loop
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Message { port: String, message: DecodedMessage },
    Detached { port: String },
}

/// Print the directory as a table or JSON
pub fn print_endpoints(directory: &DeviceDirectory, json: bool) -> Result<()> {
    let summaries = directory.summaries();

    if json {
        let text = serde_json::to_string_pretty(&summaries).context("Failed to serialize endpoints")?;
        println!("{}", text);
        return Ok(());
    }

    println!("\n{}", "=== MIDI Endpoints ===".bold().cyan());
    print_role(&summaries, Role::Source, "Sources:");
    print_role(&summaries, Role::Destination, "Destinations:");
    println!();
    Ok(())
}

fn print_role(summaries: &[EndpointSummary], role: Role, title: &str) {
    println!("\n{}", title.bold());
    let mut any = false;
    for summary in summaries.iter().filter(|s| s.role == role) {
        any = true;
        println!(
            "  {} {} {}",
            format!("{:08X}", summary.unique_id).dimmed(),
            summary.display_name.bright_white(),
            format!("({})", summary.vendor).dimmed()
        );
    }
    if !any {
        println!("  {}", "None found".dimmed());
    }
}

/// Forwards decoded messages of one source into the monitor channel
struct MonitorReceiver {
    port: String,
    tx: mpsc::Sender<MonitorEvent>,
}

impl MessageReceiver for MonitorReceiver {
    fn send(&self, message: &DecodedMessage) {
        let event = MonitorEvent::Message {
            port: self.port.clone(),
            message: message.clone(),
        };
        if self.tx.try_send(event).is_err() {
            debug!("Monitor queue full, dropping message from {}", self.port);
        }
    }

    fn close(&self) {
        let _ = self.tx.try_send(MonitorEvent::Detached {
            port: self.port.clone(),
        });
    }
}

/// Opens matching sources, now and after every hot-plug round
struct SourceAttacher {
    system: Weak<MidiSystem>,
    filter: Option<String>,
    attached: Mutex<HashSet<u32>>,
    tx: mpsc::Sender<MonitorEvent>,
}

impl SourceAttacher {
    fn attach_all(&self) -> midi_directory::Result<()> {
        let Some(system) = self.system.upgrade() else {
            return Ok(());
        };

        let mut attached = self.attached.lock();
        attached.retain(|id| system.directory().contains(*id));

        for record in system.directory().sources() {
            let id = record.unique_id();
            if attached.contains(&id) || !self.matches(&record.name()) {
                continue;
            }

            let transmitter = match system.transmitter(id) {
                Ok(transmitter) => transmitter,
                Err(e) => {
                    warn!("Cannot attach '{}': {}", record.display_name(), e);
                    continue;
                }
            };
            transmitter.set_receiver(Some(Arc::new(MonitorReceiver {
                port: record.display_name(),
                tx: self.tx.clone(),
            })));

            match system.open_source(id) {
                Ok(_) => {
                    info!("Monitoring '{}'", record.display_name());
                    attached.insert(id);
                }
                Err(e) => {
                    transmitter.close();
                    warn!("Cannot open '{}': {}", record.display_name(), e);
                }
            }
        }
        Ok(())
    }

    fn matches(&self, name: &str) -> bool {
        match &self.filter {
            Some(filter) => name.to_lowercase().contains(&filter.to_lowercase()),
            None => true,
        }
    }
}

impl TopologyListener for SourceAttacher {
    fn name(&self) -> &str {
        "monitor"
    }

    fn midi_system_updated(&self) -> midi_directory::Result<()> {
        self.attach_all()
    }
}

/// Print decoded traffic until Ctrl+C
pub async fn run_monitor(system: Arc<MidiSystem>, filter: Option<String>) -> Result<()> {
    println!("{}", "=== MIDI Monitor ===".bold().cyan());
    println!("Press Ctrl+C to exit\n");

    let (tx, mut rx) = mpsc::channel::<MonitorEvent>(1000);
    let attacher = Arc::new(SourceAttacher {
        system: Arc::downgrade(&system),
        filter,
        attached: Mutex::new(HashSet::new()),
        tx,
    });
    attacher.attach_all().context("Failed to open sources")?;

    let listener: Arc<dyn TopologyListener> = attacher.clone();
    system.coalescer().register_listener(listener.clone());

    if attacher.attached.lock().is_empty() {
        println!("{}", "No matching sources yet, waiting for devices...".yellow());
    }

    loop {
        tokio::select! {
            Some(event) = rx.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    system.coalescer().unregister_listener(&listener);
    println!("\n{}", "Monitor stopped".yellow());
    Ok(())
}

fn print_event(event: &MonitorEvent) {
    let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();

    let (port, message) = match event {
        MonitorEvent::Message { port, message } => (port, message),
        MonitorEvent::Detached { port } => {
            println!("[{}] {} {}", time.dimmed(), port.white(), "detached".red());
            return;
        }
    };

    let port = if port.chars().count() > 24 {
        format!("{}...", port.chars().take(21).collect::<String>())
    } else {
        port.clone()
    };

    let hex = format_hex(&message.bytes());
    let parsed = message.to_midi();
    let hex_colored = match &parsed {
        Some(MidiMessage::NoteOn { .. }) => hex.bright_green(),
        Some(MidiMessage::NoteOff { .. }) => hex.bright_red(),
        Some(MidiMessage::ControlChange { .. }) => hex.bright_yellow(),
        Some(MidiMessage::PitchBend { .. }) => hex.bright_cyan(),
        Some(MidiMessage::SysEx { .. }) => hex.bright_magenta(),
        Some(_) => hex.normal(),
        None => hex.bright_black(),
    };
    let parsed = parsed
        .map(|m| format!(" => {}", m.to_string().bright_blue()))
        .unwrap_or_default();

    println!(
        "[{}] {:>10} {:24} | {}{}",
        time.dimmed(),
        message.timestamp.to_string().dimmed(),
        port.white(),
        hex_colored,
        parsed
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi_directory::{AppConfig, EndpointSnapshot, MemoryTransport};
    use tokio::runtime::Handle;

    fn attacher(system: &Arc<MidiSystem>, filter: Option<&str>) -> (SourceAttacher, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let attacher = SourceAttacher {
            system: Arc::downgrade(system),
            filter: filter.map(str::to_string),
            attached: Mutex::new(HashSet::new()),
            tx,
        };
        (attacher, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_attach_skips_failing_source_and_continues() {
        let transport = Arc::new(MemoryTransport::new());
        transport.plug_source(EndpointSnapshot::new(1, "in-1", "Keys"));
        transport.plug_source(EndpointSnapshot::new(2, "in-2", "Pads"));
        let system = MidiSystem::start(transport.clone(), AppConfig::default(), Handle::current()).unwrap();

        // Still listed, but no longer accepts transmitters
        let keys = system.directory().get(1).unwrap();
        keys.source().unwrap().device_disappeared();

        let (attacher, _rx) = attacher(&system, None);
        attacher.attach_all().unwrap();

        let attached = attacher.attached.lock().clone();
        assert_eq!(attached, HashSet::from([2]));
        assert!(transport.is_connected(2));

        system.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_filter_matches_name_case_insensitively() {
        let transport = Arc::new(MemoryTransport::new());
        transport.plug_source(EndpointSnapshot::new(1, "in-1", "Keys"));
        transport.plug_source(EndpointSnapshot::new(2, "in-2", "Pads"));
        let system = MidiSystem::start(transport.clone(), AppConfig::default(), Handle::current()).unwrap();

        let (attacher, _rx) = attacher(&system, Some("pAd"));
        attacher.attach_all().unwrap();
        assert_eq!(*attacher.attached.lock(), HashSet::from([2]));

        system.shutdown().await;
    }
}
