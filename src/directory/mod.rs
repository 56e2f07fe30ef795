//! Device directory
//!
//! Authoritative, insertion-ordered set of the endpoints the transport
//! currently exposes. `reconcile` applies a fresh enumeration: new IDs are
//! appended, known IDs are refreshed in place, missing IDs are torn down.

mod endpoint;

pub use endpoint::{
    Delivery, Destination, Endpoint, EndpointInfo, EndpointRecord, EndpointSnapshot, EndpointSummary, Role,
    Source, UNKNOWN_VENDOR,
};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<u32>,
    pub updated: Vec<u32>,
    pub removed: Vec<(u32, Role)>,
    /// Records seen again with identical metadata
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Thread-safe endpoint directory
pub struct DeviceDirectory {
    records: RwLock<Vec<Arc<EndpointRecord>>>,
    /// Serializes reconcile passes
    reconcile_lock: Mutex<()>,
    display_prefix: String,
}

impl DeviceDirectory {
    /// Create an empty directory; display names are "<prefix> - <name>"
    pub fn new(display_prefix: impl Into<String>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            reconcile_lock: Mutex::new(()),
            display_prefix: display_prefix.into(),
        }
    }

    /// Apply one enumeration pass. Sources are processed before
    /// destinations.
    ///
    /// Removed records are torn down after the directory lock is released;
    /// receivers notified by the teardown may read the directory.
    pub fn reconcile(&self, sources: &[EndpointSnapshot], destinations: &[EndpointSnapshot]) -> ReconcileReport {
        let _pass = self.reconcile_lock.lock();
        let mut report = ReconcileReport::default();
        let mut torn_down: Vec<Arc<EndpointRecord>> = Vec::new();
        let mut seen: HashSet<u32> = HashSet::new();

        {
            let mut records = self.records.write();

            for (role, snapshots) in [(Role::Source, sources), (Role::Destination, destinations)] {
                for snapshot in snapshots {
                    let id = snapshot.unique_id;
                    if !seen.insert(id) {
                        warn!("Endpoint {} ({}) enumerated twice, keeping first sighting", id, snapshot.name);
                        continue;
                    }

                    let info = EndpointInfo::from_snapshot(&self.display_prefix, snapshot);
                    match records.iter().position(|r| r.unique_id() == id) {
                        Some(index) if records[index].role() == role => {
                            if records[index].refresh(info) {
                                report.updated.push(id);
                            } else {
                                report.unchanged += 1;
                            }
                        }
                        Some(index) => {
                            let old = records.remove(index);
                            debug!("Endpoint {} changed role {} -> {}", id, old.role(), role);
                            report.removed.push((id, old.role()));
                            torn_down.push(old);
                            records.push(Arc::new(EndpointRecord::new(role, info, id)));
                            report.added.push(id);
                        }
                        None => {
                            records.push(Arc::new(EndpointRecord::new(role, info, id)));
                            report.added.push(id);
                        }
                    }
                }
            }

            let (kept, gone): (Vec<_>, Vec<_>) =
                records.drain(..).partition(|r| seen.contains(&r.unique_id()));
            *records = kept;
            for record in gone {
                report.removed.push((record.unique_id(), record.role()));
                torn_down.push(record);
            }
        }

        for record in &torn_down {
            record.teardown();
        }

        if report.is_empty() {
            debug!("Reconcile: {} endpoints unchanged", report.unchanged);
        } else {
            info!(
                "Reconcile: +{} ~{} -{} ({} total)",
                report.added.len(),
                report.updated.len(),
                report.removed.len(),
                self.len()
            );
        }
        report
    }

    pub fn get(&self, unique_id: u32) -> Option<Arc<EndpointRecord>> {
        self.records.read().iter().find(|r| r.unique_id() == unique_id).cloned()
    }

    /// Snapshot in insertion order
    pub fn list(&self) -> Vec<Arc<EndpointRecord>> {
        self.records.read().clone()
    }

    pub fn sources(&self) -> Vec<Arc<EndpointRecord>> {
        self.by_role(Role::Source)
    }

    pub fn destinations(&self) -> Vec<Arc<EndpointRecord>> {
        self.by_role(Role::Destination)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, unique_id: u32) -> bool {
        self.records.read().iter().any(|r| r.unique_id() == unique_id)
    }

    /// Remove and tear down every record
    pub fn clear(&self) -> usize {
        let _pass = self.reconcile_lock.lock();
        let drained: Vec<_> = std::mem::take(&mut *self.records.write());
        for record in &drained {
            record.teardown();
        }
        drained.len()
    }

    pub fn summaries(&self) -> Vec<EndpointSummary> {
        self.list().iter().map(|r| r.summary()).collect()
    }

    fn by_role(&self, role: Role) -> Vec<Arc<EndpointRecord>> {
        self.records.read().iter().filter(|r| r.role() == role).cloned().collect()
    }
}

impl Default for DeviceDirectory {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::IncompleteSysex;

    fn snap(id: u32, name: &str) -> EndpointSnapshot {
        EndpointSnapshot::new(id, format!("port-{}", id), name)
    }

    fn ids(records: &[Arc<EndpointRecord>]) -> Vec<u32> {
        records.iter().map(|r| r.unique_id()).collect()
    }

    const A: u32 = 1;
    const B: u32 = 2;
    const C: u32 = 3;
    const D: u32 = 4;

    #[test]
    fn test_initial_build_order() {
        let directory = DeviceDirectory::new("MIDI");
        let report = directory.reconcile(&[snap(A, "A"), snap(B, "B")], &[snap(C, "C")]);

        assert_eq!(directory.len(), 3);
        assert_eq!(ids(&directory.list()), vec![A, B, C]);
        assert_eq!(report.added, vec![A, B, C]);
        assert_eq!(directory.get(C).unwrap().role(), Role::Destination);
        assert_eq!(directory.get(A).unwrap().display_name(), "MIDI - A");
    }

    #[test]
    fn test_second_pass_preserves_identity_and_tears_down_once() {
        let directory = DeviceDirectory::new("");
        directory.reconcile(&[snap(A, "A"), snap(B, "B")], &[snap(C, "C")]);

        let a = directory.get(A).unwrap();
        let b = directory.get(B).unwrap();
        b.source().unwrap().open(0, IncompleteSysex::Deliver).unwrap();
        let a_transmitter = a.source().unwrap().transmitter().unwrap();

        let report = directory.reconcile(&[snap(B, "B")], &[snap(C, "C"), snap(D, "D")]);

        assert_eq!(directory.len(), 3);
        assert_eq!(ids(&directory.list()), vec![B, C, D]);
        assert_eq!(report.removed, vec![(A, Role::Source)]);
        assert_eq!(report.added, vec![D]);
        assert!(Arc::ptr_eq(&b, &directory.get(B).unwrap()));
        assert!(b.is_open());

        // Torn down exactly once
        assert!(a.source().unwrap().is_vanished());
        assert!(a_transmitter.is_closed());
        assert!(!a.teardown());
        assert!(!directory.contains(A));
    }

    #[test]
    fn test_rename_updates_in_place() {
        let directory = DeviceDirectory::new("");
        directory.reconcile(&[snap(A, "Keys")], &[]);
        let before = directory.get(A).unwrap();

        let report = directory.reconcile(&[snap(A, "Keys (2)")], &[]);
        assert_eq!(report.updated, vec![A]);
        assert!(Arc::ptr_eq(&before, &directory.get(A).unwrap()));
        assert_eq!(before.name(), "Keys (2)");

        let report = directory.reconcile(&[snap(A, "Keys (2)")], &[]);
        assert!(report.is_empty());
        assert_eq!(report.unchanged, 1);
    }

    #[test]
    fn test_removed_destination_is_closed() {
        let directory = DeviceDirectory::new("");
        directory.reconcile(&[], &[snap(C, "C")]);
        let c = directory.get(C).unwrap();
        assert!(c.destination().unwrap().open(0));

        directory.reconcile(&[], &[]);
        assert!(!c.is_open());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_duplicate_id_in_one_pass_keeps_first() {
        let directory = DeviceDirectory::new("");
        let report = directory.reconcile(&[snap(A, "first"), snap(A, "second")], &[snap(A, "third")]);
        assert_eq!(directory.len(), 1);
        assert_eq!(report.added, vec![A]);
        assert_eq!(directory.get(A).unwrap().name(), "first");
        assert_eq!(directory.get(A).unwrap().role(), Role::Source);
    }

    #[test]
    fn test_role_change_reinserts() {
        let directory = DeviceDirectory::new("");
        directory.reconcile(&[snap(A, "A"), snap(B, "B")], &[]);
        let old = directory.get(A).unwrap();

        let report = directory.reconcile(&[snap(B, "B")], &[snap(A, "A")]);
        assert_eq!(report.removed, vec![(A, Role::Source)]);
        assert_eq!(report.added, vec![A]);
        assert!(old.source().unwrap().is_vanished());

        let new = directory.get(A).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.role(), Role::Destination);
        assert_eq!(ids(&directory.list()), vec![B, A]);
    }

    #[test]
    fn test_queries_and_clear() {
        let directory = DeviceDirectory::default();
        directory.reconcile(&[snap(A, "A"), snap(B, "B")], &[snap(C, "C")]);
        assert_eq!(ids(&directory.sources()), vec![A, B]);
        assert_eq!(ids(&directory.destinations()), vec![C]);
        assert_eq!(directory.summaries().len(), 3);

        let a = directory.get(A).unwrap();
        assert_eq!(directory.clear(), 3);
        assert!(directory.is_empty());
        assert!(a.source().unwrap().is_vanished());
        assert!(directory.get(A).is_none());
    }

    #[test]
    fn test_teardown_receiver_can_read_directory() {
        use crate::decoder::DecodedMessage;
        use crate::dispatcher::MessageReceiver;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Observer {
            directory: Arc<DeviceDirectory>,
            seen: Arc<AtomicUsize>,
        }
        impl MessageReceiver for Observer {
            fn send(&self, _message: &DecodedMessage) {}
            fn close(&self) {
                self.seen.store(self.directory.len(), Ordering::SeqCst);
            }
        }

        let directory = Arc::new(DeviceDirectory::new(""));
        directory.reconcile(&[snap(A, "A"), snap(B, "B")], &[]);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        directory
            .get(A)
            .unwrap()
            .source()
            .unwrap()
            .transmitter()
            .unwrap()
            .set_receiver(Some(Arc::new(Observer {
                directory: directory.clone(),
                seen: seen.clone(),
            })));

        directory.reconcile(&[snap(B, "B")], &[]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
