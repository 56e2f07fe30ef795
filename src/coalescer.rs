//! Topology change notification with coalescing
//!
//! Raw "something changed" signals may arrive in bursts from any thread.
//! The coalescer folds them into delivery rounds run by a single blocking
//! task: the directory consumer is called first, then every external
//! listener in registration order. `signal()` never blocks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Receives a call after each delivery round
pub trait TopologyListener: Send + Sync {
    /// Name used in failure logs
    fn name(&self) -> &str {
        "listener"
    }

    fn midi_system_updated(&self) -> Result<()>;
}

impl<F> TopologyListener for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn midi_system_updated(&self) -> Result<()> {
        self()
    }
}

/// Platform polling used where the transport cannot push topology signals
pub trait PollingFallback: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

struct Inner {
    pending: AtomicUsize,
    round_active: AtomicBool,
    rounds: AtomicU64,
    directory_consumer: RwLock<Option<Arc<dyn TopologyListener>>>,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
    polling: RwLock<Option<Arc<dyn PollingFallback>>>,
    idle: Notify,
    runtime: Handle,
}

/// Debounces topology signals into ordered delivery rounds
#[derive(Clone)]
pub struct NotificationCoalescer {
    inner: Arc<Inner>,
}

/// Weak handle for raising signals from transport callbacks and pollers
#[derive(Clone)]
pub struct Signaller {
    inner: Weak<Inner>,
}

impl Signaller {
    /// Returns false once the coalescer has been dropped
    pub fn signal(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                Inner::signal(&inner);
                true
            }
            None => false,
        }
    }
}

impl NotificationCoalescer {
    /// Delivery rounds run as blocking tasks on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: AtomicUsize::new(0),
                round_active: AtomicBool::new(false),
                rounds: AtomicU64::new(0),
                directory_consumer: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                polling: RwLock::new(None),
                idle: Notify::new(),
                runtime,
            }),
        }
    }

    /// Record a topology change; starts a delivery task if none is running
    pub fn signal(&self) {
        Inner::signal(&self.inner);
    }

    pub fn signaller(&self) -> Signaller {
        Signaller {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Install the consumer that reconciles the directory.
    ///
    /// Replaces any previous consumer.
    pub fn register_directory_consumer(&self, consumer: Arc<dyn TopologyListener>) {
        let previous = self.inner.directory_consumer.write().replace(consumer);
        if previous.is_some() {
            debug!("Directory consumer replaced");
        }
    }

    /// Add an external listener. Registering the same listener twice is a
    /// no-op. The first listener starts the polling fallback, if any.
    pub fn register_listener(&self, listener: Arc<dyn TopologyListener>) -> bool {
        let first = {
            let mut listeners = self.inner.listeners.write();
            if listeners.iter().any(|l| same_listener(l, &listener)) {
                return false;
            }
            listeners.push(listener);
            listeners.len() == 1
        };

        if first {
            if let Some(polling) = self.inner.polling.read().clone() {
                debug!("Starting topology polling");
                polling.start();
            }
        }
        true
    }

    /// Remove a listener. Stops the polling fallback when none remain.
    pub fn unregister_listener(&self, listener: &Arc<dyn TopologyListener>) -> bool {
        let (removed, now_empty) = {
            let mut listeners = self.inner.listeners.write();
            let before = listeners.len();
            listeners.retain(|l| !same_listener(l, listener));
            (listeners.len() != before, listeners.is_empty())
        };

        if removed && now_empty {
            if let Some(polling) = self.inner.polling.read().clone() {
                debug!("Stopping topology polling");
                polling.stop();
            }
        }
        removed
    }

    /// Attach the platform polling fallback
    pub fn set_polling_fallback(&self, polling: Arc<dyn PollingFallback>) {
        let has_listeners = self.listener_count() > 0;
        let previous = self.inner.polling.write().replace(polling.clone());
        if let Some(previous) = previous {
            previous.stop();
        }
        if has_listeners {
            polling.start();
        }
    }

    /// Stop and detach the polling fallback
    pub fn stop_polling(&self) {
        if let Some(polling) = self.inner.polling.write().take() {
            polling.stop();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Signals not yet covered by a completed pass
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn rounds_completed(&self) -> u64 {
        self.inner.rounds.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.inner.round_active.load(Ordering::Acquire)
    }

    /// Resolve once no delivery round is active or pending
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_active() && self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn signal(this: &Arc<Inner>) {
        let pending = this.pending.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Topology signal ({} pending)", pending);

        if this
            .round_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = this.clone();
            this.runtime.spawn_blocking(move || inner.run());
        }
    }

    /// Delivery task body; only one runs at a time
    fn run(&self) {
        loop {
            let batch = self.pending.load(Ordering::Acquire);
            if batch == 0 {
                self.round_active.store(false, Ordering::Release);
                // A signal may have landed between the load and the store
                if self.pending.load(Ordering::Acquire) > 0
                    && self
                        .round_active
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    continue;
                }
                break;
            }

            self.deliver_round(batch);
            self.pending.fetch_sub(batch, Ordering::AcqRel);
            self.rounds.fetch_add(1, Ordering::AcqRel);
        }

        self.idle.notify_waiters();
    }

    fn deliver_round(&self, batch: usize) {
        let listeners = self.listeners.read().clone();
        let consumer = self.directory_consumer.read().clone();
        debug!("Delivery round for {} signals, {} listeners", batch, listeners.len());

        if let Some(consumer) = consumer {
            notify(consumer.as_ref());
        }
        for listener in &listeners {
            notify(listener.as_ref());
        }
    }
}

/// Call a listener, logging failures and panics instead of propagating
fn notify(listener: &dyn TopologyListener) {
    match catch_unwind(AssertUnwindSafe(|| listener.midi_system_updated())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{}", Error::listener(listener.name(), e)),
        Err(_) => warn!("{}", Error::listener(listener.name(), "panicked")),
    }
}

fn same_listener(a: &Arc<dyn TopologyListener>, b: &Arc<dyn TopologyListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn TopologyListener> {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_signal_runs_one_round() {
        let coalescer = NotificationCoalescer::new(Handle::current());
        let hits = Arc::new(AtomicUsize::new(0));
        coalescer.register_listener(counting(&hits));

        coalescer.signal();
        coalescer.wait_idle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.rounds_completed(), 1);
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_is_coalesced() {
        let coalescer = NotificationCoalescer::new(Handle::current());
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let reconciles = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(std::sync::Barrier::new(2));

        let consumer: Arc<dyn TopologyListener> = {
            let running = running.clone();
            let max_running = max_running.clone();
            let reconciles = reconciles.clone();
            let gate = gate.clone();
            Arc::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                if reconciles.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Hold the first round open until the burst is in
                    gate.wait();
                }
                std::thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        };
        coalescer.register_directory_consumer(consumer);

        coalescer.signal();
        while reconciles.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..50 {
            coalescer.signal();
        }
        gate.wait();
        coalescer.wait_idle().await;

        let rounds = reconciles.load(Ordering::SeqCst);
        assert!(rounds >= 2, "burst must be followed by a post-burst round");
        assert!(rounds < 50);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directory_consumer_runs_first_and_is_replaced() {
        let coalescer = NotificationCoalescer::new(Handle::current());
        let order = Arc::new(Mutex::new(Vec::new()));

        let tagged = |tag: &'static str| -> Arc<dyn TopologyListener> {
            let order = order.clone();
            Arc::new(move || {
                order.lock().push(tag);
                Ok(())
            })
        };

        coalescer.register_listener(tagged("first"));
        coalescer.register_listener(tagged("second"));
        coalescer.register_directory_consumer(tagged("stale consumer"));
        coalescer.register_directory_consumer(tagged("consumer"));

        coalescer.signal();
        coalescer.wait_idle().await;

        assert_eq!(*order.lock(), vec!["consumer", "first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_registration_then_single_unregister() {
        let coalescer = NotificationCoalescer::new(Handle::current());
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = counting(&hits);

        assert!(coalescer.register_listener(listener.clone()));
        assert!(!coalescer.register_listener(listener.clone()));
        assert_eq!(coalescer.listener_count(), 1);
        assert!(coalescer.unregister_listener(&listener));
        assert_eq!(coalescer.listener_count(), 0);

        coalescer.signal();
        coalescer.wait_idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_listener_is_isolated() {
        struct Broken;
        impl TopologyListener for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn midi_system_updated(&self) -> Result<()> {
                Err(Error::Config("boom".into()))
            }
        }

        let coalescer = NotificationCoalescer::new(Handle::current());
        let hits = Arc::new(AtomicUsize::new(0));
        coalescer.register_listener(Arc::new(Broken));
        coalescer.register_listener(Arc::new(|| -> Result<()> { panic!("listener panic") }));
        coalescer.register_listener(counting(&hits));

        coalescer.signal();
        coalescer.wait_idle().await;
        coalescer.signal();
        coalescer.wait_idle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.rounds_completed(), 2);
    }

    // Catching listener panics needs unwinding in every build profile
    #[test]
    fn test_no_profile_aborts_on_panic() {
        let manifest = include_str!("../Cargo.toml");
        let aborts = manifest
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").replace(' ', ""))
            .any(|l| l == "panic=\"abort\"");
        assert!(!aborts);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_polling_follows_listener_set() {
        #[derive(Default)]
        struct FakePoller {
            starts: AtomicUsize,
            stops: AtomicUsize,
        }
        impl PollingFallback for FakePoller {
            fn start(&self) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
            fn stop(&self) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        }

        let coalescer = NotificationCoalescer::new(Handle::current());
        let poller = Arc::new(FakePoller::default());
        coalescer.set_polling_fallback(poller.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let a = counting(&hits);
        let b = counting(&hits);
        coalescer.register_listener(a.clone());
        coalescer.register_listener(b.clone());
        assert_eq!(poller.starts.load(Ordering::SeqCst), 1);

        coalescer.unregister_listener(&a);
        assert_eq!(poller.stops.load(Ordering::SeqCst), 0);
        coalescer.unregister_listener(&b);
        assert_eq!(poller.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signaller_outlives_coalescer() {
        let coalescer = NotificationCoalescer::new(Handle::current());
        let signaller = coalescer.signaller();
        drop(coalescer);
        assert!(!signaller.signal());
    }
}
