//! Polling fallback for transports without hot-plug notifications

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{fingerprint, Fingerprint, Transport};
use crate::coalescer::{PollingFallback, Signaller};

/// Periodically re-enumerates the transport and signals on any change
pub struct TopologyPoller {
    transport: Arc<dyn Transport>,
    signaller: Signaller,
    period: Duration,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyPoller {
    pub fn new(transport: Arc<dyn Transport>, signaller: Signaller, period: Duration, runtime: Handle) -> Self {
        Self {
            transport,
            signaller,
            period,
            runtime,
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    async fn snapshot(transport: &Arc<dyn Transport>) -> Option<Fingerprint> {
        let transport = transport.clone();
        match tokio::task::spawn_blocking(move || fingerprint(transport.as_ref())).await {
            Ok(Ok(fp)) => Some(fp),
            Ok(Err(e)) => {
                warn!("Topology poll failed: {}", e);
                None
            }
            Err(e) => {
                warn!("Topology poll task failed: {}", e);
                None
            }
        }
    }
}

impl PollingFallback for TopologyPoller {
    fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let transport = self.transport.clone();
        let signaller = self.signaller.clone();
        let period = self.period;

        *task = Some(self.runtime.spawn(async move {
            let mut last = Self::snapshot(&transport).await;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            debug!("Topology polling every {:?}", period);

            loop {
                ticker.tick().await;
                let Some(current) = Self::snapshot(&transport).await else {
                    continue;
                };

                if last.as_ref() == Some(&current) {
                    trace!("Topology unchanged");
                    continue;
                }

                debug!("Topology changed ({} endpoints)", current.len());
                last = Some(current);
                if !signaller.signal() {
                    break;
                }
            }
        }));
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Topology polling stopped");
        }
    }
}

impl Drop for TopologyPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
