//! Heartbeat liveness sweep for socket connections.
//!
//! Every tick, links that never answered the previous probe are terminated and
//! the rest are probed again. Termination wakes the link's reader loop, which
//! runs the normal disconnect cleanup for its session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::network::transport::{Connection, SocketLink};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Links closed for missing a heartbeat.
    pub terminated: usize,
    /// Links probed.
    pub probed: usize,
}

/// Registry of live socket links.
#[derive(Default)]
pub struct LivenessMonitor {
    links: Mutex<BTreeMap<u64, Arc<SocketLink>>>,
}

impl LivenessMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching a link.
    pub fn register(&self, link: Arc<SocketLink>) {
        self.links.lock().insert(link.key(), link);
    }

    /// Stop watching a link.
    pub fn unregister(&self, key: u64) {
        self.links.lock().remove(&key);
    }

    /// Number of watched links.
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// Nothing watched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate silent links, probe the rest.
    pub fn sweep(&self) -> SweepReport {
        let links: Vec<Arc<SocketLink>> = self.links.lock().values().cloned().collect();
        let mut report = SweepReport::default();

        for link in links {
            if link.is_alive() {
                link.probe();
                report.probed += 1;
            } else {
                debug!(link = link.key(), "heartbeat missed, terminating");
                link.close();
                self.unregister(link.key());
                report.terminated += 1;
            }
        }
        report
    }

    /// Sweep every `interval` until cancelled. The first sweep runs one
    /// interval after start.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.terminated > 0 {
                        debug!(
                            terminated = report.terminated,
                            probed = report.probed,
                            "heartbeat sweep"
                        );
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }
}
