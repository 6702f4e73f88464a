//! Lifecycle signal sources for the messaging SDK.
//!
//! The poll runtime only consumes two booleans: whether the app is in the
//! foreground and whether the network is reachable. Platforms push changes
//! into a [`ManualLifecycle`]; [`ReachabilityProbe`] can drive the network
//! half when no platform API is available.

use std::{sync::Arc, time::Duration};

use tokio::{
    net::TcpStream,
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Snapshot of the lifecycle inputs that gate polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    pub foreground: bool,
    pub network_reachable: bool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            foreground: true,
            network_reachable: true,
        }
    }
}

/// Push-based source of lifecycle changes.
pub trait LifecycleSource: Send + Sync {
    /// Start observing changes. Dropping the subscription releases it.
    fn subscribe(&self) -> LifecycleSubscription;
}

/// Live view of a lifecycle source.
#[derive(Debug)]
pub struct LifecycleSubscription {
    rx: watch::Receiver<LifecycleState>,
}

impl LifecycleSubscription {
    pub fn current(&self) -> LifecycleState {
        *self.rx.borrow()
    }

    /// Wait for the next change. Returns `None` once the source is gone.
    ///
    /// Cancel-safe: a change observed by a dropped call is not lost.
    pub async fn changed(&mut self) -> Option<LifecycleState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Lifecycle source fed by explicit setter calls.
#[derive(Debug, Clone)]
pub struct ManualLifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for ManualLifecycle {
    fn default() -> Self {
        Self::new(LifecycleState::default())
    }
}

impl ManualLifecycle {
    pub fn new(initial: LifecycleState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Returns whether the stored value changed.
    pub fn set_foreground(&self, foreground: bool) -> bool {
        self.tx.send_if_modified(|state| {
            let changed = state.foreground != foreground;
            state.foreground = foreground;
            changed
        })
    }

    /// Returns whether the stored value changed.
    pub fn set_network_reachable(&self, reachable: bool) -> bool {
        self.tx.send_if_modified(|state| {
            let changed = state.network_reachable != reachable;
            state.network_reachable = reachable;
            changed
        })
    }
}

impl LifecycleSource for ManualLifecycle {
    fn subscribe(&self) -> LifecycleSubscription {
        LifecycleSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Periodic TCP connect check that publishes reachability.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityProbe {
    /// `target` is a `host:port` pair, usually the backend's.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// One connect attempt bounded by the probe timeout.
    pub async fn check(&self) -> bool {
        match timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(target_addr = %self.target, error = %err, "reachability connect failed");
                false
            }
            Err(_) => {
                debug!(target_addr = %self.target, "reachability connect timed out");
                false
            }
        }
    }

    /// Probe until `stop` is cancelled, pushing changes into `lifecycle`.
    pub fn spawn(self, lifecycle: ManualLifecycle, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let reachable = tokio::select! {
                    _ = stop.cancelled() => break,
                    reachable = self.check() => reachable,
                };
                if lifecycle.set_network_reachable(reachable) {
                    info!(target_addr = %self.target, reachable, "network reachability changed");
                }
            }
            debug!(target_addr = %self.target, "reachability probe stopped");
        })
    }
}
