//! Periodic host sampling for display
//!
//! The monitor only reads: it never changes orchestration state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{Component, EventBus};
use crate::host::SystemHost;
use crate::orchestrator::{SessionSnapshot, SessionState};

/// One observation of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSample {
    /// When the sample was taken
    pub at: DateTime<Utc>,
    /// Interface that was read
    pub interface: String,
    /// `None` if the interface could not be read
    pub hardware_address: Option<String>,
    /// Orchestrator state at sampling time
    pub state: SessionState,
}

/// Background sampler publishing into a `watch` cell
#[derive(Debug)]
pub struct HostMonitor {
    samples: watch::Receiver<Option<HostSample>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HostMonitor {
    /// Sample `interface` (or the session's interface, once one is active)
    /// every `interval`
    pub fn spawn(
        host: Arc<dyn SystemHost>,
        interface: impl Into<String>,
        session: watch::Receiver<SessionSnapshot>,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        let (sample_tx, samples) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(sample_loop(
            host,
            interface.into(),
            session,
            events,
            interval,
            sample_tx,
            stop_rx,
        ));

        Self {
            samples,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<HostSample> {
        self.samples.borrow().clone()
    }

    /// Receive every new sample
    pub fn subscribe(&self) -> watch::Receiver<Option<HostSample>> {
        self.samples.clone()
    }

    /// Stop sampling and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("host monitor task failed: {}", e);
            }
        }
    }
}

impl Drop for HostMonitor {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn sample_loop(
    host: Arc<dyn SystemHost>,
    default_interface: String,
    session: watch::Receiver<SessionSnapshot>,
    events: EventBus,
    interval: Duration,
    sample_tx: watch::Sender<Option<HostSample>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_address: Option<String> = None;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        let (state, interface) = {
            let snapshot = session.borrow();
            (
                snapshot.state,
                snapshot.interface.clone().unwrap_or_else(|| default_interface.clone()),
            )
        };

        let hardware_address = match host.hardware_address(&interface).await {
            Ok(address) => Some(address),
            Err(e) => {
                tracing::debug!("sampling {} failed: {}", interface, e);
                None
            }
        };

        if let Some(address) = &hardware_address {
            if last_address.as_ref().is_some_and(|last| last != address) {
                events.info(
                    Component::Monitor,
                    format!("{} hardware address is now {}", interface, address),
                );
            }
            last_address = Some(address.clone());
        }

        sample_tx.send_replace(Some(HostSample {
            at: Utc::now(),
            interface,
            hardware_address,
            state,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLevel;
    use crate::host::SimulatedHost;

    fn idle() -> watch::Receiver<SessionSnapshot> {
        let (_, rx) = watch::channel(SessionSnapshot {
            state: SessionState::Idle,
            mode: None,
            interface: None,
        });
        rx
    }

    #[tokio::test]
    async fn test_samples_follow_host() {
        let host = SimulatedHost::with_defaults();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let monitor = HostMonitor::spawn(
            Arc::new(host.clone()),
            "eth0",
            idle(),
            events.clone(),
            Duration::from_millis(10),
        );

        let mut samples = monitor.subscribe();
        samples.changed().await.unwrap();
        let first = monitor.latest().unwrap();
        assert_eq!(first.hardware_address.as_deref(), Some("aa:bb:cc:dd:ee:01"));
        assert_eq!(first.state, SessionState::Idle);

        host.add_interface("eth0", "02:00:00:00:00:42");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.level, EventLevel::Info);
        assert_eq!(event.message, "eth0 hardware address is now 02:00:00:00:00:42");

        monitor.stop().await;
        // Sampling does not run commands.
        assert!(host.journal().is_empty());
    }

    #[tokio::test]
    async fn test_missing_interface_sampled_as_none() {
        let host = SimulatedHost::with_defaults();
        let monitor = HostMonitor::spawn(
            Arc::new(host),
            "eth7",
            idle(),
            EventBus::new(),
            Duration::from_millis(10),
        );

        let mut samples = monitor.subscribe();
        samples.changed().await.unwrap();
        assert_eq!(monitor.latest().unwrap().hardware_address, None);
        monitor.stop().await;
    }
}
