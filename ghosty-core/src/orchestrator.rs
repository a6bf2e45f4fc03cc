//! Mode-driven activation and teardown
//!
//! The [`Orchestrator`] drives the identity, tunnel and anonymity managers
//! in a fixed order: address change, tunnel, anonymity service plus
//! rotation. A failed step rolls back every earlier step in reverse order.
//! `stop` always runs the full reverse teardown and never fails.
//!
//! `start` and `stop` share one gate. A `start` arriving while another
//! operation holds the gate is rejected; a `stop` waits for the in-flight
//! `start` to settle before tearing down.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::anonymity::{AnonymityManager, AnonymityStatus};
use crate::config::GhostyConfig;
use crate::error::{ControlError, StepError, TunnelError};
use crate::events::{Component, EventBus};
use crate::host::SystemHost;
use crate::identity::{IdentityStore, InterfaceIdentityManager};
use crate::tunnel::{TunnelInfo, TunnelSession};

/// Result type for orchestrator operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Which layers to activate. Each mode includes every step of the previous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Hardware address change only
    Basic,
    /// Address change and tunnel
    Tunneled,
    /// Address change, tunnel, anonymity service and circuit rotation
    FullAnonymity,
}

impl Mode {
    /// This mode brings up the tunnel
    pub fn uses_tunnel(self) -> bool {
        matches!(self, Mode::Tunneled | Mode::FullAnonymity)
    }

    /// This mode brings up the anonymity network
    pub fn uses_anonymity(self) -> bool {
        self == Mode::FullAnonymity
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Basic => "basic",
            Mode::Tunneled => "tunneled",
            Mode::FullAnonymity => "full",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Mode::Basic),
            "tunneled" | "tunnel" | "vpn" => Ok(Mode::Tunneled),
            "full" | "full-anonymity" | "fullanonymity" => Ok(Mode::FullAnonymity),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Lifecycle state of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing engaged
    Idle,
    /// Activation in progress
    Starting,
    /// Every layer of the mode is up
    Running,
    /// Teardown or rollback in progress
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        })
    }
}

/// Activation steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationStep {
    /// Check and set the tunnel files
    ConfigureTunnel,
    /// Spoof the hardware address
    ChangeAddress,
    /// Start the tunnel client
    ConnectTunnel,
    /// Start the service and circuit rotation
    StartAnonymity,
}

impl fmt::Display for ActivationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActivationStep::ConfigureTunnel => "tunnel configuration",
            ActivationStep::ChangeAddress => "address change",
            ActivationStep::ConnectTunnel => "tunnel connect",
            ActivationStep::StartAnonymity => "anonymity network start",
        })
    }
}

/// Teardown steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownStep {
    /// Stop rotation, then the service
    StopAnonymity,
    /// Stop the tunnel client
    DisconnectTunnel,
    /// Put the original hardware address back
    RestoreAddress,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownStep::StopAnonymity => "anonymity network stop",
            TeardownStep::DisconnectTunnel => "tunnel disconnect",
            TeardownStep::RestoreAddress => "address restore",
        })
    }
}

/// Outcome of one teardown step; `warning` is set when the step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step that ran
    pub step: TeardownStep,
    /// Failure message, if the step failed
    pub warning: Option<String>,
}

/// Per-step outcomes of a teardown, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// One entry per step that ran
    pub outcomes: Vec<StepOutcome>,
}

impl TeardownReport {
    /// Every step that ran succeeded
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.warning.is_none())
    }

    /// Steps that reported a problem
    pub fn warnings(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| o.warning.is_some())
    }

    fn record<E: fmt::Display>(&mut self, events: &EventBus, step: TeardownStep, result: Result<(), E>) {
        let warning = result.err().map(|e| e.to_string());
        if let Some(warning) = &warning {
            events.warn(Component::Orchestrator, format!("{}: {}", step, warning));
        }
        self.outcomes.push(StepOutcome { step, warning });
    }
}

/// What to activate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Layers to activate
    pub mode: Mode,
    /// Interface whose address is changed
    pub interface: String,
    /// Tunnel client configuration file
    pub tunnel_config: Option<PathBuf>,
    /// Tunnel credentials file
    pub tunnel_auth: Option<PathBuf>,
    /// Specific hardware address; random when `None`
    pub address: Option<String>,
}

impl StartRequest {
    /// Request `mode` on `interface` with a random address
    pub fn new(mode: Mode, interface: impl Into<String>) -> Self {
        Self {
            mode,
            interface: interface.into(),
            tunnel_config: None,
            tunnel_auth: None,
            address: None,
        }
    }

    /// Tunnel configuration and optional credentials file
    pub fn with_tunnel(mut self, config: impl Into<PathBuf>, auth: Option<PathBuf>) -> Self {
        self.tunnel_config = Some(config.into());
        self.tunnel_auth = auth;
        self
    }

    /// Use a specific hardware address instead of a random one
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Observable session state, published on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Lifecycle state
    pub state: SessionState,
    /// Mode being started, running or stopped
    pub mode: Option<Mode>,
    /// Interface of the session
    pub interface: Option<String>,
}

/// Full status for front ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Lifecycle state
    pub state: SessionState,
    /// Active mode
    pub mode: Option<Mode>,
    /// Active interface
    pub interface: Option<String>,
    /// `state` is `Running`
    pub running: bool,
    /// Tunnel session details
    pub tunnel: TunnelInfo,
    /// Anonymity service and rotation details
    pub anonymity: AnonymityStatus,
}

/// Layers engaged by the current session
#[derive(Debug, Default)]
struct Engaged {
    mode: Option<Mode>,
    interface: Option<String>,
}

/// Drives the managers through activation and teardown
///
/// Activation and teardown run on their own tasks holding the gate, so they
/// always finish even if the caller's future is dropped.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    identity: InterfaceIdentityManager,
    tunnel: TunnelSession,
    anonymity: AnonymityManager,
    events: EventBus,
    establish_settle: Duration,
    gate: Arc<Mutex<Engaged>>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl Orchestrator {
    /// Build the managers on `host` from `config`
    pub fn new(host: Arc<dyn SystemHost>, config: &GhostyConfig, events: EventBus) -> Self {
        Self::with_store(host, Arc::new(IdentityStore::new()), config, events)
    }

    /// Like [`Orchestrator::new`], sharing an existing identity store
    pub fn with_store(
        host: Arc<dyn SystemHost>,
        store: Arc<IdentityStore>,
        config: &GhostyConfig,
        events: EventBus,
    ) -> Self {
        let identity =
            InterfaceIdentityManager::with_store(host.clone(), store, &config.tools, events.clone());
        let tunnel = TunnelSession::new(
            host.clone(),
            &config.tools,
            config.tunnel.clone(),
            events.clone(),
        );
        let anonymity = AnonymityManager::new(
            host,
            &config.tools,
            config.anonymity.clone(),
            events.clone(),
        );
        let (snapshot, _) = watch::channel(SessionSnapshot {
            state: SessionState::Idle,
            mode: None,
            interface: None,
        });

        Self {
            inner: Arc::new(Inner {
                identity,
                tunnel,
                anonymity,
                events,
                establish_settle: config.tunnel.establish_settle(),
                gate: Arc::new(Mutex::new(Engaged::default())),
                snapshot,
            }),
        }
    }

    /// Identity manager
    pub fn identity(&self) -> &InterfaceIdentityManager {
        &self.inner.identity
    }

    /// Tunnel session
    pub fn tunnel(&self) -> &TunnelSession {
        &self.inner.tunnel
    }

    /// Anonymity manager
    pub fn anonymity(&self) -> &AnonymityManager {
        &self.inner.anonymity
    }

    /// Event sink shared with the managers
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Activate `request.mode`. Rejected unless idle and no other operation
    /// is in flight. On failure every completed step has been rolled back
    /// and the state is `Idle` again.
    ///
    /// Dropping the returned future does not abandon the activation: it
    /// completes in the background and a later `stop` tears it down.
    pub async fn start(&self, request: StartRequest) -> ControlResult<()> {
        let engaged = self
            .inner
            .gate
            .clone()
            .try_lock_owned()
            .map_err(|_| ControlError::Busy(self.state()))?;
        let state = self.state();
        if state != SessionState::Idle {
            return Err(ControlError::Busy(state));
        }

        // Published before the task is spawned so the state is never `Idle`
        // while the gate is held for a start.
        self.inner
            .publish(SessionState::Starting, Some(request.mode), Some(&request.interface));

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run_start(engaged, request).await });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(ControlError::Interrupted),
        }
    }

    /// Tear everything down in reverse activation order. A no-op when idle;
    /// waits for an in-flight `start` first. Never fails: problems show up
    /// as warnings in the report.
    pub async fn stop(&self) -> TeardownReport {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let engaged = inner.gate.clone().lock_owned().await;
            inner.run_stop(engaged).await
        });

        match task.await {
            Ok(report) => report,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => TeardownReport::default(),
        }
    }

    /// State plus per-component status
    pub async fn status(&self) -> OrchestratorStatus {
        let snapshot = self.inner.snapshot.borrow().clone();
        OrchestratorStatus {
            running: snapshot.state == SessionState::Running,
            state: snapshot.state,
            mode: snapshot.mode,
            interface: snapshot.interface,
            tunnel: self.inner.tunnel.info().await,
            anonymity: self.inner.anonymity.status().await,
        }
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    async fn run_start(
        &self,
        mut engaged: OwnedMutexGuard<Engaged>,
        request: StartRequest,
    ) -> ControlResult<()> {
        self.events.info(
            Component::Orchestrator,
            format!("Starting {} mode on {}", request.mode, request.interface),
        );

        match self.activate(&request).await {
            Ok(()) => {
                engaged.mode = Some(request.mode);
                engaged.interface = Some(request.interface.clone());
                self.publish(SessionState::Running, Some(request.mode), Some(&request.interface));
                self.events.info(
                    Component::Orchestrator,
                    format!("{} mode active on {}", request.mode, request.interface),
                );
                Ok(())
            }
            Err(e) => {
                *engaged = Engaged::default();
                self.publish(SessionState::Idle, None, None);
                self.events.error(Component::Orchestrator, format!("Start failed: {}", e));
                Err(e)
            }
        }
    }

    async fn run_stop(&self, mut engaged: OwnedMutexGuard<Engaged>) -> TeardownReport {
        let (Some(mode), Some(interface)) = (engaged.mode, engaged.interface.clone()) else {
            if self.state() != SessionState::Idle {
                self.publish(SessionState::Idle, None, None);
            }
            return TeardownReport::default();
        };

        self.publish(SessionState::Stopping, Some(mode), Some(&interface));
        self.events.info(Component::Orchestrator, "Stopping");

        let report = self
            .teardown(mode.uses_anonymity(), mode.uses_tunnel(), &interface)
            .await;

        *engaged = Engaged::default();
        self.publish(SessionState::Idle, None, None);
        if report.is_clean() {
            self.events.info(Component::Orchestrator, "Stopped");
        } else {
            self.events.warn(Component::Orchestrator, "Stopped with warnings");
        }
        report
    }
    async fn activate(&self, request: &StartRequest) -> ControlResult<()> {
        let interface = request.interface.as_str();

        // Tunnel files are checked before the interface is touched.
        if request.mode.uses_tunnel() {
            let config = request
                .tunnel_config
                .as_deref()
                .ok_or_else(|| step_failed(ActivationStep::ConfigureTunnel, TunnelError::NotConfigured))?;
            self.tunnel
                .configure(config, request.tunnel_auth.as_deref())
                .await
                .map_err(|e| step_failed(ActivationStep::ConfigureTunnel, e))?;
        }

        self.identity
            .change_address(interface, request.address.as_deref())
            .await
            .map_err(|e| step_failed(ActivationStep::ChangeAddress, e))?;

        if request.mode.uses_tunnel() {
            if let Err(e) = self.tunnel.connect().await {
                self.roll_back(request.mode, false, false, interface).await;
                return Err(step_failed(ActivationStep::ConnectTunnel, e));
            }
            tokio::time::sleep(self.establish_settle).await;
        }

        if request.mode.uses_anonymity() {
            if let Err(e) = self.anonymity.start_full().await {
                self.roll_back(request.mode, true, true, interface).await;
                return Err(step_failed(ActivationStep::StartAnonymity, e));
            }
        }

        Ok(())
    }

    async fn roll_back(&self, mode: Mode, anonymity: bool, tunnel: bool, interface: &str) {
        self.publish(SessionState::Stopping, Some(mode), Some(interface));
        self.events.warn(Component::Orchestrator, "Rolling back");
        let report = self.teardown(anonymity, tunnel, interface).await;
        if !report.is_clean() {
            self.events.warn(
                Component::Orchestrator,
                format!("Rollback finished with {} warning(s)", report.warnings().count()),
            );
        }
    }

    async fn teardown(&self, anonymity: bool, tunnel: bool, interface: &str) -> TeardownReport {
        let mut report = TeardownReport::default();

        if anonymity {
            let result = self.anonymity.stop_full().await;
            report.record(&self.events, TeardownStep::StopAnonymity, result);
        }
        if tunnel {
            let result = self.tunnel.disconnect().await;
            report.record(&self.events, TeardownStep::DisconnectTunnel, result);
        }
        let result = self.identity.restore_address(interface).await;
        report.record(&self.events, TeardownStep::RestoreAddress, result);

        report
    }

    fn publish(&self, state: SessionState, mode: Option<Mode>, interface: Option<&str>) {
        self.snapshot.send_replace(SessionSnapshot {
            state,
            mode,
            interface: interface.map(str::to_string),
        });
    }
}

fn step_failed(step: ActivationStep, source: impl Into<StepError>) -> ControlError {
    ControlError::StepFailed {
        step,
        source: source.into(),
    }
}
