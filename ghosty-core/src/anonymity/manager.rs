//! Anonymity network service and circuit rotation

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::control::ControlConnection;
use crate::config::{AnonymitySettings, ToolSettings};
use crate::error::AnonymityError;
use crate::events::{Component, EventBus};
use crate::host::SystemHost;
use crate::process::{LineHandling, SupervisedProcess};

/// Result type for anonymity operations
pub type AnonymityResult<T> = Result<T, AnonymityError>;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Service manager view of the anonymity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Starts at boot
    pub enabled: bool,
    /// Currently running
    pub active: bool,
    /// Set when the service manager could not be queried
    pub diagnostic: Option<String>,
}

/// Combined status of the service, rotation and control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymityStatus {
    /// Service starts at boot
    pub service_enabled: bool,
    /// Service is running
    pub service_active: bool,
    /// Rotation tool is running
    pub rotation_active: bool,
    /// A control-port connection is open
    pub controller_connected: bool,
}

/// Owns the anonymity service lifecycle and the rotation child
pub struct AnonymityManager {
    host: Arc<dyn SystemHost>,
    events: EventBus,
    tools: ToolSettings,
    settings: AnonymitySettings,
    rotation: Mutex<Option<SupervisedProcess>>,
    controller: Mutex<Option<ControlConnection>>,
}

impl AnonymityManager {
    /// Create a manager; nothing is started
    pub fn new(
        host: Arc<dyn SystemHost>,
        tools: &ToolSettings,
        settings: AnonymitySettings,
        events: EventBus,
    ) -> Self {
        Self {
            host,
            events,
            tools: tools.clone(),
            settings,
            rotation: Mutex::new(None),
            controller: Mutex::new(None),
        }
    }

    /// Query enablement and activation. Never fails; a query that could not
    /// run yields `(false, false)` with a diagnostic.
    pub async fn service_status(&self) -> ServiceStatus {
        let name = self.settings.service_name.as_str();
        let enabled = self.host.run(&self.tools.systemctl, &["is-enabled", name]).await;
        let active = self.host.run(&self.tools.systemctl, &["is-active", name]).await;

        // Non-zero exit is the normal answer for disabled/inactive units; only
        // a missing answer means the query itself failed.
        let diagnostic = [&enabled, &active]
            .into_iter()
            .find(|out| out.code.is_none() || (out.stdout.is_empty() && !out.success))
            .map(|out| out.failure_reason());

        if let Some(diagnostic) = diagnostic {
            return ServiceStatus {
                enabled: false,
                active: false,
                diagnostic: Some(diagnostic),
            };
        }

        ServiceStatus {
            enabled: enabled.success && is_enabled_answer(&enabled.stdout),
            active: active.stdout == "active",
            diagnostic: None,
        }
    }

    /// Enable (best effort) and start the service, then confirm it is active
    /// after the settle period
    pub async fn start_service(&self) -> AnonymityResult<()> {
        if !self.host.tool_available(&self.tools.tor).await {
            return Err(AnonymityError::ToolUnavailable(self.tools.tor.clone()));
        }

        let name = self.settings.service_name.as_str();
        let status = self.service_status().await;

        if !status.enabled {
            let out = self.host.run(&self.tools.systemctl, &["enable", name]).await;
            if out.success {
                self.events.info(Component::Anonymity, format!("Enabled {} service", name));
            } else {
                self.events.warn(
                    Component::Anonymity,
                    format!("Could not enable {} service: {}", name, out.failure_reason()),
                );
            }
        }

        if status.active {
            self.events.info(Component::Anonymity, format!("{} service already running", name));
            return Ok(());
        }

        self.events.info(Component::Anonymity, format!("Starting {} service", name));
        let primary = self.host.run(&self.tools.systemctl, &["start", name]).await;
        if !primary.success {
            tracing::debug!("systemctl start failed, trying fallback: {}", primary.failure_reason());
            let fallback = self.host.run(&self.tools.service, &[name, "start"]).await;
            if !fallback.success {
                return Err(AnonymityError::ServiceStartFailed(format!(
                    "{}; fallback: {}",
                    primary.failure_reason(),
                    fallback.failure_reason()
                )));
            }
        }

        tokio::time::sleep(self.settings.service_settle()).await;

        let status = self.service_status().await;
        if !status.active {
            return Err(AnonymityError::ServiceStartFailed(
                status
                    .diagnostic
                    .unwrap_or_else(|| format!("{} service is not active after start", name)),
            ));
        }

        self.events.info(Component::Anonymity, format!("{} service started", name));
        Ok(())
    }

    /// Stop the service, falling back to the secondary mechanism
    pub async fn stop_service(&self) -> AnonymityResult<()> {
        let name = self.settings.service_name.as_str();
        self.events.info(Component::Anonymity, format!("Stopping {} service", name));

        let primary = self.host.run(&self.tools.systemctl, &["stop", name]).await;
        if !primary.success {
            let fallback = self.host.run(&self.tools.service, &[name, "stop"]).await;
            if !fallback.success {
                return Err(AnonymityError::ServiceStopFailed(format!(
                    "{}; fallback: {}",
                    primary.failure_reason(),
                    fallback.failure_reason()
                )));
            }
        }

        self.events.info(Component::Anonymity, format!("{} service stopped", name));
        Ok(())
    }

    /// Spawn the rotation helper with the configured interval and count
    pub async fn start_rotation(&self) -> AnonymityResult<()> {
        let status = self.service_status().await;
        if !status.active {
            return Err(AnonymityError::ServiceNotRunning(
                status.diagnostic.unwrap_or_else(|| "inactive".to_string()),
            ));
        }

        let tool = &self.tools.tornet;
        if !self.host.tool_available(tool).await {
            return Err(AnonymityError::ToolUnavailable(tool.clone()));
        }

        let mut rotation = self.rotation.lock().await;
        if rotation.as_ref().is_some_and(SupervisedProcess::is_running) {
            return Err(AnonymityError::AlreadyRunning);
        }

        let interval = self.settings.rotation_interval_secs.to_string();
        let count = self.settings.rotation_count.to_string();
        let child = self
            .host
            .spawn(tool, &["--interval", interval.as_str(), "--count", count.as_str()])
            .await
            .map_err(|e| AnonymityError::RotationStartFailed(e.to_string()))?;

        *rotation = Some(SupervisedProcess::start(
            tool.clone(),
            child,
            self.events.clone(),
            Component::Rotation,
            LineHandling::Publish,
        ));

        self.events.info(
            Component::Rotation,
            format!("Circuit rotation started (every {} s)", interval),
        );
        Ok(())
    }

    /// Stop the rotation helper and release the control channel.
    ///
    /// Idempotent and never fails: problems are reported as events so that
    /// teardown can always continue.
    pub async fn stop_rotation(&self) -> AnonymityResult<()> {
        let process = self.rotation.lock().await.take();
        if let Some(process) = process {
            let report = process.shutdown(self.settings.rotation_stop_timeout()).await;
            if report.forced {
                self.events.warn(
                    Component::Rotation,
                    "Rotation helper ignored termination and was killed",
                );
            }
            if let Some(error) = report.error {
                self.events.warn(Component::Rotation, format!("Rotation stop: {}", error));
            }
        }

        if let Some(controller) = self.controller.lock().await.take() {
            controller.close().await;
            tracing::debug!("control channel released");
        }

        Ok(())
    }

    /// Service, settle, re-check, rotation.
    ///
    /// If rotation fails after the service came up, the service is left
    /// running and the failure is wrapped in
    /// [`AnonymityError::RotationFailedAfterServiceStart`].
    pub async fn start_full(&self) -> AnonymityResult<()> {
        self.start_service().await?;

        tokio::time::sleep(self.settings.full_settle()).await;
        let status = self.service_status().await;
        if !status.active {
            return Err(AnonymityError::ServiceStartFailed(
                status
                    .diagnostic
                    .unwrap_or_else(|| "service stopped during settle period".to_string()),
            ));
        }

        self.start_rotation()
            .await
            .map_err(|e| AnonymityError::RotationFailedAfterServiceStart(Box::new(e)))
    }

    /// Rotation first, then the service, even if rotation reported a problem
    pub async fn stop_full(&self) -> AnonymityResult<()> {
        if let Err(e) = self.stop_rotation().await {
            self.events.warn(Component::Rotation, e.to_string());
        }
        self.stop_service().await
    }

    /// Whether the rotation helper is running
    pub async fn rotation_active(&self) -> bool {
        self.rotation
            .lock()
            .await
            .as_ref()
            .is_some_and(SupervisedProcess::is_running)
    }

    /// Service, rotation and control channel status
    pub async fn status(&self) -> AnonymityStatus {
        let service = self.service_status().await;
        AnonymityStatus {
            service_enabled: service.enabled,
            service_active: service.active,
            rotation_active: self.rotation_active().await,
            controller_connected: self.controller.lock().await.is_some(),
        }
    }

    /// Open the control channel if it is not already open
    pub async fn connect_controller(&self) -> AnonymityResult<()> {
        let mut controller = self.controller.lock().await;
        if controller.is_none() {
            let connection = ControlConnection::connect(
                self.settings.control_addr,
                self.settings.control_password.as_deref(),
                CONTROL_TIMEOUT,
            )
            .await?;
            self.events.info(
                Component::Anonymity,
                format!("Control channel open on {}", connection.addr()),
            );
            *controller = Some(connection);
        }
        Ok(())
    }

    /// Ask the service for a fresh circuit over the control channel. A
    /// failed request drops the channel so the next call reconnects.
    pub async fn request_new_circuit(&self) -> AnonymityResult<()> {
        self.connect_controller().await?;

        let mut controller = self.controller.lock().await;
        let Some(connection) = controller.as_mut() else {
            return Err(AnonymityError::ControlPort("control channel closed".to_string()));
        };

        match connection.new_circuit().await {
            Ok(()) => {
                self.events.info(Component::Rotation, "Requested a new circuit");
                Ok(())
            }
            Err(e) => {
                controller.take();
                Err(e)
            }
        }
    }
}

/// `is-enabled` answers for units that need no `enable` call
fn is_enabled_answer(answer: &str) -> bool {
    answer.contains("enabled") || answer == "static"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLevel;
    use crate::host::{ChildScript, SimulatedHost};

    fn fast_settings() -> AnonymitySettings {
        AnonymitySettings {
            service_settle_ms: 0,
            full_settle_ms: 0,
            rotation_stop_timeout_ms: 50,
            ..AnonymitySettings::default()
        }
    }

    fn manager(host: &SimulatedHost) -> AnonymityManager {
        AnonymityManager::new(
            Arc::new(host.clone()),
            &ToolSettings::default(),
            fast_settings(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_service_status_answers() {
        let host = SimulatedHost::with_defaults();
        let anonymity = manager(&host);

        let status = anonymity.service_status().await;
        assert_eq!(
            status,
            ServiceStatus {
                enabled: false,
                active: false,
                diagnostic: None
            }
        );

        host.add_service("tor", true, true);
        let status = anonymity.service_status().await;
        assert!(status.enabled && status.active);

        for label in ["enabled-runtime", "static"] {
            host.set_enabled_label("tor", label);
            assert!(anonymity.service_status().await.enabled, "{}", label);
        }
    }

    #[tokio::test]
    async fn test_start_service_skips_enable_for_runtime_enabled_unit() {
        let host = SimulatedHost::with_defaults();
        host.set_enabled_label("tor", "enabled-runtime");
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let anonymity = AnonymityManager::new(
            Arc::new(host.clone()),
            &ToolSettings::default(),
            fast_settings(),
            events,
        );

        anonymity.start_service().await.unwrap();
        assert!(!host.journal().contains(&"systemctl enable tor".to_string()));
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.level, EventLevel::Warning, "{}", event.message);
        }
    }

    #[tokio::test]
    async fn test_service_status_query_failure() {
        let host = SimulatedHost::with_defaults();
        host.remove_tool("systemctl");
        let status = manager(&host).service_status().await;
        assert!(!status.enabled && !status.active);
        assert!(status.diagnostic.is_some());
    }

    #[tokio::test]
    async fn test_start_service_enables_and_starts() {
        let host = SimulatedHost::with_defaults();
        let anonymity = manager(&host);

        anonymity.start_service().await.unwrap();
        assert_eq!(host.service_state("tor"), Some((true, true)));
    }

    #[tokio::test]
    async fn test_start_service_falls_back() {
        let host = SimulatedHost::with_defaults();
        host.fail_command("systemctl", &["start"], "Failed to connect to bus");
        let anonymity = manager(&host);

        anonymity.start_service().await.unwrap();
        assert!(host.journal().contains(&"service tor start".to_string()));
        assert_eq!(host.service_state("tor"), Some((true, true)));
    }

    #[tokio::test]
    async fn test_enable_failure_is_not_fatal() {
        let host = SimulatedHost::with_defaults();
        host.fail_command("systemctl", &["enable"], "Access denied");
        let anonymity = manager(&host);

        anonymity.start_service().await.unwrap();
        assert_eq!(host.service_state("tor"), Some((false, true)));
    }

    #[tokio::test]
    async fn test_start_service_failures() {
        let host = SimulatedHost::with_defaults();
        host.make_service_stuck("tor");
        let anonymity = manager(&host);
        assert!(matches!(
            anonymity.start_service().await,
            Err(AnonymityError::ServiceStartFailed(_))
        ));

        host.remove_tool("tor");
        assert_eq!(
            anonymity.start_service().await,
            Err(AnonymityError::ToolUnavailable("tor".to_string()))
        );
    }

    #[tokio::test]
    async fn test_stop_service_fallback_and_failure() {
        let host = SimulatedHost::with_defaults();
        host.add_service("tor", true, true);
        host.fail_command("systemctl", &["stop"], "Failed to connect to bus");
        let anonymity = manager(&host);

        anonymity.stop_service().await.unwrap();
        assert_eq!(host.service_state("tor"), Some((true, false)));

        host.fail_command("service", &["stop"], "unrecognized service");
        assert!(matches!(
            anonymity.stop_service().await,
            Err(AnonymityError::ServiceStopFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_preconditions() {
        let host = SimulatedHost::with_defaults();
        let anonymity = manager(&host);

        assert!(matches!(
            anonymity.start_rotation().await,
            Err(AnonymityError::ServiceNotRunning(_))
        ));

        host.add_service("tor", true, true);
        anonymity.start_rotation().await.unwrap();
        assert_eq!(anonymity.start_rotation().await, Err(AnonymityError::AlreadyRunning));
        assert!(host
            .journal()
            .contains(&"spawn tornet --interval 5 --count 0".to_string()));

        anonymity.stop_rotation().await.unwrap();
        host.remove_tool("tornet");
        assert_eq!(
            anonymity.start_rotation().await,
            Err(AnonymityError::ToolUnavailable("tornet".to_string()))
        );
    }

    #[tokio::test]
    async fn test_stop_rotation_is_idempotent() {
        let host = SimulatedHost::with_defaults();
        host.add_service("tor", true, true);
        host.set_child_script("tornet", ChildScript::IgnoresTerminate { lines: vec![] });
        let anonymity = manager(&host);

        anonymity.stop_rotation().await.unwrap();
        anonymity.start_rotation().await.unwrap();
        assert!(anonymity.rotation_active().await);

        anonymity.stop_rotation().await.unwrap();
        assert!(!anonymity.rotation_active().await);
        assert_eq!(host.running_children("tornet"), 0);
        anonymity.stop_rotation().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_exit_clears_running() {
        let host = SimulatedHost::with_defaults();
        host.add_service("tor", true, true);
        let anonymity = manager(&host);
        anonymity.start_rotation().await.unwrap();

        host.exit_children("tornet", 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!anonymity.rotation_active().await);

        // A dead helper does not block a restart
        anonymity.start_rotation().await.unwrap();
        anonymity.stop_rotation().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_full_leaves_service_on_rotation_failure() {
        let host = SimulatedHost::with_defaults();
        host.remove_tool("tornet");
        let anonymity = manager(&host);

        let err = anonymity.start_full().await.unwrap_err();
        assert_eq!(
            err,
            AnonymityError::RotationFailedAfterServiceStart(Box::new(
                AnonymityError::ToolUnavailable("tornet".to_string())
            ))
        );
        assert_eq!(host.service_state("tor"), Some((true, true)));
    }

    #[tokio::test]
    async fn test_stop_full_order() {
        let host = SimulatedHost::with_defaults();
        let anonymity = manager(&host);
        anonymity.start_full().await.unwrap();

        anonymity.stop_full().await.unwrap();
        let journal = host.journal();
        let rotation = journal.iter().position(|e| e == "terminate tornet").unwrap();
        let service = journal.iter().position(|e| e == "systemctl stop tor").unwrap();
        assert!(rotation < service);

        let status = anonymity.status().await;
        assert!(!status.service_active);
        assert!(!status.rotation_active);
        assert!(!status.controller_connected);
    }

    #[tokio::test]
    async fn test_new_circuit_without_control_port() {
        let host = SimulatedHost::with_defaults();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = AnonymitySettings {
            control_addr: addr,
            ..AnonymitySettings::default()
        };
        let anonymity = AnonymityManager::new(
            Arc::new(host),
            &ToolSettings::default(),
            settings,
            EventBus::new(),
        );
        assert!(matches!(
            anonymity.request_new_circuit().await,
            Err(AnonymityError::ControlPort(_))
        ));
        assert!(!anonymity.status().await.controller_connected);
    }
}
