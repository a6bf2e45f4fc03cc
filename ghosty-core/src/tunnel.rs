//! Tunnel client session
//!
//! Owns at most one tunnel client child at a time. Connecting spawns the
//! client, waits a short grace period and samples whether it survived; this
//! is a liveness heuristic, not proof that the tunnel carries traffic.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{ToolSettings, TunnelSettings};
use crate::error::TunnelError;
use crate::events::{Component, EventBus};
use crate::host::SystemHost;
use crate::process::{LineHandling, ProcessState, SupervisedProcess};

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Connection state of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    /// A client process is running
    Connected,
    /// No client process
    Disconnected,
}

/// Snapshot of the session for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    /// Connection state
    pub status: TunnelStatus,
    /// Configured client file
    pub config_path: Option<PathBuf>,
    /// Configured credentials file
    pub auth_path: Option<PathBuf>,
    /// Client process id
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
struct TunnelFiles {
    config: PathBuf,
    auth: Option<PathBuf>,
}

#[derive(Default)]
struct SessionState {
    files: Option<TunnelFiles>,
    process: Option<SupervisedProcess>,
}

impl SessionState {
    /// Drop the handle of a client that exited on its own
    fn reap(&mut self) {
        if self.process.as_ref().is_some_and(|p| !p.is_running()) {
            self.process = None;
        }
    }
}

/// A reusable tunnel client session
pub struct TunnelSession {
    host: Arc<dyn SystemHost>,
    events: EventBus,
    client: String,
    settings: TunnelSettings,
    state: Mutex<SessionState>,
}

impl TunnelSession {
    /// Create a disconnected, unconfigured session
    pub fn new(
        host: Arc<dyn SystemHost>,
        tools: &ToolSettings,
        settings: TunnelSettings,
        events: EventBus,
    ) -> Self {
        Self {
            host,
            events,
            client: tools.openvpn.clone(),
            settings,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Set the client configuration file and optional credentials file.
    /// A running session is left untouched.
    pub async fn configure(&self, config: &Path, auth: Option<&Path>) -> TunnelResult<()> {
        if !path_exists(config).await {
            return Err(TunnelError::ConfigNotFound(config.to_path_buf()));
        }
        if let Some(auth) = auth {
            if !path_exists(auth).await {
                return Err(TunnelError::AuthNotFound(auth.to_path_buf()));
            }
        }

        self.state.lock().await.files = Some(TunnelFiles {
            config: config.to_path_buf(),
            auth: auth.map(Path::to_path_buf),
        });
        tracing::debug!("tunnel configured with {}", config.display());
        Ok(())
    }

    /// Spawn the client and wait out the startup grace period
    pub async fn connect(&self) -> TunnelResult<()> {
        if !self.host.tool_available(&self.client).await {
            return Err(TunnelError::ToolUnavailable(self.client.clone()));
        }

        let mut state = self.state.lock().await;
        let files = state.files.clone().ok_or(TunnelError::NotConfigured)?;
        state.reap();
        if state.process.is_some() {
            return Err(TunnelError::AlreadyConnected);
        }

        let args = self.client_args(&files);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        self.events.info(
            Component::Tunnel,
            format!("Connecting tunnel with {}", files.config.display()),
        );
        let child = self
            .host
            .spawn(&self.client, &args)
            .await
            .map_err(|e| TunnelError::StartupFailed(e.to_string()))?;
        let process = SupervisedProcess::start(
            self.client.clone(),
            child,
            self.events.clone(),
            Component::Tunnel,
            LineHandling::Trace,
        );
        let liveness = process.watch_state();
        state.process = Some(process);
        drop(state);

        // Unlocked for the grace period: readers see the pending client and
        // a second connect is refused.
        tokio::time::sleep(self.settings.startup_grace()).await;

        let exited = match &*liveness.borrow() {
            ProcessState::Exited(report) => Some(report.diagnostic()),
            ProcessState::Running => None,
        };
        if let Some(diagnostic) = exited {
            self.state.lock().await.reap();
            return Err(TunnelError::StartupFailed(diagnostic));
        }

        self.events.info(Component::Tunnel, "Tunnel connected");
        Ok(())
    }

    /// Terminate the client: graceful first, forced after the stop timeout.
    /// Session state is cleared whatever the outcome.
    pub async fn disconnect(&self) -> TunnelResult<()> {
        let process = {
            let mut state = self.state.lock().await;
            state.reap();
            state.process.take().ok_or(TunnelError::NotConnected)?
        };

        self.events.info(Component::Tunnel, "Disconnecting tunnel");
        let report = process.shutdown(self.settings.stop_timeout()).await;
        if report.forced {
            self.events.warn(
                Component::Tunnel,
                "Tunnel client ignored termination and was killed",
            );
        }
        if let Some(error) = &report.error {
            self.events.warn(Component::Tunnel, format!("Tunnel stop: {}", error));
        }
        Ok(())
    }

    /// Current status; forgets a client that has exited since the last check
    pub async fn status(&self) -> TunnelStatus {
        let mut state = self.state.lock().await;
        state.reap();
        if state.process.is_some() {
            TunnelStatus::Connected
        } else {
            TunnelStatus::Disconnected
        }
    }

    /// Whether a client is currently running
    pub async fn is_connected(&self) -> bool {
        self.status().await == TunnelStatus::Connected
    }

    /// Status plus configured files and client pid
    pub async fn info(&self) -> TunnelInfo {
        let mut state = self.state.lock().await;
        state.reap();
        TunnelInfo {
            status: if state.process.is_some() {
                TunnelStatus::Connected
            } else {
                TunnelStatus::Disconnected
            },
            config_path: state.files.as_ref().map(|f| f.config.clone()),
            auth_path: state.files.as_ref().and_then(|f| f.auth.clone()),
            pid: state.process.as_ref().and_then(SupervisedProcess::pid),
        }
    }

    fn client_args(&self, files: &TunnelFiles) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            files.config.to_string_lossy().into_owned(),
        ];
        if let Some(auth) = &files.auth {
            args.push("--auth-user-pass".to_string());
            args.push(auth.to_string_lossy().into_owned());
        }
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ChildScript, SimulatedHost};
    use std::time::Duration;
    use tempfile::TempDir;

    fn session(host: &SimulatedHost) -> TunnelSession {
        let settings = TunnelSettings {
            startup_grace_ms: 20,
            stop_timeout_ms: 50,
            establish_settle_ms: 0,
            ..TunnelSettings::default()
        };
        TunnelSession::new(
            Arc::new(host.clone()),
            &ToolSettings::default(),
            settings,
            EventBus::new(),
        )
    }

    fn files(dir: &TempDir) -> (PathBuf, PathBuf) {
        let config = dir.path().join("client.ovpn");
        let auth = dir.path().join("auth.txt");
        std::fs::write(&config, "client\n").unwrap();
        std::fs::write(&auth, "user\npass\n").unwrap();
        (config, auth)
    }

    #[tokio::test]
    async fn test_configure_checks_files() {
        let dir = TempDir::new().unwrap();
        let (config, _) = files(&dir);
        let tunnel = session(&SimulatedHost::with_defaults());

        let missing = dir.path().join("missing.ovpn");
        assert_eq!(
            tunnel.configure(&missing, None).await,
            Err(TunnelError::ConfigNotFound(missing.clone()))
        );
        assert_eq!(
            tunnel.configure(&config, Some(&missing)).await,
            Err(TunnelError::AuthNotFound(missing))
        );
        assert_eq!(tunnel.connect().await, Err(TunnelError::NotConfigured));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let dir = TempDir::new().unwrap();
        let (config, auth) = files(&dir);
        let host = SimulatedHost::with_defaults();
        let tunnel = session(&host);

        tunnel.configure(&config, Some(&auth)).await.unwrap();
        tunnel.connect().await.unwrap();
        assert_eq!(tunnel.status().await, TunnelStatus::Connected);
        assert_eq!(tunnel.connect().await, Err(TunnelError::AlreadyConnected));

        let spawn = host
            .journal()
            .into_iter()
            .find(|e| e.starts_with("spawn openvpn"))
            .unwrap();
        assert_eq!(
            spawn,
            format!(
                "spawn openvpn --config {} --auth-user-pass {} --script-security 2 --up /etc/openvpn/update-resolv-conf --down /etc/openvpn/update-resolv-conf",
                config.display(),
                auth.display()
            )
        );

        let info = tunnel.info().await;
        assert_eq!(info.config_path.as_deref(), Some(config.as_path()));
        assert!(info.pid.is_some());

        tunnel.disconnect().await.unwrap();
        assert_eq!(tunnel.status().await, TunnelStatus::Disconnected);
        assert_eq!(host.running_children("openvpn"), 0);
        assert_eq!(tunnel.disconnect().await, Err(TunnelError::NotConnected));

        // Reusable once cleanly disconnected
        tunnel.connect().await.unwrap();
        tunnel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_readable_during_startup_grace() {
        let dir = TempDir::new().unwrap();
        let (config, _) = files(&dir);
        let host = SimulatedHost::with_defaults();
        let settings = TunnelSettings {
            startup_grace_ms: 300,
            ..TunnelSettings::default()
        };
        let tunnel = Arc::new(TunnelSession::new(
            Arc::new(host.clone()),
            &ToolSettings::default(),
            settings,
            EventBus::new(),
        ));
        tunnel.configure(&config, None).await.unwrap();

        let connecting = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let info = tokio::time::timeout(Duration::from_millis(50), tunnel.info())
            .await
            .expect("info blocked by a pending connect");
        assert!(info.pid.is_some());
        assert_eq!(tunnel.connect().await, Err(TunnelError::AlreadyConnected));

        connecting.await.unwrap().unwrap();
        assert_eq!(host.running_children("openvpn"), 1);
        tunnel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_failure_reports_diagnostic() {
        let dir = TempDir::new().unwrap();
        let (config, _) = files(&dir);
        let host = SimulatedHost::with_defaults();
        host.set_child_script(
            "openvpn",
            ChildScript::Exits {
                code: 1,
                stderr: vec!["Options error: cannot open config".to_string()],
            },
        );
        let tunnel = session(&host);
        tunnel.configure(&config, None).await.unwrap();

        assert_eq!(
            tunnel.connect().await,
            Err(TunnelError::StartupFailed("Options error: cannot open config".to_string()))
        );
        assert_eq!(tunnel.status().await, TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_client() {
        let dir = TempDir::new().unwrap();
        let (config, _) = files(&dir);
        let host = SimulatedHost::with_defaults();
        host.remove_tool("openvpn");
        let tunnel = session(&host);
        tunnel.configure(&config, None).await.unwrap();

        assert_eq!(
            tunnel.connect().await,
            Err(TunnelError::ToolUnavailable("openvpn".to_string()))
        );
    }

    #[tokio::test]
    async fn test_status_self_heals_after_exit() {
        let dir = TempDir::new().unwrap();
        let (config, _) = files(&dir);
        let host = SimulatedHost::with_defaults();
        let tunnel = session(&host);
        tunnel.configure(&config, None).await.unwrap();
        tunnel.connect().await.unwrap();

        host.exit_children("openvpn", 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(tunnel.status().await, TunnelStatus::Disconnected);
        assert_eq!(tunnel.disconnect().await, Err(TunnelError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_escalates() {
        let dir = TempDir::new().unwrap();
        let (config, _) = files(&dir);
        let host = SimulatedHost::with_defaults();
        host.set_child_script("openvpn", ChildScript::IgnoresTerminate { lines: vec![] });
        let tunnel = session(&host);
        tunnel.configure(&config, None).await.unwrap();
        tunnel.connect().await.unwrap();

        tunnel.disconnect().await.unwrap();
        assert!(host.journal().contains(&"kill openvpn".to_string()));
        assert_eq!(host.running_children("openvpn"), 0);
    }
}
