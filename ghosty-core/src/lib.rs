//! Ghosty Core - reversible network identity orchestration
//!
//! This crate changes an interface's hardware address, brings up a tunnel
//! client and routes through an anonymity network with periodic circuit
//! rotation, then undoes all of it in reverse order. External tools do the
//! actual work; this crate sequences them, supervises the long-running
//! ones and rolls back on failure.

pub mod anonymity;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod identity;
pub mod monitor;
pub mod orchestrator;
pub mod process;
pub mod tunnel;

pub use anonymity::{AnonymityManager, AnonymityStatus, ServiceStatus};
pub use config::GhostyConfig;
pub use error::{AnonymityError, ConfigError, ControlError, IdentityError, StepError, TunnelError};
pub use events::{Component, Event, EventBus, EventLevel};
pub use host::{LocalHost, SimulatedHost, SystemHost};
pub use identity::{IdentityStore, InterfaceIdentityManager, MacAddress};
pub use monitor::{HostMonitor, HostSample};
pub use orchestrator::{
    ActivationStep, Mode, Orchestrator, OrchestratorStatus, SessionState, StartRequest,
    TeardownReport, TeardownStep,
};
pub use tunnel::{TunnelInfo, TunnelSession, TunnelStatus};

/// Ghosty version
pub const GHOSTY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(!GHOSTY_VERSION.is_empty());
    }
}
