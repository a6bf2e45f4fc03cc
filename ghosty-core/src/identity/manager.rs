//! Interface identity manager

use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::address::{parse_new_address, MacAddress};
use super::store::IdentityStore;
use crate::config::ToolSettings;
use crate::error::IdentityError;
use crate::events::{Component, EventBus};
use crate::host::SystemHost;

/// Result type for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

enum AddressChange<'a> {
    Random,
    Specific(&'a str),
}

/// Applies and reverts hardware-address changes on named interfaces
pub struct InterfaceIdentityManager {
    host: Arc<dyn SystemHost>,
    store: Arc<IdentityStore>,
    events: EventBus,
    address_tool: String,
    link_tool: String,
    // Serializes down/change/up sequences
    ops: Mutex<()>,
}

impl InterfaceIdentityManager {
    /// Create a manager with a fresh identity store
    pub fn new(host: Arc<dyn SystemHost>, tools: &ToolSettings, events: EventBus) -> Self {
        Self::with_store(host, Arc::new(IdentityStore::new()), tools, events)
    }

    /// Create a manager sharing an existing identity store
    pub fn with_store(
        host: Arc<dyn SystemHost>,
        store: Arc<IdentityStore>,
        tools: &ToolSettings,
        events: EventBus,
    ) -> Self {
        Self {
            host,
            store,
            events,
            address_tool: tools.macchanger.clone(),
            link_tool: tools.ip.clone(),
            ops: Mutex::new(()),
        }
    }

    /// The identity store backing this manager
    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    /// Live hardware address of `interface`
    pub async fn current_address(&self, interface: &str) -> IdentityResult<String> {
        self.host
            .hardware_address(interface)
            .await
            .map_err(|_| IdentityError::NotFound(interface.to_string()))
    }

    /// Non-loopback interfaces present on the host
    pub async fn list_interfaces(&self) -> io::Result<Vec<String>> {
        self.host.list_interfaces().await
    }

    /// Address captured before `interface` was first modified
    pub fn original_address(&self, interface: &str) -> Option<String> {
        self.store.original(interface)
    }

    /// Interfaces that currently have a restorable original
    pub fn recorded_interfaces(&self) -> Vec<String> {
        self.store.recorded_interfaces()
    }

    /// Assign a random address, or `desired` if given.
    ///
    /// The pre-change address is recorded the first time an interface is
    /// touched. Returns the new address when the tool reports it.
    pub async fn change_address(
        &self,
        interface: &str,
        desired: Option<&str>,
    ) -> IdentityResult<Option<String>> {
        let desired = desired.map(MacAddress::parse).transpose()?;
        let _guard = self.ops.lock().await;

        self.ensure_tools().await?;
        let current = self.current_address(interface).await?;
        let original = self.store.record_original(interface, &current);
        tracing::debug!("{} original address on record: {}", interface, original);

        self.events.info(
            Component::Identity,
            format!("Changing hardware address of {} (currently {})", interface, current),
        );

        let desired = desired.map(|a| a.to_string());
        let change = match desired.as_deref() {
            Some(address) => AddressChange::Specific(address),
            None => AddressChange::Random,
        };
        let stdout = self.apply(interface, change).await?;

        let new_address = parse_new_address(&stdout).map(|a| a.to_string());
        match &new_address {
            Some(address) => self.events.info(
                Component::Identity,
                format!("Hardware address of {} changed to {}", interface, address),
            ),
            None => self.events.info(
                Component::Identity,
                format!("Hardware address of {} changed", interface),
            ),
        }

        Ok(new_address)
    }

    /// Put the recorded original address back on `interface`.
    ///
    /// Fails with [`IdentityError::NoRecord`] if nothing was recorded or the
    /// interface was already restored. A failed restore keeps the record.
    pub async fn restore_address(&self, interface: &str) -> IdentityResult<()> {
        let _guard = self.ops.lock().await;

        let original = self
            .store
            .original(interface)
            .ok_or_else(|| IdentityError::NoRecord(interface.to_string()))?;
        self.ensure_tools().await?;

        self.events.info(
            Component::Identity,
            format!("Restoring hardware address of {} to {}", interface, original),
        );
        self.apply(interface, AddressChange::Specific(&original)).await?;
        self.store.mark_restored(interface);

        self.events.info(
            Component::Identity,
            format!("Hardware address of {} restored", interface),
        );
        Ok(())
    }

    /// Restore every recorded interface, collecting each outcome
    pub async fn restore_all(&self) -> Vec<(String, IdentityResult<()>)> {
        let mut outcomes = Vec::new();
        for interface in self.store.recorded_interfaces() {
            let outcome = self.restore_address(&interface).await;
            if let Err(e) = &outcome {
                self.events.warn(Component::Identity, e.to_string());
            }
            outcomes.push((interface, outcome));
        }
        outcomes
    }

    async fn ensure_tools(&self) -> IdentityResult<()> {
        for tool in [&self.address_tool, &self.link_tool] {
            if !self.host.tool_available(tool).await {
                return Err(IdentityError::ToolUnavailable(tool.clone()));
            }
        }
        Ok(())
    }

    /// down, change, up. Any failure still attempts to bring the link up.
    async fn apply(&self, interface: &str, change: AddressChange<'_>) -> IdentityResult<String> {
        let down = self.set_link(interface, "down").await;
        if !down.success {
            self.bring_up_best_effort(interface).await;
            return Err(IdentityError::InterfaceDownFailed {
                interface: interface.to_string(),
                reason: down.failure_reason(),
            });
        }

        let output = match change {
            AddressChange::Random => self.host.run(&self.address_tool, &["-r", interface]).await,
            AddressChange::Specific(address) => {
                self.host
                    .run(&self.address_tool, &["-m", address, interface])
                    .await
            }
        };
        if !output.success {
            self.bring_up_best_effort(interface).await;
            return Err(IdentityError::AddressChangeFailed {
                interface: interface.to_string(),
                reason: output.failure_reason(),
            });
        }

        let up = self.set_link(interface, "up").await;
        if !up.success {
            return Err(IdentityError::InterfaceUpFailed {
                interface: interface.to_string(),
                reason: up.failure_reason(),
            });
        }

        Ok(output.stdout)
    }

    async fn set_link(&self, interface: &str, state: &str) -> crate::host::CommandOutput {
        self.host
            .run(&self.link_tool, &["link", "set", interface, state])
            .await
    }

    async fn bring_up_best_effort(&self, interface: &str) {
        let up = self.set_link(interface, "up").await;
        if !up.success {
            self.events.warn(
                Component::Identity,
                format!("Could not bring {} back up: {}", interface, up.failure_reason()),
            );
        }
    }
}
