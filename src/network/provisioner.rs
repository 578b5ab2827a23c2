//! Host virtual adapter and container-network provisioning

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{SessionConfig, SessionIdentity};
use crate::container::{ContainerRuntime, NetworkSpec};
use crate::error::{CommandError, SessionError, TeardownError};
use crate::lifecycle::{Removal, Resource, ResourceLedger};

use super::allocator::AddressPair;
use super::host::HostNetwork;

/// What the provisioner currently has in place
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub host_adapter_present: bool,
    pub container_network_present: bool,
    pub allocated: Option<AddressPair>,
}

/// Creates and destroys the host adapter and the container network
pub struct NetworkProvisioner {
    host: Arc<dyn HostNetwork>,
    runtime: Arc<dyn ContainerRuntime>,
    identity: SessionIdentity,
    state: NetworkState,
}

impl NetworkProvisioner {
    pub fn new(
        host: Arc<dyn HostNetwork>,
        runtime: Arc<dyn ContainerRuntime>,
        identity: SessionIdentity,
    ) -> Self {
        Self {
            host,
            runtime,
            identity,
            state: NetworkState::default(),
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Bring up the host adapter with `pair.host` and the container
    /// network on the same parent. Anything already present under either
    /// name is destroyed first.
    ///
    /// Each resource is recorded before its create command is issued, so
    /// an interrupted call still leaves it in the ledger for teardown.
    pub async fn create(
        &mut self,
        cfg: &SessionConfig,
        pair: AddressPair,
        ledger: &mut ResourceLedger,
    ) -> Result<(), SessionError> {
        let adapter = self.identity.host_adapter.clone();
        let network = self.identity.container_network.clone();
        self.state.allocated = Some(pair);

        self.remove_host_adapter(&adapter)
            .await
            .map_err(|e| SessionError::provisioning("removing stale host adapter", e))?;

        ledger.record(Resource::HostAdapter {
            name: adapter.clone(),
        });
        self.host
            .create_ipvlan(&adapter, &cfg.parent_interface)
            .await
            .map_err(|e| SessionError::provisioning("creating host adapter", e))?;
        self.state.host_adapter_present = true;

        let address = cfg.subnet.with_addr(pair.host);
        self.host
            .add_address(&adapter, address, cfg.subnet.broadcast())
            .await
            .map_err(|e| SessionError::provisioning("addressing host adapter", e))?;
        self.host
            .set_link_state(&adapter, true)
            .await
            .map_err(|e| SessionError::provisioning("bringing host adapter up", e))?;

        info!(
            adapter = %adapter,
            parent = %cfg.parent_interface,
            address = %address,
            "Host adapter up"
        );

        self.remove_container_network(&network)
            .await
            .map_err(|e| SessionError::provisioning("removing stale container network", e))?;

        let spec = NetworkSpec {
            name: network.clone(),
            parent: cfg.parent_interface.clone(),
            subnet: cfg.subnet,
            gateway: cfg.upstream_gateway,
        };
        ledger.record(Resource::ContainerNetwork {
            name: network.clone(),
        });
        self.runtime
            .create_network(&spec)
            .await
            .map_err(|e| SessionError::provisioning("creating container network", e))?;
        self.state.container_network_present = true;

        info!(
            network = %network,
            subnet = %cfg.subnet,
            container_address = %pair.container,
            "Container network created"
        );
        Ok(())
    }

    /// Remove the container network, then the host adapter. Best-effort:
    /// each failure is logged and returned, never fatal.
    ///
    /// Whole-component wrapper; session teardown removes the same two
    /// resources one ledger entry at a time through `remove_container_network`
    /// and `remove_host_adapter`.
    pub async fn destroy(&mut self) -> Vec<TeardownError> {
        let mut failures = Vec::new();

        let network = self.identity.container_network.clone();
        match self.remove_container_network(&network).await {
            Ok(_) => self.state.container_network_present = false,
            Err(source) => {
                warn!(network = %network, error = %source, "Failed to remove container network");
                failures.push(TeardownError {
                    resource: Resource::ContainerNetwork { name: network },
                    source,
                });
            }
        }

        let adapter = self.identity.host_adapter.clone();
        match self.remove_host_adapter(&adapter).await {
            Ok(_) => self.state.host_adapter_present = false,
            Err(source) => {
                warn!(adapter = %adapter, error = %source, "Failed to remove host adapter");
                failures.push(TeardownError {
                    resource: Resource::HostAdapter { name: adapter },
                    source,
                });
            }
        }

        failures
    }

    /// Down then delete a host link
    pub async fn remove_host_adapter(&mut self, name: &str) -> Result<Removal, CommandError> {
        if !self.host.link_exists(name).await? {
            return Ok(Removal::AlreadyAbsent);
        }

        match self.host.set_link_state(name, false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(Removal::AlreadyAbsent),
            // Deleting still works on a link that refuses to go down
            Err(e) => debug!(adapter = %name, error = %e, "Could not bring link down"),
        }

        let result = match self.host.delete_link(name).await {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.is_not_found() => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        };
        if result.is_ok() && name == self.identity.host_adapter {
            self.state.host_adapter_present = false;
        }
        result
    }

    pub async fn remove_container_network(&mut self, name: &str) -> Result<Removal, CommandError> {
        if !self.runtime.network_exists(name).await? {
            return Ok(Removal::AlreadyAbsent);
        }

        let result = match self.runtime.remove_network(name).await {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.is_not_found() => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        };
        if result.is_ok() && name == self.identity.container_network {
            self.state.container_network_present = false;
        }
        result
    }
}
