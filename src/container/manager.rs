//! Proxy container lifecycle management

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ContainerSettings, SessionConfig, SessionIdentity};
use crate::error::{CommandError, SessionError};
use crate::lifecycle::{Removal, Resource, ResourceLedger};
use crate::network::ReachableGateway;

use super::handle::{ContainerHandle, ContainerStatus};
use super::runtime::{ContainerRuntime, ContainerSpec};

/// Interval between address checks
const ADDRESS_POLL: Duration = Duration::from_millis(500);

/// Packets sent per connectivity check
const PING_COUNT: &str = "3";

/// Manages the one proxy container of a session
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    identity: SessionIdentity,
    settings: ContainerSettings,
    handle: Option<ContainerHandle>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        identity: SessionIdentity,
        settings: ContainerSettings,
    ) -> Self {
        Self {
            runtime,
            identity,
            settings,
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    fn name(&self) -> &str {
        &self.identity.container
    }

    fn spec(&self, cfg: &SessionConfig, network: &str, address: Ipv4Addr) -> ContainerSpec {
        ContainerSpec {
            name: self.identity.container.clone(),
            image: self.settings.image.clone(),
            network: network.to_string(),
            address,
            interface_name: cfg.identity.container_adapter.clone(),
            command: self.settings.command.clone(),
            sysctls: vec![
                ("net.ipv4.ip_forward".to_string(), "1".to_string()),
                ("net.ipv4.conf.all.route_localnet".to_string(), "1".to_string()),
            ],
            capabilities: vec!["NET_RAW".to_string(), "NET_ADMIN".to_string()],
        }
    }

    /// Create and start the container on `network` with `address`.
    ///
    /// On any failure the name is force-removed and the start retried
    /// exactly once.
    pub async fn start(
        &mut self,
        cfg: &SessionConfig,
        network: &str,
        address: Ipv4Addr,
        ledger: &mut ResourceLedger,
    ) -> Result<(), SessionError> {
        let spec = self.spec(cfg, network, address);

        let id = match self.try_start(&spec, ledger).await {
            Ok(id) => id,
            Err(first) => {
                warn!(
                    container = %spec.name,
                    error = %first,
                    "Container start failed, removing and retrying once"
                );
                if let Err(e) = self.remove_named(&spec.name).await {
                    debug!(container = %spec.name, error = %e, "Force-remove before retry failed");
                }
                self.try_start(&spec, ledger).await.map_err(|e| {
                    error!(container = %spec.name, error = %e, "Container start failed twice");
                    SessionError::provisioning("starting container", e)
                })?
            }
        };

        let mut handle = ContainerHandle::new(spec.name.clone(), id);
        handle.set_status(ContainerStatus::Running);
        info!(
            container = %handle.name,
            id = %handle.id,
            image = %spec.image,
            network = %network,
            "Container started"
        );
        self.handle = Some(handle);
        Ok(())
    }

    async fn try_start(
        &self,
        spec: &ContainerSpec,
        ledger: &mut ResourceLedger,
    ) -> Result<String, CommandError> {
        ledger.record(Resource::Container {
            name: spec.name.clone(),
        });
        let id = self.runtime.create_container(spec).await?;
        self.runtime.start_container(&spec.name).await?;
        Ok(id)
    }

    /// Wait until the running container holds `expected` on its network
    pub async fn await_address(
        &mut self,
        network: &str,
        expected: Ipv4Addr,
    ) -> Result<ReachableGateway, SessionError> {
        let timeout = Duration::from_secs(self.settings.address_timeout_secs);
        let deadline = Instant::now() + timeout;

        loop {
            let current = self
                .runtime
                .container_address(self.name(), network)
                .await
                .map_err(|e| SessionError::provisioning("inspecting container", e))?;

            if current == Some(expected) {
                if let Some(handle) = self.handle.as_mut() {
                    handle.set_address(expected);
                }
                debug!(address = %expected, "Container address confirmed");
                return Ok(ReachableGateway::confirmed(expected));
            }

            if Instant::now() >= deadline {
                warn!(
                    expected = %expected,
                    current = ?current,
                    "Container never acquired its address"
                );
                return Err(SessionError::provisioning(
                    "waiting for container address",
                    CommandError::Timeout {
                        command: format!("inspect {}", self.name()),
                        seconds: timeout.as_secs(),
                    },
                ));
            }
            sleep(ADDRESS_POLL).await;
        }
    }

    /// Run the in-container setup script
    pub async fn prepare(&self) -> Result<(), SessionError> {
        let script = vec![self.settings.setup_script.clone()];
        self.runtime
            .exec(self.name(), &script)
            .await
            .map_err(|e| SessionError::provisioning("running container setup", e))?;
        debug!(script = %self.settings.setup_script, "Container setup complete");
        Ok(())
    }

    /// Restart the container and redo its setup
    pub async fn reconnect(
        &mut self,
        network: &str,
        address: Ipv4Addr,
    ) -> Result<ReachableGateway, SessionError> {
        let name = self.name().to_string();
        self.runtime
            .restart_container(&name)
            .await
            .map_err(|e| SessionError::provisioning("restarting container", e))?;
        if let Some(handle) = self.handle.as_mut() {
            handle.record_restart();
        }

        let gateway = self.await_address(network, address).await?;
        self.prepare().await?;
        info!(container = %name, "Container reconnected");
        Ok(gateway)
    }

    /// Ping `target` from inside the container
    pub async fn ping(&self, target: Ipv4Addr, deadline: Duration) -> Result<bool, CommandError> {
        let command = vec![
            "ping".to_string(),
            "-c".to_string(),
            PING_COUNT.to_string(),
            "-w".to_string(),
            deadline.as_secs().max(1).to_string(),
            target.to_string(),
        ];
        match self.runtime.exec(self.name(), &command).await {
            Ok(_) => Ok(true),
            Err(CommandError::Failed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the proxy in the foreground until it exits
    pub async fn run_proxy(&self, custom_opcodes: bool) -> Result<Option<i32>, CommandError> {
        let command = vec![self.settings.entrypoint.clone()];
        let mut env = Vec::new();
        if custom_opcodes {
            env.push(("OMEGA_CUSTOM_OPCODES".to_string(), "1".to_string()));
        }
        self.runtime.stream_exec(self.name(), &command, &env).await
    }

    /// Stop then remove the session's container; absence is success.
    ///
    /// Session teardown reaches the same path by name through `remove_named`.
    pub async fn stop(&mut self) -> Result<Removal, CommandError> {
        let name = self.name().to_string();
        self.remove_named(&name).await
    }

    /// Stop and remove a container by name
    pub async fn remove_named(&mut self, name: &str) -> Result<Removal, CommandError> {
        if !self.runtime.container_exists(name).await? {
            self.mark_removed(name);
            return Ok(Removal::AlreadyAbsent);
        }

        match self
            .runtime
            .stop_container(name, self.settings.stop_timeout_secs)
            .await
        {
            Ok(()) => {
                if let Some(handle) = self.handle.as_mut().filter(|h| h.name == name) {
                    handle.set_status(ContainerStatus::Stopped);
                }
            }
            Err(e) if e.is_not_found() => {
                self.mark_removed(name);
                return Ok(Removal::AlreadyAbsent);
            }
            // Removal is forced below
            Err(e) => debug!(container = %name, error = %e, "Stop failed"),
        }

        let result = match self.runtime.remove_container(name, true).await {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.is_not_found() => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.mark_removed(name);
        }
        result
    }

    fn mark_removed(&mut self, name: &str) {
        if let Some(handle) = self.handle.as_mut().filter(|h| h.name == name) {
            handle.set_status(ContainerStatus::Removed);
        }
    }
}
