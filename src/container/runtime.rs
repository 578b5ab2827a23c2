//! Container runtime capability interface
//!
//! Vendor-neutral: the lifecycle only ever talks to `ContainerRuntime`,
//! with `Podman` as the production implementation.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::CommandError;
use crate::network::Ipv4Net;

/// An L2 network bound to a host parent link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub parent: String,
    pub subnet: Ipv4Net,
    /// Upstream gateway of the segment
    pub gateway: Option<Ipv4Addr>,
}

/// Everything needed to create the proxy container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    /// Static address on `network`
    pub address: Ipv4Addr,
    /// Interface name inside the container
    pub interface_name: String,
    pub command: Vec<String>,
    pub sysctls: Vec<(String, String)>,
    pub capabilities: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn network_exists(&self, name: &str) -> Result<bool, CommandError>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), CommandError>;

    async fn remove_network(&self, name: &str) -> Result<(), CommandError>;

    async fn container_exists(&self, name: &str) -> Result<bool, CommandError>;

    /// Create the container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, CommandError>;

    async fn start_container(&self, name: &str) -> Result<(), CommandError>;

    /// Address the container currently holds on `network`
    async fn container_address(
        &self,
        name: &str,
        network: &str,
    ) -> Result<Option<Ipv4Addr>, CommandError>;

    /// Run a command to completion inside the container
    async fn exec(&self, name: &str, command: &[String]) -> Result<String, CommandError>;

    async fn restart_container(&self, name: &str) -> Result<(), CommandError>;

    async fn stop_container(&self, name: &str, timeout_secs: u64) -> Result<(), CommandError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), CommandError>;

    /// Run a long-lived command inside the container, relaying its output
    /// live, and return its exit code (`None` if killed by a signal)
    async fn stream_exec(
        &self,
        name: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<Option<i32>, CommandError>;
}
