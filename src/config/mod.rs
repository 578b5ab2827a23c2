//! Configuration module for XIVOmega
//!
//! Supports configuration via:
//! - TOML/INI/YAML/JSON config files (`/etc/xivomega/config.*`, `config/xivomega.*`)
//! - An explicit file passed on the command line
//! - Environment variables (with XIVOMEGA_ prefix, `__` as section separator)
//!
//! The raw settings are resolved once into a typed `SessionPlan`; nothing
//! downstream reads strings.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::network::{AddressOverrides, AllocationMode, Ipv4Net, ParentLink, ParentSelection};

/// Linux IFNAMSIZ minus the trailing NUL
const MAX_LINK_NAME: usize = 15;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory holding the session lock and resource ledger
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Explicit podman binary (discovered on PATH otherwise)
    #[serde(default)]
    pub podman_path: Option<String>,

    /// Explicit ip(8) binary (discovered on PATH otherwise)
    #[serde(default)]
    pub ip_path: Option<String>,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub container: ContainerSettings,

    #[serde(default)]
    pub probe: ProbeSettings,
}

/// Host-side network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// `auto` or the name of the parent link
    #[serde(default = "default_auto")]
    pub parent_interface: String,

    /// Host adapter address, or `default` to allocate
    #[serde(default = "default_default")]
    pub ipvlan_host: String,

    /// Container address, or `default` to allocate
    #[serde(default = "default_default")]
    pub ipvlan_cont: String,

    #[serde(default)]
    pub allocation: AllocationMode,

    /// Name of the host ipvlan adapter
    #[serde(default = "default_host_adapter")]
    pub host_adapter: String,

    /// Name of the container-runtime network
    #[serde(default = "default_container_network")]
    pub container_network: String,

    /// Interface name inside the container
    #[serde(default = "default_container_adapter")]
    pub container_adapter: String,

    /// Destination subnets routed through the container
    #[serde(default = "default_static_routes")]
    pub static_routes: Vec<String>,
}

/// Proxy container settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_container_name")]
    pub name: String,

    #[serde(default = "default_image")]
    pub image: String,

    /// Keeps the container alive; the proxy itself runs via exec
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Run once after start and after every reconnect
    #[serde(default = "default_setup_script")]
    pub setup_script: String,

    /// The long-running proxy process
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    /// Enable the proxy's custom opcode table
    #[serde(default)]
    pub custom_opcodes: bool,

    /// How long to wait for the container to hold its address
    #[serde(default = "default_address_timeout")]
    pub address_timeout_secs: u64,

    /// Grace period for `stop` before the runtime kills the container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

/// Connectivity probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address pinged from inside the container
    #[serde(default = "default_probe_target")]
    pub target: String,

    /// Upper bound for a single attempt
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_probe_attempts")]
    pub attempts: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/xivomega")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/xivomega")
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_default() -> String {
    "default".to_string()
}

fn default_host_adapter() -> String {
    "xivlanh".to_string()
}

fn default_container_network() -> String {
    "xivlanc".to_string()
}

fn default_container_adapter() -> String {
    "eth0".to_string()
}

fn default_static_routes() -> Vec<String> {
    [
        "124.150.157.0/24",
        "153.254.80.0/24",
        "202.67.52.0/24",
        "204.2.29.0/24",
        "80.239.145.0/24",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_container_name() -> String {
    "xivomega".to_string()
}

fn default_image() -> String {
    "quay.io/shingonati0n/xivomega:latest".to_string()
}

fn default_command() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

fn default_setup_script() -> String {
    "/home/iptset.sh".to_string()
}

fn default_entrypoint() -> String {
    "/home/omega_alpha.sh".to_string()
}

fn default_address_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_probe_target() -> String {
    "204.2.29.7".to_string()
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_probe_attempts() -> u32 {
    5
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            parent_interface: default_auto(),
            ipvlan_host: default_default(),
            ipvlan_cont: default_default(),
            allocation: AllocationMode::default(),
            host_adapter: default_host_adapter(),
            container_network: default_container_network(),
            container_adapter: default_container_adapter(),
            static_routes: default_static_routes(),
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name: default_container_name(),
            image: default_image(),
            command: default_command(),
            setup_script: default_setup_script(),
            entrypoint: default_entrypoint(),
            custom_opcodes: false,
            address_timeout_secs: default_address_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target: default_probe_target(),
            timeout_secs: default_probe_timeout(),
            attempts: default_probe_attempts(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            state_dir: default_state_dir(),
            podman_path: None,
            ip_path: None,
            network: NetworkSettings::default(),
            container: ContainerSettings::default(),
            probe: ProbeSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("/etc/xivomega/config").required(false))
            .add_source(config::File::with_name("config/xivomega").required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            // Override with environment variables (XIVOMEGA_ prefix)
            .add_source(
                config::Environment::with_prefix("XIVOMEGA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        self.resolve()?;
        Ok(())
    }

    /// Resolve raw settings into the typed plan every component consumes
    pub fn resolve(&self) -> Result<SessionPlan, SessionError> {
        let identity = SessionIdentity {
            host_adapter: self.network.host_adapter.clone(),
            container_network: self.network.container_network.clone(),
            container_adapter: self.network.container_adapter.clone(),
            container: self.container.name.clone(),
        };
        identity.validate()?;

        let overrides = AddressOverrides {
            host: parse_override("network.ipvlan_host", &self.network.ipvlan_host)?,
            container: parse_override("network.ipvlan_cont", &self.network.ipvlan_cont)?,
        };

        let static_routes = self
            .network
            .static_routes
            .iter()
            .map(|r| {
                r.parse::<Ipv4Net>()
                    .map(|net| net.trunc())
                    .map_err(|e| SessionError::Config(format!("network.static_routes: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if static_routes.is_empty() {
            return Err(SessionError::Config(
                "network.static_routes must not be empty".to_string(),
            ));
        }

        if self.container.image.trim().is_empty() {
            return Err(SessionError::Config("container.image must be set".to_string()));
        }
        if self.container.command.is_empty() {
            return Err(SessionError::Config("container.command must not be empty".to_string()));
        }
        if self.container.address_timeout_secs == 0 {
            return Err(SessionError::Config(
                "container.address_timeout_secs cannot be 0".to_string(),
            ));
        }

        let probe_target: Ipv4Addr = self.probe.target.parse().map_err(|_| {
            SessionError::Config(format!("probe.target {:?} is not an IPv4 address", self.probe.target))
        })?;
        if self.probe.attempts == 0 {
            return Err(SessionError::Config("probe.attempts must be at least 1".to_string()));
        }
        if self.probe.timeout_secs == 0 {
            return Err(SessionError::Config("probe.timeout_secs cannot be 0".to_string()));
        }

        Ok(SessionPlan {
            identity,
            parent: ParentSelection::from(self.network.parent_interface.as_str()),
            overrides,
            allocation: self.network.allocation,
            static_routes,
            container: self.container.clone(),
            probe: self.probe.enabled.then(|| ProbePlan {
                target: probe_target,
                timeout: Duration::from_secs(self.probe.timeout_secs),
                attempts: self.probe.attempts,
            }),
            state_dir: self.state_dir.clone(),
        })
    }
}

fn parse_override(key: &str, value: &str) -> Result<Option<Ipv4Addr>, SessionError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("default") {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| SessionError::Config(format!("{key}: {value:?} is not an IPv4 address")))
}

/// The fixed names a session's resources live under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub host_adapter: String,
    pub container_network: String,
    pub container_adapter: String,
    pub container: String,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self {
            host_adapter: default_host_adapter(),
            container_network: default_container_network(),
            container_adapter: default_container_adapter(),
            container: default_container_name(),
        }
    }
}

impl SessionIdentity {
    fn validate(&self) -> Result<(), SessionError> {
        for (key, name) in [
            ("network.host_adapter", &self.host_adapter),
            ("network.container_adapter", &self.container_adapter),
        ] {
            if name.is_empty() || name.len() > MAX_LINK_NAME {
                return Err(SessionError::Config(format!(
                    "{key} must be 1-{MAX_LINK_NAME} characters"
                )));
            }
        }
        if self.container_network.is_empty() || self.container.is_empty() {
            return Err(SessionError::Config(
                "container and network names must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded connectivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePlan {
    pub target: Ipv4Addr,
    pub timeout: Duration,
    pub attempts: u32,
}

/// Everything known before touching the host
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub identity: SessionIdentity,
    pub parent: ParentSelection,
    pub overrides: AddressOverrides,
    pub allocation: AllocationMode,
    pub static_routes: Vec<Ipv4Net>,
    pub container: ContainerSettings,
    /// `None` when the probe is disabled
    pub probe: Option<ProbePlan>,
    pub state_dir: PathBuf,
}

impl SessionPlan {
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }
}

/// Immutable per-session configuration, fixed once the parent link is known
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: SessionIdentity,
    pub parent_interface: String,
    pub subnet: Ipv4Net,
    /// Existing gateway of the parent segment
    pub upstream_gateway: Option<Ipv4Addr>,
    pub static_routes: Vec<Ipv4Net>,
    pub custom_opcodes: bool,
    pub container: ContainerSettings,
}

impl SessionConfig {
    pub fn new(plan: &SessionPlan, parent: &ParentLink) -> Self {
        Self {
            identity: plan.identity.clone(),
            parent_interface: parent.name.clone(),
            subnet: parent.subnet(),
            upstream_gateway: parent.gateway,
            static_routes: plan.static_routes.clone(),
            custom_opcodes: plan.container.custom_opcodes,
            container: plan.container.clone(),
        }
    }
}
