//! Host networking capability interface and its `ip(8)` implementation

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::command::{locate, Invocation};
use crate::error::CommandError;

use super::cidr::Ipv4Net;

/// What kind of device backs a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Wired,
    Wireless,
    Virtual,
    Loopback,
}

/// A host link with its IPv4 addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub kind: LinkKind,
    /// Administratively up with carrier
    pub up: bool,
    pub addresses: Vec<Ipv4Net>,
}

/// Privileged operations on the host network stack
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// All links that carry at least one IPv4 address
    async fn links(&self) -> Result<Vec<LinkInfo>, CommandError>;

    /// Default gateway reachable through `link`, if any
    async fn default_gateway(&self, link: &str) -> Result<Option<Ipv4Addr>, CommandError>;

    /// Whether some host on `link`'s segment answers for `addr`
    async fn address_in_use(&self, link: &str, addr: Ipv4Addr) -> Result<bool, CommandError>;

    async fn link_exists(&self, name: &str) -> Result<bool, CommandError>;

    /// Create an L2-mode ipvlan adapter on top of `parent`
    async fn create_ipvlan(&self, name: &str, parent: &str) -> Result<(), CommandError>;

    async fn add_address(
        &self,
        name: &str,
        addr: Ipv4Net,
        broadcast: Ipv4Addr,
    ) -> Result<(), CommandError>;

    async fn set_link_state(&self, name: &str, up: bool) -> Result<(), CommandError>;

    async fn delete_link(&self, name: &str) -> Result<(), CommandError>;

    async fn add_route(&self, destination: Ipv4Net, gateway: Ipv4Addr)
        -> Result<(), CommandError>;

    /// Delete the route to `destination`; without a gateway, whichever
    /// route the kernel matches first
    async fn delete_route(
        &self,
        destination: Ipv4Net,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), CommandError>;
}

/// `ip -j` link/address record
#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: Option<String>,
    prefixlen: Option<u8>,
}

/// `ip -j route` record
#[derive(Debug, Deserialize)]
struct IpRoute {
    gateway: Option<String>,
}

/// iproute2-backed implementation
pub struct IpRoute2 {
    ip_path: String,
    arping_path: Option<String>,
    ping_path: String,
    sysfs_net: PathBuf,
}

impl IpRoute2 {
    pub fn new(ip_path: Option<String>) -> Self {
        let ip_path = ip_path.unwrap_or_else(|| locate("ip", "/usr/sbin/ip"));
        let arping_path = which::which("arping")
            .ok()
            .map(|p| p.to_string_lossy().to_string());
        let ping_path = locate("ping", "/usr/bin/ping");

        info!(
            ip = %ip_path,
            arping = ?arping_path,
            "Host network tools located"
        );

        Self {
            ip_path,
            arping_path,
            ping_path,
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    fn ip(&self) -> Invocation {
        Invocation::new(&self.ip_path)
    }
}

#[async_trait]
impl HostNetwork for IpRoute2 {
    async fn links(&self) -> Result<Vec<LinkInfo>, CommandError> {
        let inv = self.ip().args(["-j", "-4", "addr", "show"]);
        let stdout = inv.output("links").await?;
        parse_links(&stdout, |name, loopback| {
            classify_link(&self.sysfs_net, name, loopback)
        })
        .map_err(|reason| CommandError::Parse {
            command: inv.display(),
            reason,
        })
    }

    async fn default_gateway(&self, link: &str) -> Result<Option<Ipv4Addr>, CommandError> {
        let inv = self
            .ip()
            .args(["-j", "-4", "route", "show", "default", "dev", link]);
        let stdout = inv.output(link).await?;
        parse_gateway(&stdout).map_err(|reason| CommandError::Parse {
            command: inv.display(),
            reason,
        })
    }

    async fn address_in_use(&self, link: &str, addr: Ipv4Addr) -> Result<bool, CommandError> {
        // arping answers at L2 even when the peer drops ICMP
        let probe = match &self.arping_path {
            Some(arping) => Invocation::new(arping).args([
                "-q".to_string(),
                "-c".to_string(),
                "2".to_string(),
                "-w".to_string(),
                "2".to_string(),
                "-I".to_string(),
                link.to_string(),
                addr.to_string(),
            ]),
            None => Invocation::new(&self.ping_path).args([
                "-q".to_string(),
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                "1".to_string(),
                "-I".to_string(),
                link.to_string(),
                addr.to_string(),
            ]),
        };
        let in_use = probe.succeeds().await?;
        debug!(%addr, link, in_use, "Probed address");
        Ok(in_use)
    }

    async fn link_exists(&self, name: &str) -> Result<bool, CommandError> {
        self.ip().args(["link", "show", name]).succeeds().await
    }

    async fn create_ipvlan(&self, name: &str, parent: &str) -> Result<(), CommandError> {
        self.ip()
            .args(["link", "add", name, "link", parent, "type", "ipvlan", "mode", "l2"])
            .output(parent)
            .await
            .map(|_| ())
    }

    async fn add_address(
        &self,
        name: &str,
        addr: Ipv4Net,
        broadcast: Ipv4Addr,
    ) -> Result<(), CommandError> {
        self.ip()
            .args(["addr", "add"])
            .arg(addr.to_string())
            .arg("brd")
            .arg(broadcast.to_string())
            .args(["dev", name])
            .output(name)
            .await
            .map(|_| ())
    }

    async fn set_link_state(&self, name: &str, up: bool) -> Result<(), CommandError> {
        self.ip()
            .args(["link", "set", name, if up { "up" } else { "down" }])
            .output(name)
            .await
            .map(|_| ())
    }

    async fn delete_link(&self, name: &str) -> Result<(), CommandError> {
        self.ip()
            .args(["link", "del", name])
            .output(name)
            .await
            .map(|_| ())
    }

    async fn add_route(
        &self,
        destination: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Result<(), CommandError> {
        self.ip()
            .args(["route", "add"])
            .arg(destination.to_string())
            .arg("via")
            .arg(gateway.to_string())
            .output(&format!("route {destination}"))
            .await
            .map(|_| ())
    }

    async fn delete_route(
        &self,
        destination: Ipv4Net,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), CommandError> {
        let mut inv = self
            .ip()
            .args(["route", "del"])
            .arg(destination.to_string());
        if let Some(gateway) = gateway {
            inv = inv.arg("via").arg(gateway.to_string());
        }
        inv.output(&format!("route {destination}")).await.map(|_| ())
    }
}

/// Classify a link by what sysfs exposes for it
fn classify_link(sysfs_net: &Path, name: &str, loopback: bool) -> LinkKind {
    let dir = sysfs_net.join(name);
    if loopback {
        LinkKind::Loopback
    } else if dir.join("wireless").exists() || dir.join("phy80211").exists() {
        LinkKind::Wireless
    } else if dir.join("device").exists() {
        LinkKind::Wired
    } else {
        LinkKind::Virtual
    }
}

fn parse_links<F>(json: &str, classify: F) -> Result<Vec<LinkInfo>, String>
where
    F: Fn(&str, bool) -> LinkKind,
{
    let raw: Vec<IpLink> = serde_json::from_str(json.trim()).map_err(|e| e.to_string())?;

    let mut links = Vec::with_capacity(raw.len());
    for link in raw {
        let has_flag = |flag: &str| link.flags.iter().any(|f| f == flag);
        let kind = classify(&link.ifname, has_flag("LOOPBACK"));
        let up = has_flag("UP") && has_flag("LOWER_UP");

        let addresses = link
            .addr_info
            .iter()
            .filter(|a| a.family == "inet")
            .filter_map(|a| {
                let local: Ipv4Addr = a.local.as_deref()?.parse().ok()?;
                Ipv4Net::new(local, a.prefixlen?).ok()
            })
            .collect::<Vec<_>>();

        if addresses.is_empty() {
            continue;
        }

        links.push(LinkInfo {
            name: link.ifname,
            kind,
            up,
            addresses,
        });
    }

    Ok(links)
}

fn parse_gateway(json: &str) -> Result<Option<Ipv4Addr>, String> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(None);
    }
    let routes: Vec<IpRoute> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok(routes
        .into_iter()
        .filter_map(|r| r.gateway?.parse().ok())
        .next())
}
