//! Parent link selection and address allocation

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SessionError;

use super::cidr::Ipv4Net;
use super::host::{HostNetwork, LinkInfo, LinkKind};

/// Upper bound on liveness probes per allocation
const MAX_PROBES: usize = 256;

/// Subnets up to this size are shuffled in full in random mode
const FULL_SHUFFLE_LIMIT: u32 = 4096;

/// How the parent link is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentSelection {
    /// First wired link that is up, else first wireless link that is up
    Auto,
    /// A named link, which must be up
    Explicit(String),
}

impl From<&str> for ParentSelection {
    fn from(value: &str) -> Self {
        match value.trim() {
            "" | "auto" | "default" => ParentSelection::Auto,
            name => ParentSelection::Explicit(name.to_string()),
        }
    }
}

/// Which free addresses to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMode {
    /// The two highest free addresses
    #[default]
    Highest,
    /// Two randomly chosen free addresses
    Random,
}

/// The physical link the virtual adapter will hang off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub name: String,
    pub kind: LinkKind,
    /// Host address on the link, with the link's prefix
    pub address: Ipv4Net,
    /// Existing gateway on the segment
    pub gateway: Option<Ipv4Addr>,
    /// Addresses already held by this host on the same subnet
    pub local_addresses: Vec<Ipv4Addr>,
}

impl ParentLink {
    pub fn subnet(&self) -> Ipv4Net {
        self.address.trunc()
    }

    /// Addresses that must never be handed out on this subnet
    pub fn reserved(&self) -> HashSet<Ipv4Addr> {
        let subnet = self.subnet();
        let mut reserved: HashSet<Ipv4Addr> = self.local_addresses.iter().copied().collect();
        reserved.insert(subnet.network());
        reserved.insert(subnet.broadcast());
        reserved.insert(self.address.addr());
        if let Some(gateway) = self.gateway {
            reserved.insert(gateway);
        }
        reserved
    }
}

/// The host-side and container-side addresses of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPair {
    pub host: Ipv4Addr,
    pub container: Ipv4Addr,
}

/// Operator-supplied addresses that bypass allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressOverrides {
    pub host: Option<Ipv4Addr>,
    pub container: Option<Ipv4Addr>,
}

/// Selects the parent link and two free addresses on its subnet
pub struct InterfaceAllocator {
    host: Arc<dyn HostNetwork>,
    mode: AllocationMode,
}

impl InterfaceAllocator {
    pub fn new(host: Arc<dyn HostNetwork>, mode: AllocationMode) -> Self {
        Self { host, mode }
    }

    /// Pick the parent link according to `selection`
    pub async fn select_parent(
        &self,
        selection: &ParentSelection,
    ) -> Result<ParentLink, SessionError> {
        let links = self
            .host
            .links()
            .await
            .map_err(|e| SessionError::Allocation(format!("cannot list host links: {e}")))?;

        let chosen = match selection {
            ParentSelection::Explicit(name) => {
                let link = links.iter().find(|l| &l.name == name).ok_or_else(|| {
                    SessionError::Allocation(format!("link {name} has no IPv4 address or does not exist"))
                })?;
                if !link.up {
                    return Err(SessionError::Allocation(format!("link {name} is down")));
                }
                link
            }
            ParentSelection::Auto => [LinkKind::Wired, LinkKind::Wireless]
                .iter()
                .find_map(|kind| links.iter().find(|l| l.kind == *kind && l.up))
                .ok_or_else(|| {
                    SessionError::Allocation("no wired or wireless link is up".to_string())
                })?,
        };

        let address = *chosen.addresses.first().ok_or_else(|| {
            SessionError::Allocation(format!("link {} has no IPv4 address", chosen.name))
        })?;
        let gateway = self
            .host
            .default_gateway(&chosen.name)
            .await
            .map_err(|e| SessionError::Allocation(format!("cannot read gateway: {e}")))?;

        let subnet = address.trunc();
        let local_addresses = local_addresses_in(&links, subnet);

        info!(
            parent = %chosen.name,
            kind = ?chosen.kind,
            subnet = %subnet,
            gateway = ?gateway,
            "Parent link selected"
        );

        Ok(ParentLink {
            name: chosen.name.clone(),
            kind: chosen.kind,
            address,
            gateway,
            local_addresses,
        })
    }

    /// Allocate host and container addresses on the parent's subnet
    pub async fn allocate(
        &self,
        parent: &ParentLink,
        overrides: AddressOverrides,
    ) -> Result<AddressPair, SessionError> {
        let subnet = parent.subnet();
        let reserved = parent.reserved();

        for addr in [overrides.host, overrides.container].into_iter().flatten() {
            if !subnet.is_host(addr) || reserved.contains(&addr) {
                return Err(SessionError::Allocation(format!(
                    "configured address {addr} is not a free host address in {subnet}"
                )));
            }
        }

        let pair = match (overrides.host, overrides.container) {
            (Some(host), Some(container)) => {
                if host == container {
                    return Err(SessionError::Allocation(format!(
                        "host and container addresses are both {host}"
                    )));
                }
                AddressPair { host, container }
            }
            (Some(host), None) => {
                let mut exclude = reserved;
                exclude.insert(host);
                let free = self.find_free(parent, &exclude, 1).await?;
                AddressPair {
                    host,
                    container: free[0],
                }
            }
            (None, Some(container)) => {
                let mut exclude = reserved;
                exclude.insert(container);
                let free = self.find_free(parent, &exclude, 1).await?;
                AddressPair {
                    host: free[0],
                    container,
                }
            }
            (None, None) => {
                let mut free = self.find_free(parent, &reserved, 2).await?;
                free.sort();
                AddressPair {
                    host: free[0],
                    container: free[1],
                }
            }
        };

        info!(host = %pair.host, container = %pair.container, "Addresses allocated");
        Ok(pair)
    }

    /// Find `wanted` addresses nobody answers for
    async fn find_free(
        &self,
        parent: &ParentLink,
        exclude: &HashSet<Ipv4Addr>,
        wanted: usize,
    ) -> Result<Vec<Ipv4Addr>, SessionError> {
        let subnet = parent.subnet();
        let candidates = self.candidates(subnet, exclude);

        let mut free = Vec::with_capacity(wanted);
        for addr in candidates.into_iter().take(MAX_PROBES) {
            let in_use = self
                .host
                .address_in_use(&parent.name, addr)
                .await
                .map_err(|e| SessionError::Allocation(format!("cannot probe {addr}: {e}")))?;
            if in_use {
                debug!(%addr, "Address in use, skipping");
                continue;
            }
            free.push(addr);
            if free.len() == wanted {
                return Ok(free);
            }
        }

        warn!(subnet = %subnet, found = free.len(), wanted, "Not enough free addresses");
        Err(SessionError::Allocation(format!(
            "fewer than {wanted} free address(es) in {subnet}"
        )))
    }

    /// Probe order for the current mode, reserved addresses already removed
    fn candidates(&self, subnet: Ipv4Net, exclude: &HashSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
        let Some((first, last)) = subnet.host_range() else {
            return Vec::new();
        };
        let (first, last) = (u32::from(first), u32::from(last));

        match self.mode {
            AllocationMode::Highest => (first..=last)
                .rev()
                .map(Ipv4Addr::from)
                .filter(|a| !exclude.contains(a))
                .take(MAX_PROBES)
                .collect(),
            AllocationMode::Random if subnet.host_count() <= FULL_SHUFFLE_LIMIT => {
                let mut all: Vec<Ipv4Addr> = (first..=last)
                    .map(Ipv4Addr::from)
                    .filter(|a| !exclude.contains(a))
                    .collect();
                all.shuffle(&mut rand::thread_rng());
                all
            }
            AllocationMode::Random => {
                let mut rng = rand::thread_rng();
                let mut seen = HashSet::new();
                let mut picks = Vec::with_capacity(MAX_PROBES);
                while picks.len() < MAX_PROBES && seen.len() < MAX_PROBES * 4 {
                    let addr = Ipv4Addr::from(rng.gen_range(first..=last));
                    if seen.insert(addr) && !exclude.contains(&addr) {
                        picks.push(addr);
                    }
                }
                picks
            }
        }
    }
}

fn local_addresses_in(links: &[LinkInfo], subnet: Ipv4Net) -> Vec<Ipv4Addr> {
    links
        .iter()
        .flat_map(|l| l.addresses.iter())
        .map(|a| a.addr())
        .filter(|a| subnet.contains(*a))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::host::MockHostNetwork;
    use crate::testing::FakeHost;
    use pretty_assertions::assert_eq;

    fn link(name: &str, kind: LinkKind, up: bool, addr: &str) -> LinkInfo {
        LinkInfo {
            name: name.to_string(),
            kind,
            up,
            addresses: vec![addr.parse().unwrap()],
        }
    }

    fn parent(addr: &str, gateway: Option<Ipv4Addr>) -> ParentLink {
        let address: Ipv4Net = addr.parse().unwrap();
        ParentLink {
            name: "eth0".to_string(),
            kind: LinkKind::Wired,
            address,
            gateway,
            local_addresses: vec![address.addr()],
        }
    }

    #[tokio::test]
    async fn test_auto_prefers_wired() {
        let mut mock = MockHostNetwork::new();
        mock.expect_links().returning(|| {
            Ok(vec![
                link("wlan0", LinkKind::Wireless, true, "10.0.0.5/24"),
                link("eth0", LinkKind::Wired, true, "192.168.1.20/24"),
            ])
        });
        mock.expect_default_gateway()
            .withf(|l: &str| l == "eth0")
            .returning(|_| Ok(Some(Ipv4Addr::new(192, 168, 1, 1))));

        let allocator = InterfaceAllocator::new(Arc::new(mock), AllocationMode::Highest);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();
        assert_eq!(parent.name, "eth0");
        assert_eq!(parent.subnet().to_string(), "192.168.1.0/24");
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_wireless() {
        let mut mock = MockHostNetwork::new();
        mock.expect_links().returning(|| {
            Ok(vec![
                link("eth0", LinkKind::Wired, false, "192.168.1.20/24"),
                link("wlan0", LinkKind::Wireless, true, "10.0.0.5/24"),
            ])
        });
        mock.expect_default_gateway().returning(|_| Ok(None));

        let allocator = InterfaceAllocator::new(Arc::new(mock), AllocationMode::Highest);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();
        assert_eq!(parent.name, "wlan0");
    }

    #[tokio::test]
    async fn test_no_eligible_link() {
        let mut mock = MockHostNetwork::new();
        mock.expect_links().returning(|| {
            Ok(vec![
                link("lo", LinkKind::Loopback, true, "127.0.0.1/8"),
                link("eth0", LinkKind::Wired, false, "192.168.1.20/24"),
            ])
        });

        let allocator = InterfaceAllocator::new(Arc::new(mock), AllocationMode::Highest);
        let err = allocator.select_parent(&ParentSelection::Auto).await.unwrap_err();
        assert!(matches!(err, SessionError::Allocation(_)));

        let err = allocator
            .select_parent(&ParentSelection::Explicit("eth0".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("down"));
    }

    #[tokio::test]
    async fn test_highest_free_pair() {
        let host = FakeHost::with_parent("eth0", "192.168.1.20/24", Some("192.168.1.1"));
        let allocator = InterfaceAllocator::new(Arc::new(host), AllocationMode::Highest);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();

        let pair = allocator
            .allocate(&parent, AddressOverrides::default())
            .await
            .unwrap();
        assert_eq!(pair.host, Ipv4Addr::new(192, 168, 1, 253));
        assert_eq!(pair.container, Ipv4Addr::new(192, 168, 1, 254));
    }

    #[tokio::test]
    async fn test_skips_addresses_in_use() {
        let host = FakeHost::with_parent("eth0", "192.168.1.20/24", Some("192.168.1.1"));
        host.mark_in_use("192.168.1.254".parse().unwrap());
        let allocator = InterfaceAllocator::new(Arc::new(host), AllocationMode::Highest);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();

        let pair = allocator
            .allocate(&parent, AddressOverrides::default())
            .await
            .unwrap();
        assert_eq!(pair.host, Ipv4Addr::new(192, 168, 1, 252));
        assert_eq!(pair.container, Ipv4Addr::new(192, 168, 1, 253));
    }

    #[tokio::test]
    async fn test_too_few_free_addresses() {
        // /30: .1 is the gateway, .2 is ours
        let host = FakeHost::with_parent("eth0", "10.9.0.2/30", Some("10.9.0.1"));
        let allocator = InterfaceAllocator::new(Arc::new(host), AllocationMode::Highest);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();

        let err = allocator
            .allocate(&parent, AddressOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Allocation(_)));
    }

    #[tokio::test]
    async fn test_overrides() {
        let host = FakeHost::with_parent("eth0", "192.168.1.20/24", Some("192.168.1.1"));
        let allocator = InterfaceAllocator::new(Arc::new(host), AllocationMode::Highest);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();

        let only_host = AddressOverrides {
            host: Some(Ipv4Addr::new(192, 168, 1, 254)),
            container: None,
        };
        let pair = allocator.allocate(&parent, only_host).await.unwrap();
        assert_eq!(pair.host, Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(pair.container, Ipv4Addr::new(192, 168, 1, 253));

        let gateway = AddressOverrides {
            host: Some(Ipv4Addr::new(192, 168, 1, 1)),
            container: None,
        };
        assert!(allocator.allocate(&parent, gateway).await.is_err());

        let outside = AddressOverrides {
            host: None,
            container: Some(Ipv4Addr::new(10, 0, 0, 9)),
        };
        assert!(allocator.allocate(&parent, outside).await.is_err());
    }

    #[tokio::test]
    async fn test_random_mode_gives_distinct_valid_addresses() {
        let host = FakeHost::with_parent("eth0", "172.20.0.10/28", Some("172.20.0.1"));
        host.mark_in_use("172.20.0.5".parse().unwrap());
        let allocator = InterfaceAllocator::new(Arc::new(host), AllocationMode::Random);
        let parent = allocator.select_parent(&ParentSelection::Auto).await.unwrap();
        let reserved = parent.reserved();

        for _ in 0..20 {
            let pair = allocator
                .allocate(&parent, AddressOverrides::default())
                .await
                .unwrap();
            assert_ne!(pair.host, pair.container);
            for addr in [pair.host, pair.container] {
                assert!(parent.subnet().is_host(addr));
                assert!(!reserved.contains(&addr));
                assert_ne!(addr, Ipv4Addr::new(172, 20, 0, 5));
            }
        }
    }

    #[test]
    fn test_allocation_correct_for_any_prefix() {
        // Every prefix with at least two free host addresses yields a valid pair
        for prefix in 8u8..=29 {
            let addr = format!("10.64.0.2/{prefix}");
            let host = FakeHost::with_parent("eth0", &addr, Some("10.64.0.1"));
            let allocator = InterfaceAllocator::new(Arc::new(host), AllocationMode::Highest);

            let pair = tokio_test::block_on(async {
                let parent = allocator.select_parent(&ParentSelection::Auto).await?;
                let pair = allocator.allocate(&parent, AddressOverrides::default()).await?;
                let reserved = parent.reserved();
                assert!(parent.subnet().is_host(pair.host));
                assert!(parent.subnet().is_host(pair.container));
                assert!(!reserved.contains(&pair.host));
                assert!(!reserved.contains(&pair.container));
                Ok::<_, SessionError>(pair)
            });

            let pair = pair.unwrap_or_else(|e| panic!("/{prefix}: {e}"));
            assert!(pair.host < pair.container, "/{prefix}");
        }
    }
}
