//! Host-side networking: address allocation, the virtual adapter and
//! container network, and the static routes through the proxy

pub mod allocator;
pub mod cidr;
pub mod host;
pub mod provisioner;
pub mod routes;

pub use allocator::{
    AddressOverrides, AddressPair, AllocationMode, InterfaceAllocator, ParentLink,
    ParentSelection,
};
pub use cidr::{CidrError, Ipv4Net};
pub use host::{HostNetwork, IpRoute2, LinkInfo, LinkKind};
pub use provisioner::{NetworkProvisioner, NetworkState};
pub use routes::{ReachableGateway, Route, RouteManager, RouteSet};
