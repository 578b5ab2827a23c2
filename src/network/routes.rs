//! Static routes steering selected subnets through the proxy container

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CommandError, SessionError, TeardownError};
use crate::lifecycle::{Removal, Resource, ResourceLedger};

use super::cidr::Ipv4Net;
use super::host::HostNetwork;

/// A destination routed via the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.destination, self.gateway)
    }
}

impl From<Route> for Resource {
    fn from(route: Route) -> Self {
        Resource::Route {
            destination: route.destination,
            gateway: route.gateway,
        }
    }
}

/// Installed routes in installation order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    routes: Vec<Route>,
}

impl RouteSet {
    pub fn push(&mut self, route: Route) {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
    }

    pub fn remove(&mut self, route: &Route) {
        self.routes.retain(|r| r != route);
    }

    pub fn remove_destination(&mut self, destination: Ipv4Net) {
        self.routes.retain(|r| r.destination != destination);
    }

    pub fn contains(&self, route: &Route) -> bool {
        self.routes.contains(route)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Route> {
        self.routes.clone()
    }
}

/// Proof that the container holds its address.
///
/// Only the container manager can mint one, after observing the address
/// on the running container, so routes can never be installed towards a
/// gateway that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachableGateway(Ipv4Addr);

impl ReachableGateway {
    pub(crate) fn confirmed(addr: Ipv4Addr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }
}

/// Owns the session's `RouteSet`
pub struct RouteManager {
    host: Arc<dyn HostNetwork>,
    installed: RouteSet,
}

impl RouteManager {
    pub fn new(host: Arc<dyn HostNetwork>) -> Self {
        Self {
            host,
            installed: RouteSet::default(),
        }
    }

    /// Route every destination via the container's address
    pub async fn install(
        &mut self,
        destinations: &[Ipv4Net],
        gateway: ReachableGateway,
        ledger: &mut ResourceLedger,
    ) -> Result<(), SessionError> {
        for destination in destinations {
            let route = Route {
                destination: *destination,
                gateway: gateway.addr(),
            };
            if self.installed.contains(&route) {
                continue;
            }

            // Recorded first: the add may land even if this future is dropped
            ledger.record(route.into());
            self.host
                .add_route(route.destination, route.gateway)
                .await
                .map_err(|e| SessionError::provisioning("installing routes", e))?;
            self.installed.push(route);
            debug!(%route, "Route installed");
        }

        info!(
            count = self.installed.len(),
            gateway = %gateway.addr(),
            "Static routes installed"
        );
        Ok(())
    }

    /// Delete `routes`; absent routes are fine.
    ///
    /// Batch wrapper over `remove_route`, which session teardown calls per
    /// ledger entry.
    pub async fn remove(&mut self, routes: &[Route]) -> Vec<TeardownError> {
        let mut failures = Vec::new();
        for route in routes {
            if let Err(source) = self.remove_route(route).await {
                warn!(%route, error = %source, "Failed to remove route");
                failures.push(TeardownError {
                    resource: (*route).into(),
                    source,
                });
            }
        }
        failures
    }

    pub async fn remove_route(&mut self, route: &Route) -> Result<Removal, CommandError> {
        let result = match self
            .host
            .delete_route(route.destination, Some(route.gateway))
            .await
        {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.is_not_found() => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.installed.remove(route);
        }
        result
    }

    /// Delete whatever route exists to `destination`, for recovery when
    /// the gateway it was installed through is unknown
    pub async fn remove_destination(
        &mut self,
        destination: Ipv4Net,
    ) -> Result<Removal, CommandError> {
        let result = match self.host.delete_route(destination, None).await {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.is_not_found() => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.installed.remove_destination(destination);
        }
        result
    }

    pub fn installed(&self) -> &RouteSet {
        &self.installed
    }
}
