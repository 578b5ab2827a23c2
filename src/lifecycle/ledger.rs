//! Resource ledger
//!
//! Every resource is recorded just before its create command is issued and
//! the ledger is flushed to disk on each change, so a crashed or
//! interrupted session leaves behind a complete list of what to remove.
//! Entries whose creation never landed are simply absent at teardown. Teardown consumes the ledger in
//! reverse creation order.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SessionIdentity;
use crate::network::Ipv4Net;

/// One piece of system state owned by a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    HostAdapter { name: String },
    ContainerNetwork { name: String },
    Container { name: String },
    Route { destination: Ipv4Net, gateway: Ipv4Addr },
    /// Whatever route the host holds for `destination`, gateway unknown
    RouteTo { destination: Ipv4Net },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::HostAdapter { name } => write!(f, "host adapter {name}"),
            Resource::ContainerNetwork { name } => write!(f, "container network {name}"),
            Resource::Container { name } => write!(f, "container {name}"),
            Resource::Route {
                destination,
                gateway,
            } => write!(f, "route {destination} via {gateway}"),
            Resource::RouteTo { destination } => write!(f, "route {destination}"),
        }
    }
}

impl Resource {
    /// The resources a session creates under its well-known names, in
    /// creation order
    pub fn well_known(identity: &SessionIdentity) -> Vec<Resource> {
        vec![
            Resource::HostAdapter {
                name: identity.host_adapter.clone(),
            },
            Resource::ContainerNetwork {
                name: identity.container_network.clone(),
            },
            Resource::Container {
                name: identity.container.clone(),
            },
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    resource: Resource,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    session_id: Option<Uuid>,
    entries: Vec<LedgerEntry>,
}

/// Ordered record of live resources
pub struct ResourceLedger {
    path: Option<PathBuf>,
    session_id: Uuid,
    entries: Vec<LedgerEntry>,
}

impl ResourceLedger {
    /// Ledger persisted at `path`
    pub fn persistent(path: impl Into<PathBuf>, session_id: Uuid) -> Self {
        Self {
            path: Some(path.into()),
            session_id,
            entries: Vec::new(),
        }
    }

    /// Ledger that lives only in memory
    pub fn in_memory(session_id: Uuid) -> Self {
        Self {
            path: None,
            session_id,
            entries: Vec::new(),
        }
    }

    /// Read what a previous run left behind; a missing or unreadable
    /// file yields an empty list
    pub fn load_leftovers(path: &Path) -> Vec<Resource> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read ledger");
                return Vec::new();
            }
        };

        match serde_json::from_str::<LedgerFile>(&raw) {
            Ok(file) => {
                debug!(
                    previous_session = ?file.session_id,
                    entries = file.entries.len(),
                    "Loaded ledger from previous run"
                );
                file.entries.into_iter().map(|e| e.resource).collect()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt ledger");
                Vec::new()
            }
        }
    }

    /// Record a resource before issuing the command that creates it
    pub fn record(&mut self, resource: Resource) {
        if self.contains(&resource) {
            return;
        }
        debug!(%resource, "Recording resource");
        self.entries.push(LedgerEntry {
            resource,
            recorded_at: Utc::now(),
        });
        self.flush();
    }

    /// Drop a resource once it is gone
    pub fn forget(&mut self, resource: &Resource) {
        let before = self.entries.len();
        self.entries.retain(|e| &e.resource != resource);
        if self.entries.len() != before {
            self.flush();
        }
    }

    pub fn contains(&self, resource: &Resource) -> bool {
        self.entries.iter().any(|e| &e.resource == resource)
    }

    /// Resources in creation order
    pub fn resources(&self) -> Vec<Resource> {
        self.entries.iter().map(|e| e.resource.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove the on-disk ledger once nothing is left to clean up
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove ledger"),
            }
        }
    }

    fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let file = LedgerFile {
            session_id: Some(self.session_id),
            entries: self.entries.clone(),
        };

        let result = serde_json::to_vec_pretty(&file)
            .map_err(std::io::Error::from)
            .and_then(|bytes| {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                // Write-then-rename so a crash never leaves a torn ledger
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, bytes)?;
                std::fs::rename(&tmp, path)
            });

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Cannot persist ledger");
        }
    }
}

/// Everything that may need removing, in creation order: the well-known
/// names of `identity`, a route to each of `destinations` whatever its
/// gateway, then anything else a previous ledger held. Routes to the
/// destinations go even when the ledger itself was lost.
pub fn cleanup_plan(
    identity: &SessionIdentity,
    destinations: &[Ipv4Net],
    recorded: &[Resource],
) -> Vec<Resource> {
    let mut plan = Resource::well_known(identity);
    plan.extend(
        destinations
            .iter()
            .map(|destination| Resource::RouteTo {
                destination: *destination,
            }),
    );
    for resource in recorded {
        if !plan.contains(resource) {
            plan.push(resource.clone());
        }
    }
    plan
}
