//! The single proxy container owned by a session

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

/// Container state as tracked by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Removed,
}

/// Handle to the session's proxy container
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    /// Container name
    pub name: String,

    /// Runtime-assigned id
    pub id: String,

    status: ContainerStatus,

    /// Address on the container network once confirmed
    address: Option<Ipv4Addr>,

    /// When the container was created
    pub created_at: DateTime<Utc>,

    /// Restarts performed by reconnect attempts
    restarts: u32,
}

impl ContainerHandle {
    pub fn new(name: String, id: String) -> Self {
        Self {
            name,
            id,
            status: ContainerStatus::Created,
            address: None,
            created_at: Utc::now(),
            restarts: 0,
        }
    }

    pub fn status(&self) -> ContainerStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ContainerStatus) {
        self.status = status;
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn set_address(&mut self, address: Ipv4Addr) {
        self.address = Some(address);
    }

    pub fn record_restart(&mut self) {
        self.restarts += 1;
        // Must be confirmed again
        self.address = None;
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, ContainerStatus::Created | ContainerStatus::Running)
    }
}
