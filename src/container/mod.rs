//! Proxy container management
//!
//! Handles everything on the container side of a session:
//! - The vendor-neutral runtime interface and its Podman implementation
//! - Creating, starting and reconnecting the proxy container
//! - Running the proxy and relaying its output
//! - Stopping and removing the container on teardown

mod handle;
mod manager;
pub mod podman;
pub mod runtime;

pub use handle::{ContainerHandle, ContainerStatus};
pub use manager::ContainerManager;
pub use podman::Podman;
pub use runtime::{ContainerRuntime, ContainerSpec, NetworkSpec};
