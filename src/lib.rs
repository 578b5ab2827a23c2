//! XIVOmega library
//!
//! Provisions an ipvlan adapter, a container network and a proxy container
//! so selected game traffic is routed through the proxy for the length of
//! a session, then reverses every change, including after a crash.

pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod network;

#[cfg(test)]
pub(crate) mod testing;
