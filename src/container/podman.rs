//! Podman CLI implementation of `ContainerRuntime`

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::command::{locate, Invocation};
use crate::error::CommandError;

use super::runtime::{ContainerRuntime, ContainerSpec, NetworkSpec};

/// Per-network entry of `podman inspect`
#[derive(Debug, Deserialize)]
struct NetworkAttachment {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Drives the `podman` binary
pub struct Podman {
    podman_path: String,
}

impl Podman {
    /// Locate podman and verify it runs
    pub async fn detect(podman_path: Option<String>) -> Result<Self> {
        let podman_path = podman_path.unwrap_or_else(|| locate("podman", "/usr/bin/podman"));

        let output = Command::new(&podman_path)
            .args(["--version"])
            .output()
            .await
            .context("Failed to run podman --version")?;

        if !output.status.success() {
            anyhow::bail!("Podman not available or not working");
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(podman_version = %version.trim(), "Podman initialized");

        Ok(Self { podman_path })
    }

    fn podman(&self) -> Invocation {
        Invocation::new(&self.podman_path)
    }
}

fn network_create_args(spec: &NetworkSpec) -> Vec<String> {
    let mut args = vec![
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
        "ipvlan".to_string(),
        "-o".to_string(),
        format!("parent={}", spec.parent),
        "--subnet".to_string(),
        spec.subnet.to_string(),
    ];
    if let Some(gateway) = spec.gateway {
        args.push("--gateway".to_string());
        args.push(gateway.to_string());
    }
    args.push(spec.name.clone());
    args
}

fn container_create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        format!(
            "{}:ip={},interface_name={}",
            spec.network, spec.address, spec.interface_name
        ),
    ];
    for (key, value) in &spec.sysctls {
        args.push("--sysctl".to_string());
        args.push(format!("{key}={value}"));
    }
    if !spec.capabilities.is_empty() {
        args.push("--cap-add".to_string());
        args.push(spec.capabilities.join(","));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn parse_attachment(json: &str, network: &str) -> Result<Option<Ipv4Addr>, String> {
    let json = json.trim();
    if json.is_empty() || json == "null" {
        return Ok(None);
    }
    let networks: HashMap<String, NetworkAttachment> =
        serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok(networks
        .get(network)
        .and_then(|n| n.ip_address.parse().ok()))
}

/// Copy lines from a child stream to our stdout, mirrored at debug level
async fn relay<R>(stream: Option<R>, source: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "xivomega::proxy", stream = source, "{line}");
        println!("{line}");
    }
}

#[async_trait]
impl ContainerRuntime for Podman {
    async fn network_exists(&self, name: &str) -> Result<bool, CommandError> {
        self.podman()
            .args(["network", "exists", name])
            .succeeds()
            .await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), CommandError> {
        self.podman()
            .args(network_create_args(spec))
            .output(&spec.parent)
            .await
            .map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> Result<(), CommandError> {
        self.podman()
            .args(["network", "rm", name])
            .output(name)
            .await
            .map(|_| ())
    }

    async fn container_exists(&self, name: &str) -> Result<bool, CommandError> {
        self.podman()
            .args(["container", "exists", name])
            .succeeds()
            .await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, CommandError> {
        debug!(args = ?container_create_args(spec), "Creating container");
        let stdout = self
            .podman()
            .args(container_create_args(spec))
            .output(&spec.network)
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn start_container(&self, name: &str) -> Result<(), CommandError> {
        self.podman()
            .args(["start", name])
            .output(name)
            .await
            .map(|_| ())
    }

    async fn container_address(
        &self,
        name: &str,
        network: &str,
    ) -> Result<Option<Ipv4Addr>, CommandError> {
        let inv = self
            .podman()
            .args(["inspect", "--format", "{{json .NetworkSettings.Networks}}", name]);
        let stdout = inv.output(name).await?;
        parse_attachment(&stdout, network).map_err(|reason| CommandError::Parse {
            command: inv.display(),
            reason,
        })
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<String, CommandError> {
        self.podman()
            .args(["exec", name])
            .args(command.iter().cloned())
            .output(name)
            .await
    }

    async fn restart_container(&self, name: &str) -> Result<(), CommandError> {
        self.podman()
            .args(["restart", name])
            .output(name)
            .await
            .map(|_| ())
    }

    async fn stop_container(&self, name: &str, timeout_secs: u64) -> Result<(), CommandError> {
        self.podman()
            .args(["stop", "--time"])
            .arg(timeout_secs.to_string())
            .arg(name)
            .output(name)
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), CommandError> {
        let mut inv = self.podman().arg("rm");
        if force {
            inv = inv.arg("--force");
        }
        inv.arg(name).output(name).await.map(|_| ())
    }

    async fn stream_exec(
        &self,
        name: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<Option<i32>, CommandError> {
        let mut inv = self.podman().arg("exec");
        for (key, value) in env {
            inv = inv.arg("--env").arg(format!("{key}={value}"));
        }
        let inv = inv.arg(name).args(command.iter().cloned());

        info!(command = %inv.display(), "Starting proxy");

        // Dropping the future (on interrupt) kills the exec client
        let mut child = inv
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: inv.display(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, _, _) = tokio::join!(
            child.wait(),
            relay(stdout, "stdout"),
            relay(stderr, "stderr"),
        );
        let status = status.map_err(|source| CommandError::Spawn {
            command: inv.display(),
            source,
        })?;

        // 125 is podman itself failing, e.g. the container is gone
        if status.code() == Some(125) {
            return Err(CommandError::Failed {
                command: inv.display(),
                status: 125,
                stderr: "podman exec could not run the command".to_string(),
            });
        }

        Ok(status.code())
    }
}
