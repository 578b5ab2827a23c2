//! Bounded connectivity check with reconnect between attempts

use std::net::Ipv4Addr;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ProbePlan;
use crate::container::ContainerManager;
use crate::error::SessionError;
use crate::network::ReachableGateway;

/// Pings a known target from inside the container until it answers
pub struct ConnectivityProbe {
    plan: ProbePlan,
}

impl ConnectivityProbe {
    pub fn new(plan: ProbePlan) -> Self {
        Self { plan }
    }

    /// Returns the gateway confirmed by the last (re)connect.
    ///
    /// Every attempt is bounded by the plan's timeout, so a stalled ping
    /// can never hang the session.
    pub async fn establish(
        &self,
        containers: &mut ContainerManager,
        network: &str,
        address: Ipv4Addr,
        mut gateway: ReachableGateway,
    ) -> Result<ReachableGateway, SessionError> {
        let target = self.plan.target;

        for attempt in 1..=self.plan.attempts {
            match timeout(self.plan.timeout, containers.ping(target, self.plan.timeout)).await {
                Ok(Ok(true)) => {
                    info!(%target, attempt, "Connectivity established");
                    return Ok(gateway);
                }
                Ok(Ok(false)) => warn!(%target, attempt, "No reply"),
                Ok(Err(e)) => warn!(%target, attempt, error = %e, "Probe failed"),
                Err(_) => warn!(
                    %target,
                    attempt,
                    timeout_secs = self.plan.timeout.as_secs_f64(),
                    "Probe timed out"
                ),
            }

            if attempt < self.plan.attempts {
                info!(attempt, "Reconnecting container");
                gateway = containers.reconnect(network, address).await?;
            }
        }

        Err(SessionError::Connectivity {
            attempts: self.plan.attempts,
        })
    }
}
