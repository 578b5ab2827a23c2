//! Session lifecycle state machine
//!
//! Idle → Provisioning → Running → TearingDown → Idle, once per process.
//! Provisioning starts by purging dangling state, then allocates, builds
//! the network, starts the container and installs routes, strictly in that
//! order. Running waits for either the proxy to exit or cancellation.
//! Teardown replays the ledger in reverse through one generic destroyer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SessionConfig, SessionPlan};
use crate::container::{ContainerManager, ContainerRuntime};
use crate::error::{CommandError, SessionError};
use crate::network::{HostNetwork, InterfaceAllocator, NetworkProvisioner, Route, RouteManager};

use super::ledger::{cleanup_plan, Resource, ResourceLedger};
use super::lock::SessionLock;
use super::probe::ConnectivityProbe;
use super::teardown::{execute, Destroyer, Removal, TeardownReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Provisioning,
    Running,
    TearingDown,
}

/// The three resource owners of a session
pub struct SessionResources {
    pub network: NetworkProvisioner,
    pub containers: ContainerManager,
    pub routes: RouteManager,
}

impl SessionResources {
    pub fn new(
        plan: &SessionPlan,
        host: Arc<dyn HostNetwork>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            network: NetworkProvisioner::new(host.clone(), runtime.clone(), plan.identity.clone()),
            containers: ContainerManager::new(
                runtime,
                plan.identity.clone(),
                plan.container.clone(),
            ),
            routes: RouteManager::new(host),
        }
    }
}

#[async_trait]
impl Destroyer for SessionResources {
    async fn destroy(&mut self, resource: &Resource) -> Result<Removal, CommandError> {
        match resource {
            Resource::HostAdapter { name } => self.network.remove_host_adapter(name).await,
            Resource::ContainerNetwork { name } => {
                self.network.remove_container_network(name).await
            }
            Resource::Container { name } => self.containers.remove_named(name).await,
            Resource::Route {
                destination,
                gateway,
            } => {
                self.routes
                    .remove_route(&Route {
                        destination: *destination,
                        gateway: *gateway,
                    })
                    .await
            }
            Resource::RouteTo { destination } => {
                self.routes.remove_destination(*destination).await
            }
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: Result<(), SessionError>,
    pub transitions: Vec<LifecycleState>,
    /// Present when teardown ran
    pub teardown: Option<TeardownReport>,
}

impl SessionOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(()) => 0,
            Err(e) => e.exit_code(),
        }
    }
}

/// Drives one session from start to full teardown
pub struct LifecycleController {
    plan: SessionPlan,
    session_id: Uuid,
    resources: SessionResources,
    allocator: InterfaceAllocator,
    state: LifecycleState,
    transitions: Vec<LifecycleState>,
}

impl LifecycleController {
    pub fn new(
        plan: SessionPlan,
        host: Arc<dyn HostNetwork>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            resources: SessionResources::new(&plan, host.clone(), runtime),
            allocator: InterfaceAllocator::new(host, plan.allocation),
            plan,
            session_id: Uuid::new_v4(),
            state: LifecycleState::Idle,
            transitions: vec![LifecycleState::Idle],
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        info!(from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
        self.transitions.push(next);
    }

    /// Run the whole session; returns after teardown
    pub async fn run(mut self, cancel: CancellationToken) -> SessionOutcome {
        let lock = match SessionLock::acquire(&self.plan.state_dir) {
            Ok(lock) => lock,
            Err(e) => return self.finish(Err(e), None),
        };

        self.transition(LifecycleState::Provisioning);

        let mut ledger = ResourceLedger::persistent(self.plan.ledger_path(), self.session_id);
        recover(&mut self.resources, &self.plan, &mut ledger).await;

        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Interrupted during provisioning");
                Ok(None)
            }
            result = provision(&self.plan, &self.allocator, &mut self.resources, &mut ledger) => {
                result.map(Some)
            }
        };

        let result = match provisioned {
            Ok(Some(cfg)) => {
                self.transition(LifecycleState::Running);
                self.wait(&cfg, &cancel).await
            }
            Ok(None) => Ok(()),
            Err(e) if !e.requires_teardown() => {
                error!(error = %e, "Session could not start");
                drop(lock);
                return self.finish(Err(e), None);
            }
            Err(e) => {
                error!(error = %e, "Provisioning failed");
                Err(e)
            }
        };

        self.transition(LifecycleState::TearingDown);
        let report = teardown(&mut self.resources, &mut ledger).await;
        drop(lock);

        self.finish(result, Some(report))
    }

    async fn wait(
        &mut self,
        cfg: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        info!(
            container = %cfg.identity.container,
            routes = cfg.static_routes.len(),
            "Session running"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Interrupt received, tearing down");
                Ok(())
            }
            exit = self.resources.containers.run_proxy(cfg.custom_opcodes) => match exit {
                Ok(Some(0)) => {
                    info!("Proxy exited normally");
                    Ok(())
                }
                Ok(exit_code) => {
                    warn!(?exit_code, "Proxy exited");
                    Err(SessionError::Runtime { exit_code })
                }
                Err(e) => {
                    error!(error = %e, "Proxy could not run");
                    Err(SessionError::Runtime { exit_code: None })
                }
            },
        }
    }

    fn finish(
        mut self,
        result: Result<(), SessionError>,
        teardown: Option<TeardownReport>,
    ) -> SessionOutcome {
        if self.state != LifecycleState::Idle {
            self.transition(LifecycleState::Idle);
        }
        SessionOutcome {
            result,
            transitions: self.transitions,
            teardown,
        }
    }
}

/// Allocate, provision the network, start the container and install routes
async fn provision(
    plan: &SessionPlan,
    allocator: &InterfaceAllocator,
    resources: &mut SessionResources,
    ledger: &mut ResourceLedger,
) -> Result<SessionConfig, SessionError> {
    let parent = allocator.select_parent(&plan.parent).await?;
    let pair = allocator.allocate(&parent, plan.overrides).await?;
    let cfg = SessionConfig::new(plan, &parent);
    let network = cfg.identity.container_network.clone();

    resources.network.create(&cfg, pair, ledger).await?;

    resources
        .containers
        .start(&cfg, &network, pair.container, ledger)
        .await?;
    let mut gateway = resources
        .containers
        .await_address(&network, pair.container)
        .await?;
    resources.containers.prepare().await?;

    if let Some(probe) = plan.probe {
        gateway = ConnectivityProbe::new(probe)
            .establish(&mut resources.containers, &network, pair.container, gateway)
            .await?;
    }

    resources
        .routes
        .install(&cfg.static_routes, gateway, ledger)
        .await?;

    Ok(cfg)
}

/// Purge whatever a previous run left under the well-known names, on the
/// configured route destinations or in its ledger. Absent resources count
/// as success.
async fn recover(
    resources: &mut SessionResources,
    plan: &SessionPlan,
    ledger: &mut ResourceLedger,
) -> TeardownReport {
    let leftovers = ResourceLedger::load_leftovers(&plan.ledger_path());
    let targets = cleanup_plan(&plan.identity, &plan.static_routes, &leftovers);
    let report = execute(resources, &targets).await;

    if report.found_anything() {
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Purged dangling state from a previous run"
        );
    }

    ledger.clear();
    // Keep what could not be removed for the next attempt
    for failure in &report.failed {
        ledger.record(failure.resource.clone());
    }
    report
}

/// Reverse-order teardown of everything this session recorded
async fn teardown(resources: &mut SessionResources, ledger: &mut ResourceLedger) -> TeardownReport {
    let recorded = ledger.resources();
    let report = execute(resources, &recorded).await;

    for resource in report.removed.iter().chain(report.absent.iter()) {
        ledger.forget(resource);
    }

    if report.is_clean() {
        ledger.clear();
        info!(removed = report.removed.len(), "Teardown complete");
    } else {
        warn!(
            failed = report.failed.len(),
            "Teardown incomplete; remaining resources are purged on next start"
        );
    }
    report
}

/// Remove dangling state without starting a session
pub async fn purge(
    plan: &SessionPlan,
    host: Arc<dyn HostNetwork>,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<TeardownReport, SessionError> {
    let _lock = SessionLock::acquire(&plan.state_dir)?;
    let mut resources = SessionResources::new(plan, host, runtime);
    let mut ledger = ResourceLedger::persistent(plan.ledger_path(), Uuid::new_v4());

    let report = recover(&mut resources, plan, &mut ledger).await;
    if !report.found_anything() {
        info!("Nothing to clean up");
    }
    Ok(report)
}
