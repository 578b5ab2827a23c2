//! Best-effort reverse-order destruction of recorded resources

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{CommandError, TeardownError};

use super::ledger::Resource;

/// What happened to a resource that was asked to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    AlreadyAbsent,
}

/// Removes one resource of any kind.
///
/// Implementations must report an absent resource as
/// `Ok(Removal::AlreadyAbsent)`, never as an error.
#[async_trait]
pub trait Destroyer: Send {
    async fn destroy(&mut self, resource: &Resource) -> Result<Removal, CommandError>;
}

/// Outcome of a teardown pass
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub removed: Vec<Resource>,
    pub absent: Vec<Resource>,
    pub failed: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// True if anything was actually present
    pub fn found_anything(&self) -> bool {
        !self.removed.is_empty() || !self.failed.is_empty()
    }

    /// Exit status of a standalone cleanup: 1 if any removal failed
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

/// Destroy `resources` (given in creation order) last-created first.
///
/// Each step is independent: a failure is logged and recorded, and the
/// remaining steps still run.
pub async fn execute<D>(destroyer: &mut D, resources: &[Resource]) -> TeardownReport
where
    D: Destroyer + ?Sized,
{
    let mut report = TeardownReport::default();

    for resource in resources.iter().rev() {
        match destroyer.destroy(resource).await {
            Ok(Removal::Removed) => {
                info!(%resource, "Removed");
                report.removed.push(resource.clone());
            }
            Ok(Removal::AlreadyAbsent) => {
                debug!(%resource, "Already absent");
                report.absent.push(resource.clone());
            }
            Err(source) => {
                let err = TeardownError {
                    resource: resource.clone(),
                    source,
                };
                warn!(error = %err, "Teardown step failed, continuing");
                report.failed.push(err);
            }
        }
    }

    report
}
