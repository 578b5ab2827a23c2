//! Session lifecycle: ledger, lock, probe, teardown and the controller
//! that sequences them

pub mod controller;
pub mod ledger;
pub mod lock;
pub mod probe;
pub mod teardown;

pub use controller::{purge, LifecycleController, LifecycleState, SessionOutcome, SessionResources};
pub use ledger::{cleanup_plan, Resource, ResourceLedger};
pub use lock::SessionLock;
pub use probe::ConnectivityProbe;
pub use teardown::{execute, Destroyer, Removal, TeardownReport};
