//! Worker identity: which fleet worker this host runs as.
//!
//! - `probe`: instance metadata lookup (failure means "absent")
//! - `profile`: the startup wait for the host's instance profile to be detached
//! - `state`: the persisted `worker.json` record
//! - `resolver`: reconciliation of the two into a worker id

pub mod probe;
pub mod profile;
pub mod resolver;
pub mod state;

pub use probe::{ImdsProbe, InstanceIdentityProbe, NoInstanceProbe};
pub use profile::{InstanceProfileProbe, await_profile_detached};
pub use resolver::{Resolution, ResolvedIdentity, WorkerIdentityResolver, plan};
pub use state::{WorkerState, WorkerStateStore};
