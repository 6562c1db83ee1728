//! Worker agent core: identity and credential lifecycle for a render-farm host.

pub mod config;
pub mod control_plane;
pub mod credentials;
pub mod error;
pub mod fs;
pub mod identity;
pub mod ids;
pub mod layout;
pub mod logging;
pub mod runtime;
pub mod sessions;

pub use config::AgentSettings;
pub use error::{Error, Result};
pub use runtime::{ActiveSession, Collaborators, WorkerRuntime, bootstrap};
