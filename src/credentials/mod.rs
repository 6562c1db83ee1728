//! Fleet and queue credentials.

pub mod cache;
pub mod fleet;
pub mod queue;
pub mod types;

pub use cache::{Cached, CredentialCache, CredentialOrigin, FallbackPolicy};
pub use fleet::FleetCredentialManager;
pub use queue::{QueueCredentialBundle, QueueCredentialVendor};
pub use types::{Expiring, FleetCredential, TemporaryCredential};
