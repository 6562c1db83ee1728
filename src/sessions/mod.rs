//! Session working directories.

pub mod directory;
pub mod retention;

pub use directory::{CleanupOutcome, DirectoryOrigin, SessionDirectory, SessionDirectoryManager};
pub use retention::resolve_retention;
