pub mod config;
pub mod crypto;
pub mod error;

pub use config::*;
pub use crypto::*;
pub use error::*;

/// Index of a process in the membership, in `[0, n)`.
pub type ProcessId = u32;
