//! Smith Core - Foundational Types
//!
//! This crate provides the types shared across the smith microcontainer
//! builder: the error type, the build specification model, and a few
//! constants baked into every image smith produces.

pub mod error;
pub mod spec;

// Re-export commonly used types
pub use error::{Result, SmithError};
pub use spec::ImageSpec;

/// Smith version, stamped into image annotations.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source revision smith was built from, when the build system provides it.
pub const SHA: &str = match option_env!("SMITH_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// Default uid and gid for containers that don't declare an identity.
pub const DEFAULT_ID: u32 = 10;

/// Default user and group name matching [`DEFAULT_ID`].
pub const DEFAULT_NAME: &str = "smith";
