//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod copy;
#[cfg(feature = "tracing-init")]
mod tracing_util;

pub use copy::*;
#[cfg(feature = "tracing-init")]
pub use tracing_util::*;
