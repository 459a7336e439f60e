//! Version string reported in logs and `@PG` header lines.

/// The crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
