//! Command trait definition for CLI commands.

use anyhow::Result;
use enum_dispatch::enum_dispatch;

/// Trait implemented by all bamline CLI commands.
///
/// The `command_line` parameter carries the full invocation for `@PG`
/// header records.
#[enum_dispatch]
pub trait Command {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, command_line: &str) -> Result<()>;
}
