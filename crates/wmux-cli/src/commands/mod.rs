//! CLI subcommand implementations.

pub mod attach;
pub mod close;
pub mod run;
pub mod token;
