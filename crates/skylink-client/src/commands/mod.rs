//! Subcommand implementations.

pub mod call;
pub mod config;
pub mod subscribe;
