//! Process-wide helpers shared by the manager subcommands.

pub mod bootstrap;
