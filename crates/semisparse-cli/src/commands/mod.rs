//! Subcommand implementations

pub(crate) mod bench;
pub(crate) mod checkpoint;
