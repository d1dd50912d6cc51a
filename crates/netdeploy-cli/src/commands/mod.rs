//! CLI subcommands.

pub mod config;
pub mod infer;
pub mod inspect;
