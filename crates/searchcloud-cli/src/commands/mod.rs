//! CLI command implementations.

pub mod conf;
pub mod config;
pub mod run;
