pub mod cloud;
pub mod config;
pub mod deps;
pub mod error;
pub mod graph;
pub mod groups;
pub mod io;
pub mod naming;
pub mod orchestrator;
pub mod plugin;
pub mod targets;
pub mod types;

#[cfg(test)]
mod testutil;

pub use error::{InfraError, Result};
