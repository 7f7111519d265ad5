//! Core data model, configuration, errors, and wire protocol for Parley.

pub mod agent;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
