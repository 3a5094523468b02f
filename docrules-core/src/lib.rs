//! Core shared library for the docrules workspace.
//!
//! This crate exposes the primitives every other crate depends on:
//! configuration loading, the canonical error type, the Postgres pool
//! wrapper, JSON helpers and logging setup.

pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod serde_utils;

pub use config::{CoreConfig, Environment};
pub use errors::{DocRulesError, Result as CoreResult};
