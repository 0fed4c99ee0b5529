//! Core infrastructure: configuration, errors, telemetry.

pub mod config;
pub mod error;
pub mod telemetry;
