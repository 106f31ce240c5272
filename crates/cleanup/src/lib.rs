//! Failed-enqueue cleanup process: configuration loading and startup wiring.

pub mod app;
pub mod config;
