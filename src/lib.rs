//! Chorus real-time hub library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod upstream;
pub mod ws;
