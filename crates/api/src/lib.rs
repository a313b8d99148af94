//! Laminar API server library.
//!
//! Exposes the building blocks (config, state, gateway tier, error handling,
//! routes) so integration tests and the binary entrypoint can both access
//! them.

pub mod background;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod state;
