//! Router configuration.
//!
//! ## Loading Order
//!
//! 1. `ROUTER_CONFIG` environment variable (path to TOML file)
//! 2. `router.toml` in the current working directory
//! 3. Built-in defaults
//!
//! `ROUTER_SERVER_ADDR` overrides `server.addr` after loading. The loaded
//! `RouterConfig` is passed explicitly to the components that need it; there
//! is no global instance.

pub mod defaults;
mod router_config;
pub mod validation;

pub use router_config::*;
