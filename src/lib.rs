//! This module contains the core logic of timescape, a versioned request
//! routing and lifecycle orchestration engine.
//!
//! Requests name a handler and a version specifier. The engine resolves the
//! specifier against the handler's version graph, adapts payloads between the
//! requested and the authored version, and runs the handler inside a hooked
//! lifecycle with timeouts, retries and a catch chain.

pub mod config;
pub mod core;
pub mod hook;
pub mod logging;
pub mod manifest;
pub mod registry;
pub mod route;
pub mod schema;
pub mod transform;
pub mod version;

pub use crate::core::{Handler, Hook, RouteError, RouteResult, StructuredError, Transformer};
pub use config::Config;
pub use registry::Registry;
pub use route::{RequestDescriptor, ResponseDescriptor, RouteBinding, RouteManager};
