//! Version graphs and specifier resolution.

pub mod graph;
pub mod resolver;
pub mod spec;

pub use graph::{GraphStore, HandlerGraph, VersionNode};
pub use resolver::{Resolution, Resolver};
pub use spec::{VersionSpec, LATEST};
