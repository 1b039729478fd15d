//! Core abstractions and interfaces for timescape
//!
//! This module provides the error taxonomy, per-request context and the traits
//! that decouple the engine from storage, observability and business code.

pub mod context;
pub mod error;
pub mod traits;

// Re-export commonly used types
pub use context::{
    Exchange, FailureInfo, GlobalContext, HandlerRequest, LocalContext, ResponseBuilder,
};
pub use error::{
    CatchRecord, ErrorContext, PayloadSide, RouteError, RouteResult, StructuredError,
};
pub use traits::*;
