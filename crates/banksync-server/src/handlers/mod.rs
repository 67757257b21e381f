//! HTTP request handlers organized by domain
//!
//! Each submodule contains handlers for a specific API area.

pub mod connections;
pub mod diagnostics;
pub mod webhooks;

// Re-export all handlers for use in router
pub use connections::*;
pub use diagnostics::*;
pub use webhooks::*;
