//! HTTP surface of the service.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Response data structures, shared with the LCP server notification

pub mod handlers;
pub mod models;
