//! Axum route handlers.

pub mod upload;
