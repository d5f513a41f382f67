//! API response data models.
//!
//! - [`publications`]: the record describing a protected publication

pub mod publications;
