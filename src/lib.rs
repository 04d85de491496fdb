//! verbatim: an in-process output cache for HTTP read operations.

pub mod cache;
pub mod config;
pub mod infra;
