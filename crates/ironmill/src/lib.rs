pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod gn_args;
pub mod log_sanitize;
pub mod logging;
pub mod markers;
pub mod orchestrator;
pub mod phases;
pub mod pipeline;
pub mod template;
pub mod workspace;

pub use error::{Error, Result};
