//! Shared foundation for the gantry execution core.
//!
//! This crate carries the pieces every other gantry crate leans on:
//! - the error taxonomy ([`CoreError`])
//! - the risk model ([`RiskLevel`])
//! - the tool dispatch seam ([`ToolDispatcher`], [`ToolContext`], [`ToolOutcome`])
//! - time-boxed cache entries ([`TimedEntry`])
//! - configuration loading ([`GantryConfig`])

pub mod cache;
pub mod config;
pub mod error;
pub mod tool;
pub mod types;

pub use cache::TimedEntry;
pub use config::{ApprovalConfig, ExecutorConfig, GantryConfig, StorageConfig};
pub use error::{CoreError, Result};
pub use tool::{ToolContext, ToolDispatcher, ToolOutcome};
pub use types::{short_id, RiskLevel};
