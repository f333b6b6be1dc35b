//! # Zapflow Core
//!
//! Shared data model, configuration and error types for the follow-up
//! orchestration layer. Everything here is plain data: the scheduler crate
//! owns the behaviour.

pub mod config;
pub mod error;
pub mod types;

pub use config::ZapflowConfig;
pub use error::{Result, ZapflowError};
pub use types::{
    FollowUp, FollowUpStatus, JsonPayload, Lead, NewFollowUp, StatusCounts, epoch_ms,
};
