//! FOTA Core
//!
//! Core types for the firmware-update job agent.
//!
//! This crate contains:
//! - Domain types: job operations, execution records, status/step vocabulary
//! - Wire model: job envelopes, status-update payloads, echo payloads
//! - Topic scheme: the templated topic names the agent publishes and
//!   subscribes on

pub mod envelope;
pub mod error;
pub mod job;
pub mod topics;

pub use error::{DecodeError, JobError, codes};
pub use job::{ExecutionRecord, JobStatus, Operation, StatusDetails, Step};
pub use topics::TopicScheme;
