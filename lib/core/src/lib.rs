//! Core domain types and utilities for braid.
//!
//! This crate provides the identifiers and error handling foundation shared
//! by the workflow execution core and the hosts that embed it.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ConfirmId, ParseIdError, RunId, WorkflowId};
