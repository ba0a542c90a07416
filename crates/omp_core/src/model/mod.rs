//! Observation-management domain model.
//!
//! # Responsibility
//! - Define constraint ranges, history comments, MSBs and science programs.
//! - Keep state transitions pure; persistence lives in [`crate::repo`].
//!
//! # Invariants
//! - An MSB is identified by its content checksum within one project.
//! - A science program exclusively owns its MSBs.

pub mod comment;
pub mod msb;
pub mod program;
pub mod range;
