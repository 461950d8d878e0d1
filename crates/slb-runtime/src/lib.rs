//! # slb-runtime
//!
//! The collaborator surface a front end (CLI, daemon, agent hook) drives:
//! classify a command, open a request for it, collect reviews, and finally
//! clear it for execution once approved and backed by a rollback point.
//!
//! Nothing here executes the guarded command itself.

pub mod gateway;

pub use gateway::{Clearance, Gateway, Proposal};
