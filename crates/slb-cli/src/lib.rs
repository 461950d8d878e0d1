//! # slb-cli
//!
//! Operator command line for SLB.
//!
//! ## Commands
//!
//! - `slb classify`: Show the risk tier of a command without recording anything
//! - `slb pending`: List requests waiting for review
//! - `slb show`: Show a request and its reviews
//! - `slb sweep`: End stale sessions and time out expired requests
//! - `slb rollback show|restore`: Inspect or restore a rollback point
//! - `slb config`: Show the effective configuration and its warnings

pub mod commands;

pub use commands::Cli;
