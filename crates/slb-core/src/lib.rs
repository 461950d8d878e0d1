//! # slb-core
//!
//! Core types and primitives for SLB, the "simultaneous launch button" that sits
//! between an autonomous agent and its shell. This crate defines the shared
//! vocabulary (tiers, sessions, requests, reviews, errors) used by every other
//! crate in the workspace.

pub mod error;
pub mod types;

pub use error::{Result, SlbError};
pub use types::*;
