//! # slb-store
//!
//! Durable state for the approval workflow: agent sessions, requests and
//! reviews in one SQLite database. Every mutation is a single statement or a
//! single `BEGIN IMMEDIATE` transaction, so concurrent agents sharing the
//! database never observe or create a torn state.

pub mod ratelimit;
pub mod request;
pub mod session;
pub mod store;
pub mod sweep;

pub use ratelimit::RateLimitStatus;
pub use request::NewRequest;
pub use store::{RequestPolicy, Store};
pub use sweep::{SweepReport, Sweeper};
