//! # slb-classify
//!
//! Risk classification for proposed shell commands.
//!
//! A command is split into segments, wrapper programs (`sudo`, `env`, ...)
//! are stripped, path arguments are resolved against the working directory,
//! and each segment is matched against an ordered, immutable rule table.
//! Unrecognized commands fall through to `Unclassified` and are never blocked.

pub mod normalize;
pub mod pattern;
pub mod redact;

pub use normalize::{NormalizedCommand, normalize};
pub use pattern::{ClassificationResult, PatternEngine};
pub use redact::{Redacted, Redactor};
