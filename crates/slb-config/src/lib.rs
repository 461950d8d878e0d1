//! # slb-config
//!
//! Configuration system for SLB. Reads from `slb.toml` and environment
//! variables, in that precedence order (env fills in / overrides selected keys).

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::SlbConfig;
pub use schema::{
    AgentsConfig, ConfigWarning, GeneralConfig, LoggingConfig, PatternTierConfig, PatternsConfig,
    RateLimitAction, RollbackConfig, RuleConfig, SessionsConfig, StoreConfig, WarningSeverity,
};
