//! KDL configuration parsing for shipit.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (shipit.kdl)
//! - System settings from the process environment
//! - Variable interpolation

pub mod error;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::SystemConfig;
pub use variables::{
    GitContext, PipelineContext, RunContext, StageContext, VariableContext, VariableContextBuilder,
};
