//! Pipeline orchestration for shipit.
//!
//! Runs a pipeline's stages in dependency order: the build stage drives the
//! executor and publishes the archive, the deploy stage exchanges credentials
//! and hands the archive to a deployer.

mod build;
mod deploy;
pub mod orchestrator;
mod step;

pub use orchestrator::{
    PipelineEvent, PipelineOrchestrator, PipelineResult, StageSelection, StageState,
};
