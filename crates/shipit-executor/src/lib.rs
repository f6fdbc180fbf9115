//! Job execution and packaging backends for shipit.
//!
//! Provides:
//! - Local process executor for build commands
//! - Zip archiver for the build artifact
//! - Filesystem artifact store

pub mod archive;
pub mod local;
pub mod store;

pub use archive::{ArchiveSummary, Archiver};
pub use local::LocalProcessExecutor;
pub use shipit_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
pub use store::FsArtifactStore;
