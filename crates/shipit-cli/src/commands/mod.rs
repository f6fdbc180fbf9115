//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use shipit_config::pipeline::parse_pipeline;
use shipit_config::{SystemConfig, VariableContext, VariableContextBuilder};
use shipit_core::RunId;
use shipit_core::artifact::ArtifactStore;
use shipit_core::credentials::{AssumeRoleRequest, CredentialProvider, ScopedCredentials};
use shipit_core::pipeline::{Pipeline, StageAction};
use shipit_deployer::{BeanstalkDeployerFactory, Endpoints, WebIdentityCredentialProvider};
use shipit_executor::{FsArtifactStore, LocalProcessExecutor};
use shipit_scheduler::PipelineOrchestrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The pipeline file and the directory it builds.
pub struct Target {
    pub file: PathBuf,
    pub workspace: PathBuf,
}

impl Target {
    pub fn new(file: PathBuf, workspace: Option<PathBuf>) -> Result<Self> {
        let workspace = match workspace {
            Some(dir) => dir,
            None => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf(),
        };
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace {}", workspace.display()))?;
        Ok(Self { file, workspace })
    }

    pub fn load(&self) -> Result<Pipeline> {
        let content = std::fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read pipeline file: {}", self.file.display()))?;
        parse_pipeline(&content)
            .with_context(|| format!("Failed to parse pipeline file: {}", self.file.display()))
    }
}

/// Stands in for role assumption when no identity token source is configured.
/// Build-only runs never reach it.
struct NoIdentity {
    reason: String,
}

#[async_trait]
impl CredentialProvider for NoIdentity {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn assume_role(&self, request: &AssumeRoleRequest) -> shipit_core::Result<ScopedCredentials> {
        Err(shipit_core::Error::CredentialExchange(format!(
            "cannot assume {}: {}",
            request.role_arn, self.reason
        )))
    }
}

/// Orchestrator wired to the local executor, the filesystem store and AWS.
pub(crate) struct Runner {
    pub orchestrator: PipelineOrchestrator,
    pub store: Arc<FsArtifactStore>,
    pub keep_artifacts: bool,
}

impl Runner {
    pub fn new(target: &Target, keep_artifacts: bool) -> Result<Self> {
        let system = SystemConfig::from_env().context("Invalid system settings")?;
        let endpoints = Endpoints::new(system.aws_endpoint.clone());

        let credentials: Arc<dyn CredentialProvider> =
            match WebIdentityCredentialProvider::from_env(endpoints.clone()) {
                Ok(provider) => Arc::new(provider),
                Err(e) => {
                    debug!(error = %e, "No identity token source");
                    Arc::new(NoIdentity {
                        reason: e.to_string(),
                    })
                }
            };

        let store = Arc::new(FsArtifactStore::new(&system.artifact_dir));
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(LocalProcessExecutor::new()),
            store.clone(),
            credentials,
            Arc::new(BeanstalkDeployerFactory::new(endpoints)),
            target.workspace.clone(),
        )
        .keep_artifacts(keep_artifacts)
        .session_duration(system.session_duration);

        Ok(Self {
            orchestrator,
            store,
            keep_artifacts,
        })
    }
}

/// Split a `--secret NAME=VALUE` flag.
fn parse_secret(flag: &str) -> Result<(String, String)> {
    match flag.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => bail!("invalid --secret '{}': expected NAME=VALUE", flag.split('=').next().unwrap_or("")),
    }
}

/// Variables for a run: explicit flags first, then CI environment, then the local repository.
pub(crate) async fn variable_context(
    target: &Target,
    sha: Option<String>,
    branch: Option<String>,
    secrets: &[String],
) -> Result<VariableContext> {
    let mut builder = VariableContextBuilder::new();
    if let Some(sha) = sha {
        builder = builder.with_git_sha(sha);
    }
    if let Some(branch) = branch {
        builder = builder.with_git_branch(branch);
    }
    let mut ctx = builder.build();
    ctx.populate_git_from_env();
    ctx.populate_env();
    ctx.populate_secrets_from_env();
    for flag in secrets {
        let (name, value) = parse_secret(flag)?;
        ctx.secrets.insert(name, value);
    }

    let workspace = target.workspace.clone();
    let ctx = tokio::task::spawn_blocking(move || {
        ctx.populate_git_from_repo(&workspace);
        ctx
    })
    .await
    .context("Failed to read git metadata")?;
    Ok(ctx)
}

pub fn validate(target: &Target) -> Result<bool> {
    let pipeline = match target.load() {
        Ok(pipeline) => pipeline,
        Err(e) => {
            println!("Configuration error: {:#}", e);
            return Ok(false);
        }
    };

    println!("Pipeline '{}' is valid", pipeline.name);
    for stage in &pipeline.stages {
        let kind = match &stage.action {
            StageAction::Build(build) => format!(
                "build ({} {}, archive {})",
                build.runtime.name, build.runtime.version, build.archive.file_name
            ),
            StageAction::Deploy(deploy) => {
                format!("deploy ({}/{})", deploy.application, deploy.environment)
            }
        };
        if stage.needs.is_empty() {
            println!("  {} - {}", stage.name, kind);
        } else {
            println!("  {} - {} after {}", stage.name, kind, stage.needs.join(", "));
        }
    }
    if pipeline.triggers.is_empty() {
        println!("  no triggers: runs only when started manually");
    }

    let missing: Vec<&str> = pipeline
        .runtime_env
        .iter()
        .map(String::as_str)
        .filter(|name| std::env::var_os(name).is_none())
        .collect();
    for name in &missing {
        println!("  warning: runtime variable {} is not set here", name);
    }

    Ok(true)
}

fn run_id(raw: &str) -> Result<RunId> {
    raw.parse()
        .with_context(|| format!("'{}' is not a run id", raw))
}

fn store() -> Result<FsArtifactStore> {
    let system = SystemConfig::from_env().context("Invalid system settings")?;
    Ok(FsArtifactStore::new(system.artifact_dir))
}

pub async fn artifacts_list(raw_run_id: &str) -> Result<bool> {
    let run_id = run_id(raw_run_id)?;
    let refs = store()?.list(&run_id).await?;
    if refs.is_empty() {
        println!("No artifacts for run {}", run_id);
    }
    for artifact in refs {
        println!(
            "{}/{}  {} bytes  sha256 {}  {}",
            artifact.key.stage,
            artifact.key.name,
            artifact.size,
            artifact.checksum,
            artifact.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(true)
}

pub async fn artifacts_purge(raw_run_id: &str) -> Result<bool> {
    let run_id = run_id(raw_run_id)?;
    let stats = store()?.purge_run(&run_id).await?;
    println!(
        "Deleted {} artifacts ({} bytes) of run {}",
        stats.artifacts_deleted, stats.bytes_freed, run_id
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secret() {
        assert_eq!(
            parse_secret("AWS_REGION=us-east-1").unwrap(),
            ("AWS_REGION".to_string(), "us-east-1".to_string())
        );
        assert_eq!(
            parse_secret("TOKEN=a=b").unwrap(),
            ("TOKEN".to_string(), "a=b".to_string())
        );
        assert!(parse_secret("TOKEN").is_err());
        assert!(parse_secret("=value").is_err());
    }

    #[test]
    fn test_invalid_secret_error_hides_value() {
        let err = parse_secret("=hunter2").unwrap_err().to_string();
        assert!(!err.contains("hunter2"));
    }

    #[test]
    fn test_run_id() {
        let id = RunId::new();
        assert_eq!(run_id(&id.to_string()).unwrap(), id);
        assert!(run_id("not-a-run").is_err());
    }
}
