//! Build stage: checkout, runtime check, dependency install, archive, publish.

use bytes::Bytes;
use shipit_config::VariableContext;
use shipit_core::artifact::{ArtifactKey, ArtifactRef};
use shipit_core::executor::JobSpec;
use shipit_core::pipeline::{BuildSpec, CheckoutSpec, Stage};
use shipit_core::{Error, Result, RunId};
use shipit_executor::Archiver;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::orchestrator::{PipelineEvent, PipelineOrchestrator};
use crate::step::{emit, run_job, shell_quote, system_log, tracked};

pub(crate) struct BuildStage<'a> {
    pub orchestrator: &'a PipelineOrchestrator,
    pub tx: &'a mpsc::Sender<PipelineEvent>,
    pub run_id: RunId,
    pub stage: &'a Stage,
    pub build: &'a BuildSpec,
    pub env: HashMap<String, String>,
}

impl BuildStage<'_> {
    pub async fn run(&self, ctx: &mut VariableContext) -> Result<ArtifactRef> {
        let name = self.stage.name.as_str();

        if self.build.checkout.enabled {
            let commands = checkout_commands(&self.build.checkout, ctx);
            tracked(self.tx, name, "checkout", async {
                self.shell(ctx, commands, Error::ExecutionFailed).await.map(|_| ())
            })
            .await?;

            let workspace = self.orchestrator.workspace.clone();
            let mut populated = ctx.clone();
            *ctx = tokio::task::spawn_blocking(move || {
                populated.populate_git_from_repo(&workspace);
                populated
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        }

        tracked(self.tx, name, "runtime", self.check_runtime(ctx)).await?;

        let upgrade = ctx.interpolate_vec(&self.build.upgrade);
        if !upgrade.is_empty() {
            tracked(self.tx, name, "upgrade", async {
                self.shell(ctx, upgrade, Error::DependencyResolution)
                    .await
                    .map(|_| ())
            })
            .await?;
        }

        tracked(self.tx, name, "install", self.install(ctx)).await?;

        let archive_path = tracked(self.tx, name, "archive", self.archive()).await?;

        let reference = tracked(self.tx, name, "publish", self.publish(&archive_path)).await?;
        emit(
            self.tx,
            PipelineEvent::ArtifactPublished {
                stage: name.to_string(),
                artifact: reference.clone(),
            },
        )
        .await;
        Ok(reference)
    }

    async fn shell(
        &self,
        ctx: &VariableContext,
        commands: Vec<String>,
        fail: fn(String) -> Error,
    ) -> Result<Vec<String>> {
        let job = JobSpec::shell(&commands)
            .in_dir(&self.orchestrator.workspace)
            .with_env(self.env.clone())
            .with_timeout(self.build.step_timeout);
        run_job(
            &self.orchestrator.executor,
            self.tx,
            ctx,
            &self.stage.name,
            job,
            fail,
        )
        .await
    }

    async fn check_runtime(&self, ctx: &VariableContext) -> Result<()> {
        let runtime = &self.build.runtime;
        let output = self
            .shell(ctx, vec![runtime.version_command()], Error::RuntimeMismatch)
            .await?;
        let reported = output.join(" ");
        if !runtime.reports_version(&reported) {
            return Err(Error::RuntimeMismatch(format!(
                "{} reported '{}', expected {} {}",
                runtime.binary,
                reported.trim(),
                runtime.name,
                runtime.version
            )));
        }
        info!(runtime = %runtime.name, version = %runtime.version, "Runtime verified");
        Ok(())
    }

    async fn install(&self, ctx: &VariableContext) -> Result<()> {
        let manifest = ctx.interpolate(&self.build.manifest);
        let path = self.orchestrator.workspace.join(&manifest);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::DependencyResolution(format!(
                "manifest {} not found in {}",
                manifest,
                self.orchestrator.workspace.display()
            )));
        }
        let install = ctx.interpolate_vec(&self.build.install);
        if install.is_empty() {
            return Ok(());
        }
        self.shell(ctx, install, Error::DependencyResolution)
            .await
            .map(|_| ())
    }

    async fn archive(&self) -> Result<std::path::PathBuf> {
        let archiver = Archiver::new(&self.build.archive.excludes)?;
        let source = self.orchestrator.workspace.clone();
        let dest = source.join(&self.build.archive.file_name);

        let summary = tokio::task::spawn_blocking(move || archiver.create(&source, &dest))
            .await
            .map_err(|e| Error::Archive(format!("archive task failed: {}", e)))??;

        system_log(
            self.tx,
            &self.stage.name,
            format!(
                "Archived {} files into {} ({} bytes)",
                summary.files,
                summary.path.display(),
                summary.bytes
            ),
        )
        .await;
        Ok(summary.path)
    }

    async fn publish(&self, archive: &std::path::Path) -> Result<ArtifactRef> {
        let data = tokio::fs::read(archive)
            .await
            .map_err(|e| Error::Archive(format!("cannot read {}: {}", archive.display(), e)))?;
        let key = ArtifactKey::new(self.run_id, &self.stage.name, &self.build.artifact);
        let reference = self.orchestrator.artifacts.put(&key, Bytes::from(data)).await?;
        system_log(
            self.tx,
            &self.stage.name,
            format!("Published artifact '{}' (sha256 {})", key.name, reference.checksum),
        )
        .await;
        Ok(reference)
    }
}

/// Commands that bring the workspace to the commit being built.
fn checkout_commands(checkout: &CheckoutSpec, ctx: &VariableContext) -> Vec<String> {
    let reference = checkout
        .reference
        .as_deref()
        .map(|r| ctx.interpolate(r))
        .filter(|r| !r.is_empty() && !r.contains("${"));

    match &checkout.repository {
        Some(repository) => {
            let repository = shell_quote(&ctx.interpolate(repository));
            let target = reference
                .or_else(|| ctx.resolve("git.sha"))
                .map(|r| shell_quote(&r))
                .unwrap_or_else(|| "origin/HEAD".to_string());
            vec![
                "git init -q".to_string(),
                format!(
                    "(git remote add origin {repo} 2>/dev/null || git remote set-url origin {repo})",
                    repo = repository
                ),
                "git fetch -q --tags --prune origin '+refs/heads/*:refs/remotes/origin/*'"
                    .to_string(),
                "git remote set-head origin --auto".to_string(),
                format!("git checkout -q --force {}", target),
            ]
        }
        None => {
            let mut commands = vec![
                "git rev-parse --is-inside-work-tree".to_string(),
                r#"if [ "$(git rev-parse --is-shallow-repository)" = "true" ]; then git fetch -q --unshallow --tags; fi"#
                    .to_string(),
            ];
            if let Some(reference) = reference {
                commands.push(format!("git checkout -q {}", shell_quote(&reference)));
            }
            commands
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipit_config::VariableContextBuilder;

    #[test]
    fn test_checkout_existing_workspace_unshallows() {
        let ctx = VariableContext::default();
        let commands = checkout_commands(&CheckoutSpec::default(), &ctx);
        assert_eq!(commands.len(), 2);
        assert!(commands[1].contains("--unshallow"));
    }

    #[test]
    fn test_checkout_clone_targets_commit() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();
        let checkout = CheckoutSpec {
            enabled: true,
            repository: Some("https://github.com/acme/livekit-poc.git".to_string()),
            reference: None,
        };
        let commands = checkout_commands(&checkout, &ctx);
        assert_eq!(commands.last().unwrap(), "git checkout -q --force abc123");
    }

    #[test]
    fn test_checkout_explicit_reference_wins() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc123")
            .with_git_branch("main")
            .build();
        let checkout = CheckoutSpec {
            enabled: true,
            repository: Some("git@github.com:acme/livekit-poc.git".to_string()),
            reference: Some("origin/${git.branch}".to_string()),
        };
        let commands = checkout_commands(&checkout, &ctx);
        assert_eq!(commands.last().unwrap(), "git checkout -q --force origin/main");
    }

    #[test]
    fn test_checkout_without_commit_uses_remote_head() {
        let checkout = CheckoutSpec {
            enabled: true,
            repository: Some("https://example.com/repo.git".to_string()),
            reference: None,
        };
        let commands = checkout_commands(&checkout, &VariableContext::default());
        assert_eq!(commands.last().unwrap(), "git checkout -q --force origin/HEAD");
    }
}
