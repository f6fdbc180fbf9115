//! Deploy stage: fetch the artifact, assume the role, submit, wait.

use shipit_config::VariableContext;
use shipit_core::artifact::ArtifactKey;
use shipit_core::credentials::AssumeRoleRequest;
use shipit_core::deployer::{DeploymentHandle, DeploymentSpec};
use shipit_core::pipeline::{DeploySpec, Stage};
use shipit_core::{Error, Result, RunId};
use shipit_deployer::{WaitOptions, wait_for_deployment};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::orchestrator::{PipelineEvent, PipelineOrchestrator};
use crate::step::{emit, system_log, tracked};

/// Longest description the platform stores with a version.
const MAX_DESCRIPTION_LEN: usize = 200;

/// Credential lifetime set aside for uploading and submitting the bundle.
const SUBMIT_ALLOWANCE: Duration = Duration::from_secs(5 * 60);

pub(crate) struct DeployStage<'a> {
    pub orchestrator: &'a PipelineOrchestrator,
    pub tx: &'a mpsc::Sender<PipelineEvent>,
    pub run_id: RunId,
    pub pipeline_name: &'a str,
    pub stage: &'a Stage,
    pub deploy: &'a DeploySpec,
    /// Stage that published the artifact.
    pub build_stage: &'a str,
}

struct Resolved {
    artifact: String,
    role: String,
    region: String,
    spec: DeploymentSpec,
}

impl DeployStage<'_> {
    pub async fn run(&self, ctx: &VariableContext) -> Result<DeploymentHandle> {
        let name = self.stage.name.as_str();
        let resolved = self.resolve(ctx)?;
        for warning in resolved.spec.validate()? {
            warn!(stage = name, field = %warning.field, "{}", warning.message);
        }
        self.check_session_covers_wait()?;

        // The artifact must exist before any call leaves the machine.
        let key = ArtifactKey::new(self.run_id, self.build_stage, &resolved.artifact);
        let bundle = tracked(self.tx, name, "fetch-artifact", async {
            let reference = self
                .orchestrator
                .artifacts
                .find(&key)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "artifact '{}' was not published in run {}",
                        resolved.artifact, self.run_id
                    ))
                })?;
            self.orchestrator.artifacts.get(&reference).await
        })
        .await?;

        let request = AssumeRoleRequest {
            role_arn: resolved.role.clone(),
            region: resolved.region.clone(),
            session_name: format!("shipit-{}", self.run_id.short()),
            duration: self.orchestrator.session_duration,
        };
        let credentials = tracked(self.tx, name, "assume-role", async {
            request
                .validate()
                .map_err(|e| Error::CredentialExchange(e.to_string()))?;
            system_log(self.tx, name, format!("Assuming role {}", ctx.mask(&request.role_arn))).await;
            self.orchestrator.credentials.assume_role(&request).await
        })
        .await?;

        let spec = &resolved.spec;
        let (deployer, handle) = tracked(self.tx, name, "submit", async {
            let deployer = self
                .orchestrator
                .deployers
                .connect(credentials, &resolved.region)
                .await?;
            system_log(
                self.tx,
                name,
                format!(
                    "Deploying {} to {}/{} as version {}",
                    resolved.artifact, spec.application, spec.environment, spec.version_label
                ),
            )
            .await;
            let handle = deployer.deploy(spec, bundle).await?;
            Ok((deployer, handle))
        })
        .await?;

        info!(
            stage = name,
            environment = %handle.environment,
            version_label = %handle.version_label,
            reused_version = handle.reused_version,
            "Deployment submitted"
        );
        emit(
            self.tx,
            PipelineEvent::DeploymentSubmitted {
                stage: name.to_string(),
                handle: handle.clone(),
            },
        )
        .await;

        if self.deploy.wait_for_deployment {
            let options = WaitOptions {
                timeout: self.deploy.timeout,
                poll_interval: self.deploy.poll_interval,
                ..WaitOptions::default()
            };
            let progress = self.tx.clone();
            let stage_name = name.to_string();
            tracked(self.tx, name, "wait", async {
                wait_for_deployment(deployer.as_ref(), &handle, &options, move |update| {
                    // Progress is best effort; a slow consumer must not stall polling.
                    let _ = progress.try_send(PipelineEvent::DeploymentProgress {
                        stage: stage_name.clone(),
                        update,
                    });
                })
                .await
                .map(|_| ())
            })
            .await?;
        } else {
            system_log(
                self.tx,
                name,
                "Not waiting for the platform to finish the deployment".to_string(),
            )
            .await;
        }

        Ok(handle)
    }

    /// The assumed-role credentials sign every poll, so they must outlive the wait.
    fn check_session_covers_wait(&self) -> Result<()> {
        if !self.deploy.wait_for_deployment {
            return Ok(());
        }
        let session = self.orchestrator.session_duration;
        let needed = self.deploy.timeout + SUBMIT_ALLOWANCE;
        if session < needed {
            return Err(Error::CredentialExchange(format!(
                "session duration of {}s cannot cover a {}s deployment wait; \
                 set SHIPIT_SESSION_DURATION_SECS to at least {} or lower timeout-secs",
                session.as_secs(),
                self.deploy.timeout.as_secs(),
                needed.as_secs()
            )));
        }
        Ok(())
    }

    fn resolve(&self, ctx: &VariableContext) -> Result<Resolved> {
        let field = |name: &str, value: &str| -> Result<String> {
            ctx.interpolate_strict(value).map_err(|missing| {
                Error::InvalidInput(format!(
                    "{} references unresolved variables: {}",
                    name,
                    missing.join(", ")
                ))
            })
        };

        let mut description = format!(
            "{} run {}: {}",
            self.pipeline_name,
            self.run_id.short(),
            ctx.resolve("git.message").unwrap_or_default()
        );
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            description = description.chars().take(MAX_DESCRIPTION_LEN).collect();
        }

        Ok(Resolved {
            artifact: field("artifact", &self.deploy.artifact)?,
            role: field("role", &self.deploy.role)?,
            region: field("region", &self.deploy.region)?,
            spec: DeploymentSpec {
                application: field("application", &self.deploy.application)?,
                environment: field("environment", &self.deploy.environment)?,
                version_label: field("version-label", &self.deploy.version_label)?,
                description: Some(description.trim_end().to_string()),
                use_existing_version_if_available: self.deploy.use_existing_version_if_available,
            },
        })
    }
}
