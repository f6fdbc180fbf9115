//! Pipeline orchestrator - executes pipeline stages in dependency order.

use shipit_config::VariableContext;
use shipit_config::system::DEFAULT_SESSION_DURATION;
use shipit_core::artifact::{ArtifactRef, ArtifactStore};
use shipit_core::credentials::CredentialProvider;
use shipit_core::deployer::{DeployerFactory, DeploymentHandle};
use shipit_core::executor::{Executor, LogLine};
use shipit_core::pipeline::{Pipeline, Stage, StageAction};
use shipit_core::{Error, RunId};
use shipit_deployer::WaitUpdate;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::build::BuildStage;
use crate::deploy::DeployStage;
use crate::step::emit;

/// State of a stage during execution.
#[derive(Debug, Clone)]
pub enum StageState {
    Pending,
    Succeeded,
    Failed {
        /// Failure class, e.g. `credential-exchange`.
        kind: &'static str,
        message: String,
    },
    Skipped { reason: String },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded | StageState::Failed { .. } | StageState::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageState::Succeeded)
    }
}

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { stage: String },
    StepStarted { stage: String, step: String },
    StageLog { stage: String, line: LogLine },
    StepCompleted { stage: String, step: String, success: bool },
    ArtifactPublished { stage: String, artifact: ArtifactRef },
    DeploymentSubmitted { stage: String, handle: DeploymentHandle },
    DeploymentProgress { stage: String, update: WaitUpdate },
    StageCompleted { stage: String, success: bool },
    PipelineCompleted { success: bool },
}

/// Which stages of a pipeline to run.
#[derive(Debug, Clone, Default)]
pub enum StageSelection {
    #[default]
    All,
    /// Only the named stages. Unselected dependencies are assumed to have
    /// run in an earlier invocation with the same run id.
    Only(Vec<String>),
}

impl StageSelection {
    fn includes(&self, stage: &str) -> bool {
        match self {
            StageSelection::All => true,
            StageSelection::Only(names) => names.iter().any(|n| n == stage),
        }
    }
}

/// Result of a pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub success: bool,
    pub stage_states: HashMap<String, StageState>,
    pub artifacts: Vec<ArtifactRef>,
    pub deployment: Option<DeploymentHandle>,
}

/// Orchestrates the execution of a pipeline.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) deployers: Arc<dyn DeployerFactory>,
    /// Directory the build runs in and archives.
    pub(crate) workspace: PathBuf,
    pub(crate) keep_artifacts: bool,
    pub(crate) session_duration: Duration,
}

impl PipelineOrchestrator {
    pub fn new(
        executor: Arc<dyn Executor>,
        artifacts: Arc<dyn ArtifactStore>,
        credentials: Arc<dyn CredentialProvider>,
        deployers: Arc<dyn DeployerFactory>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            executor,
            artifacts,
            credentials,
            deployers,
            workspace,
            keep_artifacts: false,
            session_duration: DEFAULT_SESSION_DURATION,
        }
    }

    /// Keep the run's artifacts in the store after the run instead of purging them.
    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    pub fn session_duration(mut self, duration: Duration) -> Self {
        self.session_duration = duration;
        self
    }

    /// Execute a pipeline, returning a channel of events and a handle to get the final result.
    ///
    /// Variables like `${git.sha}`, `${secrets.NAME}` and `${env.VAR}` in
    /// commands and deploy settings are resolved from `var_ctx`; secret
    /// values are masked in streamed output.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        run_id: RunId,
        selection: StageSelection,
        var_ctx: VariableContext,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let this = self.clone();
        let pipeline = pipeline.clone();

        let handle = tokio::spawn(async move {
            this.execute_inner(pipeline, run_id, selection, var_ctx, tx)
                .await
        });

        (rx, handle)
    }

    async fn execute_inner(
        self,
        pipeline: Pipeline,
        run_id: RunId,
        selection: StageSelection,
        mut var_ctx: VariableContext,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let mut stage_states: HashMap<String, StageState> = pipeline
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageState::Pending))
            .collect();
        let mut artifacts = Vec::new();
        let mut deployment = None;

        var_ctx.pipeline.name = pipeline.name.clone();
        var_ctx.run.id = run_id.to_string();

        info!(pipeline = %pipeline.name, run_id = %run_id, "Starting pipeline run");

        // Build execution order using topological sort
        let execution_order = Self::topological_sort(&pipeline.stages);

        for (stage_idx, stage_name) in execution_order.iter().enumerate() {
            let Some(stage) = pipeline.stage(stage_name) else {
                continue;
            };

            if !selection.includes(&stage.name) {
                stage_states.insert(
                    stage.name.clone(),
                    StageState::Skipped {
                        reason: "not selected".to_string(),
                    },
                );
                continue;
            }

            // Update stage context for variable interpolation
            var_ctx.stage.name = stage.name.clone();
            var_ctx.stage.index = stage_idx;

            let failed_deps: Vec<&String> = stage
                .needs
                .iter()
                .filter(|dep| {
                    selection.includes(dep)
                        && !stage_states
                            .get(*dep)
                            .map(|s| s.is_success())
                            .unwrap_or(false)
                })
                .collect();

            if !failed_deps.is_empty() {
                info!(stage = %stage.name, ?failed_deps, "Skipping stage due to failed dependencies");
                stage_states.insert(
                    stage.name.clone(),
                    StageState::Skipped {
                        reason: format!("Dependencies failed: {:?}", failed_deps),
                    },
                );
                continue;
            }

            emit(
                &tx,
                PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                },
            )
            .await;

            let outcome = match &stage.action {
                StageAction::Build(build) => {
                    let mut env = var_ctx.interpolate_map(&pipeline.env);
                    env.extend(var_ctx.interpolate_map(&stage.env));
                    BuildStage {
                        orchestrator: &self,
                        tx: &tx,
                        run_id,
                        stage,
                        build,
                        env,
                    }
                    .run(&mut var_ctx)
                    .await
                    .map(|artifact| artifacts.push(artifact))
                }
                StageAction::Deploy(deploy) => {
                    let build_stage = Self::artifact_stage(&pipeline, stage);
                    DeployStage {
                        orchestrator: &self,
                        tx: &tx,
                        run_id,
                        pipeline_name: &pipeline.name,
                        stage,
                        deploy,
                        build_stage: &build_stage,
                    }
                    .run(&var_ctx)
                    .await
                    .map(|handle| deployment = Some(handle))
                }
            };

            match outcome {
                Ok(()) => {
                    info!(stage = %stage.name, "Stage completed successfully");
                    stage_states.insert(stage.name.clone(), StageState::Succeeded);
                    emit(
                        &tx,
                        PipelineEvent::StageCompleted {
                            stage: stage.name.clone(),
                            success: true,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "Stage failed");
                    stage_states.insert(
                        stage.name.clone(),
                        StageState::Failed {
                            kind: failure_kind(&e),
                            message: var_ctx.mask(&e.to_string()),
                        },
                    );
                    emit(
                        &tx,
                        PipelineEvent::StageCompleted {
                            stage: stage.name.clone(),
                            success: false,
                        },
                    )
                    .await;
                }
            }
        }

        let success = stage_states
            .values()
            .all(|s| s.is_success() || matches!(s, StageState::Skipped { reason } if reason == "not selected"));

        if !self.keep_artifacts {
            match self.artifacts.purge_run(&run_id).await {
                Ok(stats) if stats.artifacts_deleted > 0 => {
                    info!(run_id = %run_id, artifacts = stats.artifacts_deleted, "Discarded run artifacts");
                }
                Ok(_) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Failed to discard run artifacts"),
            }
        }

        emit(&tx, PipelineEvent::PipelineCompleted { success }).await;

        PipelineResult {
            run_id,
            success,
            stage_states,
            artifacts,
            deployment,
        }
    }

    /// Name of the build stage a deploy stage takes its artifact from.
    fn artifact_stage(pipeline: &Pipeline, stage: &Stage) -> String {
        stage
            .needs
            .iter()
            .find(|dep| {
                pipeline
                    .stage(dep)
                    .is_some_and(|s| matches!(s.action, StageAction::Build(_)))
            })
            .cloned()
            .or_else(|| pipeline.build_stage().map(|(s, _)| s.name.clone()))
            .unwrap_or_default()
    }

    /// Topological sort of stages based on dependencies.
    fn topological_sort(stages: &[Stage]) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashMap::new();
        let stage_map: HashMap<&str, &Stage> =
            stages.iter().map(|s| (s.name.as_str(), s)).collect();

        for stage in stages {
            Self::topo_visit(&stage.name, &stage_map, &mut visited, &mut result);
        }

        result
    }

    fn topo_visit(
        name: &str,
        stage_map: &HashMap<&str, &Stage>,
        visited: &mut HashMap<String, bool>,
        result: &mut Vec<String>,
    ) {
        if visited.get(name).copied().unwrap_or(false) {
            return;
        }

        visited.insert(name.to_string(), true);

        if let Some(stage) = stage_map.get(name) {
            for dep in &stage.needs {
                Self::topo_visit(dep, stage_map, visited, result);
            }
        }

        result.push(name.to_string());
    }
}

fn failure_kind(error: &Error) -> &'static str {
    match error {
        Error::DependencyResolution(_) => "dependency-resolution",
        Error::Archive(_) => "archive",
        Error::CredentialExchange(_) => "credential-exchange",
        Error::DeploymentRejected(_) | Error::Conflict(_) => "deployment-rejected",
        Error::DeploymentFailed(_) => "deployment-failed",
        Error::Timeout(_) => "timeout",
        Error::RuntimeMismatch(_) => "runtime-mismatch",
        Error::Cancelled => "cancelled",
        Error::InvalidInput(_) => "invalid-input",
        Error::NotFound(_) => "not-found",
        _ => "internal",
    }
}
