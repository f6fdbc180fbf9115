//! Local pipeline execution commands.

use anyhow::{Context, Result, bail};
use shipit_config::VariableContext;
use shipit_core::RunId;
use shipit_core::artifact::ArtifactStore;
use shipit_core::deployer::DeploymentStatus;
use shipit_core::executor::LogStream;
use shipit_core::pipeline::{Pipeline, TriggerEvent};
use shipit_deployer::WaitUpdate;
use shipit_scheduler::{PipelineEvent, PipelineResult, StageSelection, StageState};
use tracing::{info, warn};

use super::{Runner, Target, run_id, variable_context};

pub struct RunOptions {
    pub event: Option<String>,
    pub branch: Option<String>,
    pub sha: Option<String>,
    pub force: bool,
    pub keep_artifacts: bool,
    pub secrets: Vec<String>,
}

/// Run the whole pipeline for the current trigger event.
pub async fn run(target: &Target, options: RunOptions) -> Result<bool> {
    let pipeline = target.load()?;
    let mut ctx = variable_context(
        target,
        options.sha,
        options.branch,
        &options.secrets,
    )
    .await?;

    let event = trigger_event(options.event.as_deref(), &ctx.git.branch, |key| {
        std::env::var(key).ok()
    })?;
    if !should_run(&pipeline, &event) {
        if !options.force {
            println!(
                "No trigger of pipeline '{}' matches {}; nothing to do (use --force to run anyway)",
                pipeline.name,
                describe(&event)
            );
            return Ok(true);
        }
        warn!(event = %describe(&event), "No trigger matches, running because of --force");
    }
    ctx.run.trigger = describe(&event);

    let runner = Runner::new(target, options.keep_artifacts)?;
    execute(&runner, &pipeline, RunId::new(), StageSelection::All, ctx).await
}

/// Run only the build stage and keep its artifact for a later `shipit deploy`.
pub async fn build(target: &Target, sha: Option<String>, secrets: Vec<String>) -> Result<bool> {
    let pipeline = target.load()?;
    let Some((stage, _)) = pipeline.build_stage() else {
        bail!("Pipeline '{}' has no build stage", pipeline.name);
    };
    let selection = StageSelection::Only(vec![stage.name.clone()]);

    let mut ctx = variable_context(target, sha, None, &secrets).await?;
    ctx.run.trigger = "manual".to_string();

    let runner = Runner::new(target, true)?;
    let run_id = RunId::new();
    let success = execute(&runner, &pipeline, run_id, selection, ctx).await?;
    if success {
        println!("\nRun id: {}", run_id);
        println!("Deploy it with: shipit deploy --run-id {}", run_id);
    }
    Ok(success)
}

/// Deploy the artifact a previous `shipit build` published.
pub async fn deploy(
    target: &Target,
    raw_run_id: &str,
    sha: Option<String>,
    keep_artifacts: bool,
    secrets: Vec<String>,
) -> Result<bool> {
    let pipeline = target.load()?;
    let Some((stage, _)) = pipeline.deploy_stage() else {
        bail!("Pipeline '{}' has no deploy stage", pipeline.name);
    };
    let selection = StageSelection::Only(vec![stage.name.clone()]);
    let run_id = run_id(raw_run_id)?;

    let mut ctx = variable_context(target, sha, None, &secrets).await?;
    ctx.run.trigger = "manual".to_string();

    let runner = Runner::new(target, keep_artifacts)?;
    execute(&runner, &pipeline, run_id, selection, ctx).await
}

/// Which event started this invocation.
fn trigger_event(
    explicit: Option<&str>,
    branch: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TriggerEvent> {
    let name = explicit
        .map(str::to_string)
        .or_else(|| lookup("GITHUB_EVENT_NAME"));
    match name.as_deref() {
        Some("manual") | Some("workflow_dispatch") => Ok(TriggerEvent::Manual),
        Some("push") | None => {
            if branch.is_empty() {
                bail!("Cannot tell which branch was pushed; pass --branch");
            }
            Ok(TriggerEvent::Push {
                branch: branch.to_string(),
            })
        }
        Some(other) => bail!("Unsupported trigger event '{}'", other),
    }
}

/// A pipeline without triggers only runs when started by hand.
fn should_run(pipeline: &Pipeline, event: &TriggerEvent) -> bool {
    if pipeline.triggers.is_empty() {
        *event == TriggerEvent::Manual
    } else {
        pipeline.is_triggered_by(event)
    }
}

fn describe(event: &TriggerEvent) -> String {
    match event {
        TriggerEvent::Push { branch } => format!("push to {}", branch),
        TriggerEvent::Manual => "manual".to_string(),
    }
}

async fn execute(
    runner: &Runner,
    pipeline: &Pipeline,
    run_id: RunId,
    selection: StageSelection,
    ctx: VariableContext,
) -> Result<bool> {
    println!("Running pipeline: {} (run {})", pipeline.name, run_id);
    if !ctx.git.sha.is_empty() {
        println!("Commit: {} on {}", ctx.git.sha, ctx.git.branch);
    }
    println!("\n--- Starting pipeline execution ---\n");

    let (mut rx, result_handle) = runner
        .orchestrator
        .execute(pipeline, run_id, selection, ctx);

    let printer = async {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    };

    tokio::select! {
        _ = printer => {}
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            result_handle.abort();
            if !runner.keep_artifacts {
                if let Err(e) = runner.store.purge_run(&run_id).await {
                    warn!(run_id = %run_id, error = %e, "Failed to discard run artifacts");
                }
            }
            println!("\n--- Pipeline cancelled ---");
            return Ok(false);
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;
    print_summary(&result);
    info!(run_id = %run_id, success = result.success, "Pipeline run finished");
    Ok(result.success)
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::StepStarted { stage, step } => {
            println!("  [{}] → {}", stage, step);
        }
        PipelineEvent::StageLog { stage, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", stage, stream_marker, line.content);
        }
        PipelineEvent::StepCompleted {
            stage,
            step,
            success,
        } => {
            if !success {
                println!("  [{}] ✗ {} failed", stage, step);
            }
        }
        PipelineEvent::ArtifactPublished { stage, artifact } => {
            println!(
                "  [{}] artifact {} ({} bytes)",
                stage, artifact.key.name, artifact.size
            );
        }
        PipelineEvent::DeploymentSubmitted { stage, handle } => {
            let version = if handle.reused_version {
                "existing version"
            } else {
                "new version"
            };
            println!(
                "  [{}] submitted {} {} to {}/{}",
                stage, version, handle.version_label, handle.application, handle.environment
            );
        }
        PipelineEvent::DeploymentProgress { stage, update } => match update {
            WaitUpdate::State(state) => {
                let status = match &state.status {
                    DeploymentStatus::InProgress { detail } => detail.clone(),
                    DeploymentStatus::Ready => "Ready".to_string(),
                    DeploymentStatus::Terminated => "Terminated".to_string(),
                };
                println!(
                    "  [{}] environment {} running {} (health {:?})",
                    stage,
                    status,
                    state.active_version.as_deref().unwrap_or("-"),
                    state.health
                );
            }
            WaitUpdate::Event(event) => {
                println!("  [{}] {:?}: {}", stage, event.severity, event.message);
            }
        },
        PipelineEvent::StageCompleted { stage, success } => {
            if success {
                println!("✓ Stage '{}' completed successfully\n", stage);
            } else {
                println!("✗ Stage '{}' failed\n", stage);
            }
        }
        PipelineEvent::PipelineCompleted { success } => {
            if success {
                println!("--- Pipeline completed successfully ---");
            } else {
                println!("--- Pipeline failed ---");
            }
        }
    }
}

fn print_summary(result: &PipelineResult) {
    println!("\n--- Stage Summary ---");
    let mut stages: Vec<_> = result.stage_states.iter().collect();
    stages.sort_by(|a, b| a.0.cmp(b.0));
    for (stage_name, state) in stages {
        let status = match state {
            StageState::Succeeded => "✓ succeeded".to_string(),
            StageState::Failed { kind, message } => format!("✗ failed ({}): {}", kind, message),
            StageState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageState::Pending => "○ pending".to_string(),
        };
        println!("  {} - {}", stage_name, status);
    }

    if let Some(deployment) = &result.deployment {
        println!(
            "\nDeployed {} to {}/{}",
            deployment.version_label, deployment.application, deployment.environment
        );
    }

    if result.success {
        println!("\n✓ Pipeline succeeded!");
    }
}
