//! Pipeline configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use shipit_core::pipeline::{
    ArchiveSpec, BuildSpec, CheckoutSpec, DEFAULT_DEPLOY_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DeploySpec, Pipeline, RuntimeSpec, Stage, StageAction, Trigger,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// File looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "shipit.kdl";

/// Version label used when a deploy stage does not set one.
pub const DEFAULT_VERSION_LABEL: &str = "${git.sha}";

/// Read and parse a pipeline file.
pub fn load_pipeline(path: &Path) -> ConfigResult<Pipeline> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pipeline(&content)
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut triggers = Vec::new();
    let mut stages = Vec::new();
    let mut env = HashMap::new();
    let mut runtime_env = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "build" => {
                stages.push(parse_build_stage(node)?);
            }
            "deploy" => {
                stages.push(parse_deploy_stage(node)?);
            }
            "env" => {
                env.extend(parse_env_block(node));
            }
            "runtime-env" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "require" {
                            runtime_env.extend(get_all_string_args(child));
                        }
                    }
                }
            }
            other => debug!(node = other, "Ignoring unknown node"),
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    validate_stages(&mut stages)?;

    Ok(Pipeline {
        name,
        triggers,
        stages,
        env,
        runtime_env,
    })
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "push" => {
            let branches = get_string_list_prop(node, "branches");
            Ok(Trigger::Push {
                branches: if branches.is_empty() {
                    vec!["*".to_string()]
                } else {
                    branches
                },
            })
        }
        "manual" | "" => Ok(Trigger::Manual),
        _ => Err(ConfigError::invalid(
            "trigger type",
            format!("unknown trigger type: {}", trigger_type),
        )),
    }
}

fn parse_build_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node).unwrap_or_else(|| "build".to_string());
    let needs = get_string_list_prop(node, "needs");
    let stage_err = |message: String| ConfigError::Stage {
        stage: name.clone(),
        message,
    };

    let mut checkout = CheckoutSpec::default();
    let mut runtime = None;
    let mut manifest = None;
    let mut upgrade = Vec::new();
    let mut install = Vec::new();
    let mut archive = ArchiveSpec::default();
    let mut artifact = None;
    let mut step_timeout = None;
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "checkout" => {
                    checkout.enabled = get_bool_prop(child, "enabled").unwrap_or(true);
                    checkout.repository = get_string_prop(child, "repository");
                    checkout.reference = get_string_prop(child, "ref");
                }
                "runtime" => {
                    let family = get_first_string_arg(child)
                        .ok_or_else(|| stage_err("runtime needs a name".to_string()))?;
                    let version = get_string_prop(child, "version")
                        .ok_or_else(|| stage_err(format!("runtime '{}' needs a version", family)))?;
                    let mut spec = RuntimeSpec::new(family, version);
                    if let Some(binary) = get_string_prop(child, "binary") {
                        spec.binary = binary;
                    }
                    runtime = Some(spec);
                }
                "manifest" => {
                    manifest = get_first_string_arg(child);
                }
                "upgrade" => {
                    upgrade.extend(get_first_string_arg(child));
                }
                "install" => {
                    install.extend(get_first_string_arg(child));
                }
                "archive" => {
                    if let Some(file_name) = get_first_string_arg(child) {
                        archive.file_name = file_name;
                    }
                    let excludes = child
                        .children()
                        .map(|c| {
                            c.nodes()
                                .iter()
                                .filter(|n| n.name().value() == "exclude")
                                .flat_map(get_all_string_args)
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    if !excludes.is_empty() {
                        archive.excludes = excludes;
                    }
                }
                "artifact" => {
                    artifact = get_first_string_arg(child);
                }
                "timeout-secs" => {
                    step_timeout = Some(get_duration_arg(child, "timeout-secs")?);
                }
                "env" => {
                    env.extend(parse_env_block(child));
                }
                other => debug!(stage = %name, node = other, "Ignoring unknown build setting"),
            }
        }
    }

    let runtime = runtime.ok_or_else(|| stage_err("missing runtime".to_string()))?;

    let manifest = manifest
        .or_else(|| runtime.default_manifest().map(String::from))
        .ok_or_else(|| {
            stage_err(format!(
                "runtime '{}' has no default manifest; declare `manifest`",
                runtime.name
            ))
        })?;

    if upgrade.is_empty() {
        upgrade.push(runtime.default_upgrade().ok_or_else(|| {
            stage_err(format!(
                "runtime '{}' has no default upgrade command; declare `upgrade`",
                runtime.name
            ))
        })?);
    }

    if install.is_empty() {
        install.push(runtime.default_install(&manifest).ok_or_else(|| {
            stage_err(format!(
                "runtime '{}' has no default install command; declare `install`",
                runtime.name
            ))
        })?);
    }

    if archive.file_name.is_empty() || archive.file_name.contains(['/', '\\']) {
        return Err(stage_err(format!(
            "archive name '{}' must be a plain file name",
            archive.file_name
        )));
    }

    let artifact = artifact.unwrap_or_else(|| archive.file_name.clone());

    Ok(Stage {
        name,
        needs,
        action: StageAction::Build(BuildSpec {
            checkout,
            runtime,
            manifest,
            upgrade,
            install,
            archive,
            artifact,
            step_timeout,
        }),
        env,
    })
}

fn parse_deploy_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node).unwrap_or_else(|| "deploy".to_string());
    let needs = get_string_list_prop(node, "needs");

    let mut settings: HashMap<&str, String> = HashMap::new();
    let mut use_existing = false;
    let mut wait = true;
    let mut timeout = DEFAULT_DEPLOY_TIMEOUT;
    let mut poll_interval = DEFAULT_POLL_INTERVAL;
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value();
            match key {
                "artifact" | "role" | "region" | "application" | "environment"
                | "version-label" => {
                    let value = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::invalid(key, "expected a string"))?;
                    settings.insert(key, value);
                }
                "use-existing-version-if-available" => {
                    use_existing = get_first_bool_arg(child).unwrap_or(true);
                }
                "wait-for-deployment" => {
                    wait = get_first_bool_arg(child).unwrap_or(true);
                }
                "timeout-secs" => {
                    timeout = get_duration_arg(child, key)?;
                }
                "poll-interval-secs" => {
                    poll_interval = get_duration_arg(child, key)?;
                }
                "env" => {
                    env.extend(parse_env_block(child));
                }
                other => debug!(stage = %name, node = other, "Ignoring unknown deploy setting"),
            }
        }
    }

    let mut required = |field: &str| {
        settings.remove(field).ok_or_else(|| ConfigError::Stage {
            stage: name.clone(),
            message: format!("missing `{}`", field),
        })
    };

    let role = required("role")?;
    let region = required("region")?;
    let application = required("application")?;
    let environment = required("environment")?;
    let artifact = settings.remove("artifact").unwrap_or_default();
    let version_label = settings
        .remove("version-label")
        .unwrap_or_else(|| DEFAULT_VERSION_LABEL.to_string());

    if poll_interval.is_zero() || poll_interval > timeout {
        return Err(ConfigError::invalid(
            "poll-interval-secs",
            "must be positive and no longer than timeout-secs",
        ));
    }

    Ok(Stage {
        name,
        needs,
        action: StageAction::Deploy(Box::new(DeploySpec {
            artifact,
            role,
            region,
            application,
            environment,
            version_label,
            use_existing_version_if_available: use_existing,
            wait_for_deployment: wait,
            timeout,
            poll_interval,
        })),
        env,
    })
}

fn parse_env_block(node: &KdlNode) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

/// Structural checks: unique names, known dependencies, no cycles, one build
/// stage, at most one deploy stage that depends on it and consumes its artifact.
fn validate_stages(stages: &mut [Stage]) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for stage in stages.iter() {
        if !seen.insert(stage.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
        }
    }

    for stage in stages.iter() {
        for dep in &stage.needs {
            if !seen.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.name, dep
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(stages) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    let builds: Vec<usize> = stage_indices(stages, |a| matches!(a, StageAction::Build(_)));
    let deploys: Vec<usize> = stage_indices(stages, |a| matches!(a, StageAction::Deploy(_)));

    let build_idx = match builds.as_slice() {
        [] => return Err(ConfigError::MissingField("build stage".to_string())),
        [idx] => *idx,
        _ => return Err(ConfigError::Duplicate("build stage".to_string())),
    };
    if deploys.len() > 1 {
        return Err(ConfigError::Duplicate("deploy stage".to_string()));
    }

    let (build_name, build_artifact) = match &stages[build_idx].action {
        StageAction::Build(build) => (stages[build_idx].name.clone(), build.artifact.clone()),
        StageAction::Deploy(_) => unreachable!("index came from a build stage"),
    };

    if let Some(&deploy_idx) = deploys.first() {
        let stage = &mut stages[deploy_idx];
        if !stage.needs.contains(&build_name) {
            return Err(ConfigError::InvalidReference(format!(
                "deploy stage '{}' must list build stage '{}' in needs",
                stage.name, build_name
            )));
        }
        if let StageAction::Deploy(deploy) = &mut stage.action {
            if deploy.artifact.is_empty() {
                deploy.artifact = build_artifact;
            } else if deploy.artifact != build_artifact {
                return Err(ConfigError::InvalidReference(format!(
                    "deploy stage '{}' consumes artifact '{}' but build stage '{}' publishes '{}'",
                    stage.name, deploy.artifact, build_name, build_artifact
                )));
            }
        }
    }

    Ok(())
}

fn stage_indices(stages: &[Stage], pred: impl Fn(&StageAction) -> bool) -> Vec<usize> {
    stages
        .iter()
        .enumerate()
        .filter(|(_, s)| pred(&s.action))
        .map(|(i, _)| i)
        .collect()
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let secs = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::invalid(field, "expected a whole number of seconds"))?;
    let secs = u64::try_from(secs)
        .map_err(|_| ConfigError::invalid(field, format!("{} is out of range", secs)))?;
    Ok(Duration::from_secs(secs))
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties: needs="a" needs="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: { needs "a" "b" }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

/// Detect cycles in the stage dependency graph using DFS.
fn detect_cycle(stages: &[Stage]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let stage_map: HashMap<&str, &Stage> = stages.iter().map(|s| (s.name.as_str(), s)).collect();

    for stage in stages {
        if !visited.contains_key(stage.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&stage.name, &stage_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    stage_map: &'a HashMap<&'a str, &'a Stage>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(stage) = stage_map.get(node) {
        for dep in &stage.needs {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, stage_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
