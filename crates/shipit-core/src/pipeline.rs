//! Pipeline and stage definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default wait for the platform to report the new version live.
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default delay between environment status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Default archive file name.
pub const DEFAULT_ARCHIVE_NAME: &str = "main.zip";
/// Excluded from every archive unless overridden.
pub const DEFAULT_ARCHIVE_EXCLUDE: &str = "*.git*";

/// A build-and-deploy pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (e.g., "livekit-poc").
    pub name: String,
    /// Triggers that can start this pipeline.
    pub triggers: Vec<Trigger>,
    /// Pipeline stages.
    pub stages: Vec<Stage>,
    /// Global environment variables for build commands.
    pub env: HashMap<String, String>,
    /// Variables the deployed application expects at runtime.
    /// Declared for operators; the pipeline never sources them.
    pub runtime_env: Vec<String>,
}

impl Pipeline {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The pipeline's build stage, if any.
    pub fn build_stage(&self) -> Option<(&Stage, &BuildSpec)> {
        self.stages.iter().find_map(|s| match &s.action {
            StageAction::Build(build) => Some((s, build)),
            StageAction::Deploy(_) => None,
        })
    }

    /// The pipeline's deploy stage, if any.
    pub fn deploy_stage(&self) -> Option<(&Stage, &DeploySpec)> {
        self.stages.iter().find_map(|s| match &s.action {
            StageAction::Deploy(deploy) => Some((s, deploy.as_ref())),
            StageAction::Build(_) => None,
        })
    }

    /// True if any trigger accepts `event`.
    pub fn is_triggered_by(&self, event: &TriggerEvent) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }
}

/// What triggers a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Trigger {
    /// Triggered on push to branches matching any of the glob patterns.
    Push { branches: Vec<String> },
    /// Manual trigger only.
    Manual,
}

/// An event that may start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    Push { branch: String },
    Manual,
}

impl Trigger {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match (self, event) {
            (Trigger::Push { branches }, TriggerEvent::Push { branch }) => {
                branches.iter().any(|pattern| {
                    glob::Pattern::new(pattern)
                        .map(|p| p.matches(branch))
                        .unwrap_or(pattern == branch)
                })
            }
            (Trigger::Manual, TriggerEvent::Manual) => true,
            _ => false,
        }
    }
}

/// A stage in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name.
    pub name: String,
    /// Dependencies (other stage names).
    pub needs: Vec<String>,
    /// What this stage does.
    pub action: StageAction,
    /// Stage-specific environment variables.
    pub env: HashMap<String, String>,
}

/// What a stage does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageAction {
    /// Check out, install dependencies, archive and publish.
    Build(BuildSpec),
    /// Assume a role and submit the published archive to the hosting platform.
    Deploy(Box<DeploySpec>),
}

/// Build stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    pub checkout: CheckoutSpec,
    pub runtime: RuntimeSpec,
    /// Dependency manifest, relative to the workspace.
    pub manifest: String,
    /// Commands that install or upgrade the package manager.
    pub upgrade: Vec<String>,
    /// Commands that install the manifest's dependencies.
    pub install: Vec<String>,
    pub archive: ArchiveSpec,
    /// Fixed name the archive is published under.
    pub artifact: String,
    /// Per-command time limit.
    pub step_timeout: Option<Duration>,
}

/// How the repository is checked out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSpec {
    pub enabled: bool,
    /// Clone from this URL instead of using the workspace in place.
    pub repository: Option<String>,
    /// Ref to check out after cloning (defaults to the triggering commit).
    pub reference: Option<String>,
}

impl Default for CheckoutSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            repository: None,
            reference: None,
        }
    }
}

/// Pinned language runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Runtime family ("python", "node", ...).
    pub name: String,
    /// Version prefix the runtime must report (e.g. "3.11").
    pub version: String,
    /// Executable used for the version check and default commands.
    pub binary: String,
}

impl RuntimeSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        let binary = match name.as_str() {
            "python" => "python3".to_string(),
            other => other.to_string(),
        };
        Self {
            name,
            version: version.into(),
            binary,
        }
    }

    /// Command printing the runtime version.
    pub fn version_command(&self) -> String {
        format!("{} --version", self.binary)
    }

    /// True if `output` of the version command reports the pinned version.
    pub fn reports_version(&self, output: &str) -> bool {
        output.split_whitespace().any(|word| {
            let word = word.trim_start_matches('v');
            word == self.version
                || word
                    .strip_prefix(self.version.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Default manifest for this runtime family.
    pub fn default_manifest(&self) -> Option<&'static str> {
        match self.name.as_str() {
            "python" => Some("requirements.txt"),
            "node" => Some("package.json"),
            _ => None,
        }
    }

    /// Default package manager upgrade command.
    pub fn default_upgrade(&self) -> Option<String> {
        match self.name.as_str() {
            "python" => Some(format!("{} -m pip install --upgrade pip", self.binary)),
            "node" => Some("npm install -g npm@latest".to_string()),
            _ => None,
        }
    }

    /// Default dependency install command for `manifest`.
    pub fn default_install(&self, manifest: &str) -> Option<String> {
        match self.name.as_str() {
            "python" => Some(format!("{} -m pip install -r {}", self.binary, manifest)),
            "node" => Some("npm ci".to_string()),
            _ => None,
        }
    }
}

/// Archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSpec {
    /// Archive file name.
    pub file_name: String,
    /// Glob patterns (relative paths) left out of the archive.
    pub excludes: Vec<String>,
}

impl Default for ArchiveSpec {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_ARCHIVE_NAME.to_string(),
            excludes: vec![DEFAULT_ARCHIVE_EXCLUDE.to_string()],
        }
    }
}

/// Deploy stage configuration. String fields support variable interpolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Name of the artifact published by the build stage.
    pub artifact: String,
    /// Role to assume for platform access.
    pub role: String,
    pub region: String,
    pub application: String,
    pub environment: String,
    pub version_label: String,
    pub use_existing_version_if_available: bool,
    pub wait_for_deployment: bool,
    /// Upper bound on waiting for the platform to confirm.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_trigger_matches_branch() {
        let trigger = Trigger::Push {
            branches: vec!["main".to_string(), "release/*".to_string()],
        };
        let push = |b: &str| TriggerEvent::Push {
            branch: b.to_string(),
        };
        assert!(trigger.matches(&push("main")));
        assert!(trigger.matches(&push("release/1.2")));
        assert!(!trigger.matches(&push("feature/x")));
        assert!(!trigger.matches(&TriggerEvent::Manual));
    }

    #[test]
    fn test_runtime_version_check() {
        let python = RuntimeSpec::new("python", "3.11");
        assert_eq!(python.version_command(), "python3 --version");
        assert!(python.reports_version("Python 3.11.4"));
        assert!(python.reports_version("Python 3.11"));
        assert!(!python.reports_version("Python 3.1.2"));
        assert!(!python.reports_version("Python 3.12.0"));

        let node = RuntimeSpec::new("node", "20");
        assert!(node.reports_version("v20.11.1"));
        assert!(!node.reports_version("v18.19.0"));
    }

    #[test]
    fn test_python_defaults() {
        let python = RuntimeSpec::new("python", "3.11");
        assert_eq!(python.default_manifest(), Some("requirements.txt"));
        assert_eq!(
            python.default_install("requirements.txt").unwrap(),
            "python3 -m pip install -r requirements.txt"
        );
        assert!(RuntimeSpec::new("ruby", "3").default_upgrade().is_none());
    }

    #[test]
    fn test_stage_accessors() {
        let deploy = DeploySpec {
            artifact: "main.zip".to_string(),
            role: "arn:aws:iam::123456789012:role/deploy".to_string(),
            region: "us-east-1".to_string(),
            application: "LiveKitPOC".to_string(),
            environment: "LiveKitPOC-dev".to_string(),
            version_label: "${git.sha}".to_string(),
            use_existing_version_if_available: true,
            wait_for_deployment: true,
            timeout: DEFAULT_DEPLOY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        let pipeline = Pipeline {
            name: "p".to_string(),
            triggers: vec![],
            stages: vec![Stage {
                name: "deploy".to_string(),
                needs: vec![],
                action: StageAction::Deploy(Box::new(deploy)),
                env: HashMap::new(),
            }],
            env: HashMap::new(),
            runtime_env: vec![],
        };

        let (stage, spec) = pipeline.deploy_stage().unwrap();
        assert_eq!(stage.name, "deploy");
        assert_eq!(spec.environment, "LiveKitPOC-dev");
        assert!(pipeline.build_stage().is_none());
    }

    #[test]
    fn test_pipeline_serializes() {
        let pipeline = Pipeline {
            name: "p".to_string(),
            triggers: vec![Trigger::Manual],
            stages: vec![],
            env: HashMap::new(),
            runtime_env: vec!["LIVEKIT_URL".to_string()],
        };
        let json = serde_json::to_string(&pipeline).unwrap();
        assert!(json.contains("LIVEKIT_URL"));
    }
}
