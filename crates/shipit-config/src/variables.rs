//! Variable interpolation for pipeline configurations.
//!
//! Supports variables like:
//! - `${git.sha}` - Full commit SHA (the default version label)
//! - `${git.short_sha}` - First 7 characters of the SHA
//! - `${git.branch}` - Branch that was pushed
//! - `${git.message}` - Commit message (first line)
//! - `${git.author}` - Commit author name
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${run.trigger}` - Trigger event name
//! - `${stage.name}` - Current stage name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${secrets.SECRET_NAME}` - Secret value (masked in logs)
//! - `${timestamp}`, `${date}`, `${datetime}` - Current time

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Environment prefix for secrets passed to the pipeline.
pub const SECRET_ENV_PREFIX: &str = "SHIPIT_SECRET_";

/// Replacement text for secret values in log output.
pub const MASK: &str = "***";

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline: PipelineContext,
    pub run: RunContext,
    pub stage: StageContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Secrets (masked in logs)
    pub secrets: HashMap<String, String>,
    /// Custom variables
    pub custom: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub message: String,
    pub author: String,
}

impl GitContext {
    fn set_sha(&mut self, sha: String) {
        self.short_sha = sha.chars().take(7).collect();
        self.sha = sha;
    }
}

/// Pipeline context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
}

/// Run context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub trigger: String,
}

/// Stage context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate git context from CI environment variables.
    ///
    /// Only fields that are still empty are filled, so explicit values win.
    pub fn populate_git_from_env(&mut self) {
        self.populate_git_with(|key| std::env::var(key).ok());
    }

    fn populate_git_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k).filter(|v| !v.is_empty()));

        if self.git.sha.is_empty() {
            if let Some(sha) = first(&["SHIPIT_COMMIT_SHA", "GITHUB_SHA", "CI_COMMIT_SHA"]) {
                self.git.set_sha(sha);
            }
        }
        if self.git.branch.is_empty() {
            if let Some(branch) = first(&["SHIPIT_BRANCH", "GITHUB_REF_NAME", "CI_COMMIT_BRANCH"]) {
                self.git.branch = branch;
            }
        }
        if self.git.message.is_empty() {
            if let Some(message) = first(&["SHIPIT_COMMIT_MESSAGE", "CI_COMMIT_MESSAGE"]) {
                self.git.message = message.lines().next().unwrap_or_default().to_string();
            }
        }
        if self.git.author.is_empty() {
            if let Some(author) = first(&["SHIPIT_COMMIT_AUTHOR", "GITHUB_ACTOR", "CI_COMMIT_AUTHOR"]) {
                self.git.author = author;
            }
        }
    }

    /// Populate missing git fields by running git in a repository.
    pub fn populate_git_from_repo(&mut self, repo_path: &std::path::Path) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|s| !s.is_empty())
        };

        if self.git.sha.is_empty() {
            if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
                self.git.set_sha(sha);
            }
        }

        if self.git.branch.is_empty() {
            if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
                if branch != "HEAD" {
                    self.git.branch = branch;
                }
            }
        }

        if self.git.message.is_empty() {
            if let Some(message) = run_git(&["log", "-1", "--format=%s"]) {
                self.git.message = message;
            }
        }

        if self.git.author.is_empty() {
            if let Some(author) = run_git(&["log", "-1", "--format=%an"]) {
                self.git.author = author;
            }
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    /// Collect `SHIPIT_SECRET_<NAME>` variables as `${secrets.NAME}`.
    pub fn populate_secrets_from_env(&mut self) {
        self.add_prefixed_secrets(std::env::vars());
    }

    fn add_prefixed_secrets(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
                if !name.is_empty() {
                    self.secrets.insert(name.to_string(), value);
                }
            }
        }
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => non_empty(&self.git.sha),
            ["git", "short_sha"] => non_empty(&self.git.short_sha),
            ["git", "branch"] => non_empty(&self.git.branch),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),

            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["run", "id"] => non_empty(&self.run.id),
            ["run", "trigger"] => Some(self.run.trigger.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left in place.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate variables in a HashMap.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Interpolate, failing with the names of any variables that did not resolve.
    pub fn interpolate_strict(&self, input: &str) -> Result<String, Vec<String>> {
        let missing = self.unresolved(input);
        if missing.is_empty() {
            Ok(self.interpolate(input))
        } else {
            Err(missing)
        }
    }

    /// Names of variables in `input` that cannot be resolved.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }

    /// Replace every secret value in `line` with [`MASK`].
    pub fn mask(&self, line: &str) -> String {
        let mut values: Vec<&str> = self
            .secrets
            .values()
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a secret containing another is masked whole.
        values.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut masked = line.to_string();
        for value in values {
            if masked.contains(value) {
                masked = masked.replace(value, MASK);
            }
        }
        masked
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        self.ctx.git.set_sha(sha.into());
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, trigger: impl Into<String>) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.trigger = trigger.into();
        self
    }

    pub fn with_stage(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.stage.name = name.into();
        self.ctx.stage.index = index;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
