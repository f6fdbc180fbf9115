//! shipit CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipit")]
#[command(about = "Build a commit and ship it to Elastic Beanstalk", long_about = None)]
struct Cli {
    /// Pipeline definition
    #[arg(short, long, global = true, env = "SHIPIT_FILE", default_value = "shipit.kdl")]
    file: PathBuf,

    /// Directory the build runs in (defaults to the pipeline file's directory)
    #[arg(long, global = true, env = "SHIPIT_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline if the trigger event matches
    Run {
        /// Trigger event (push or manual); detected from the CI environment by default
        #[arg(long)]
        event: Option<String>,
        /// Branch that was pushed
        #[arg(long)]
        branch: Option<String>,
        /// Commit being built
        #[arg(long)]
        sha: Option<String>,
        /// Run even if no trigger matches
        #[arg(long)]
        force: bool,
        /// Keep the run's artifacts after the run
        #[arg(long)]
        keep_artifacts: bool,
        /// Secret available as ${secrets.NAME}
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,
    },
    /// Run only the build stage and keep its artifact
    Build {
        #[arg(long)]
        sha: Option<String>,
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,
    },
    /// Deploy the artifact of an earlier `shipit build`
    Deploy {
        /// Run id printed by `shipit build`
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        sha: Option<String>,
        /// Keep the artifact after deploying
        #[arg(long)]
        keep_artifacts: bool,
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,
    },
    /// Validate the pipeline definition
    Validate,
    /// Inspect or remove stored artifacts
    Artifacts {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// List the artifacts of a run
    List {
        #[arg(long)]
        run_id: String,
    },
    /// Delete the artifacts of a run
    Purge {
        #[arg(long)]
        run_id: String,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let target = commands::Target::new(cli.file, cli.workspace)?;

    let success = match cli.command {
        Commands::Run {
            event,
            branch,
            sha,
            force,
            keep_artifacts,
            secrets,
        } => {
            let options = commands::run::RunOptions {
                event,
                branch,
                sha,
                force,
                keep_artifacts,
                secrets,
            };
            commands::run::run(&target, options).await?
        }
        Commands::Build { sha, secrets } => commands::run::build(&target, sha, secrets).await?,
        Commands::Deploy {
            run_id,
            sha,
            keep_artifacts,
            secrets,
        } => commands::run::deploy(&target, &run_id, sha, keep_artifacts, secrets).await?,
        Commands::Validate => commands::validate(&target)?,
        Commands::Artifacts { command } => match command {
            ArtifactCommands::List { run_id } => commands::artifacts_list(&run_id).await?,
            ArtifactCommands::Purge { run_id } => commands::artifacts_purge(&run_id).await?,
        },
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
