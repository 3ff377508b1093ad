use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use conveyor::config::{LogFormat, OrchestratorConfig, default_config_path};

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Pipeline execution orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to conveyor.toml (defaults to .conveyor/conveyor.toml)
    #[arg(long, global = true, env = "CONVEYOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Object database path. Overrides the config file.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration and create the object database
    Init {
        /// Overwrite an existing conveyor.toml
        #[arg(long)]
        force: bool,
    },
    /// Run the reconcile loops until interrupted
    Controller,
    /// Manage pipelines
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Submit a new execution of a pipeline
    Run {
        /// Namespace of the pipeline (the project id)
        namespace: String,
        pipeline: String,
        /// Pipeline configuration (stages, steps, notification) as YAML
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long, default_value = "")]
        branch: String,
        #[arg(long, default_value = "")]
        commit: String,
        #[arg(long, default_value = "")]
        message: String,
        #[arg(long, default_value = "")]
        author: String,
    },
    /// List executions
    List {
        /// Only executions of this project
        #[arg(short, long)]
        project: Option<String>,
        /// Only executions that are admitted and not finished
        #[arg(long)]
        active: bool,
    },
    /// Print an execution as YAML
    Show { namespace: String, name: String },
    /// Abort a running or queued execution
    Abort { namespace: String, name: String },
    /// Print the captured log of one step
    Log {
        namespace: String,
        name: String,
        stage: usize,
        step: usize,
    },
    /// Set a per-project pipeline setting (e.g. executor-quota)
    Setting {
        #[command(subcommand)]
        command: SettingCommands,
    },
    /// Manage notifiers
    Notifier {
        #[command(subcommand)]
        command: NotifierCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum PipelineCommands {
    /// Create a pipeline
    Create {
        /// Namespace of the pipeline; must be the project id
        namespace: String,
        name: String,
        /// Owning project as "<cluster>:<project>"
        #[arg(long)]
        project: String,
        /// Git repository URL
        #[arg(long, default_value = "")]
        repo: String,
    },
    /// List pipelines with their run bookkeeping
    List {
        #[arg(short, long)]
        project: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SettingCommands {
    Set {
        /// Project id
        project: String,
        name: String,
        value: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum NotifierCommands {
    /// Register a notifier in a cluster
    Add {
        /// Cluster id the notifier belongs to
        cluster: String,
        name: String,
        #[arg(long, default_value = "")]
        display_name: String,
        /// Slack incoming webhook URL
        #[arg(long, conflicts_with = "webhook")]
        slack: Option<String>,
        /// Generic webhook URL
        #[arg(long)]
        webhook: Option<String>,
        /// Channel used when a recipient leaves it empty (Slack only)
        #[arg(long, default_value = "")]
        default_recipient: String,
    },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = OrchestratorConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if let Some(db_path) = &cli.db_path {
        config.store.db_path = db_path.clone();
    }
    init_logging(cli.verbose, config.logging.format);

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&config_path, &config, *force)?,
        Commands::Controller => cmd::cmd_controller(&config).await?,
        Commands::Pipeline { command } => match command {
            PipelineCommands::Create {
                namespace,
                name,
                project,
                repo,
            } => cmd::cmd_pipeline_create(&config, namespace, name, project, repo).await?,
            PipelineCommands::List { project } => {
                cmd::cmd_pipeline_list(&config, project.as_deref()).await?
            }
        },
        Commands::Run {
            namespace,
            pipeline,
            file,
            branch,
            commit,
            message,
            author,
        } => {
            let provenance = cmd::Provenance {
                trigger_user_name: std::env::var("USER").unwrap_or_default(),
                branch: branch.clone(),
                commit: commit.clone(),
                message: message.clone(),
                author: author.clone(),
            };
            cmd::cmd_run(&config, namespace, pipeline, file, provenance).await?
        }
        Commands::List { project, active } => {
            cmd::cmd_list(&config, project.as_deref(), *active).await?
        }
        Commands::Show { namespace, name } => cmd::cmd_show(&config, namespace, name).await?,
        Commands::Abort { namespace, name } => cmd::cmd_abort(&config, namespace, name).await?,
        Commands::Log {
            namespace,
            name,
            stage,
            step,
        } => cmd::cmd_log(&config, namespace, name, *stage, *step).await?,
        Commands::Setting { command } => match command {
            SettingCommands::Set {
                project,
                name,
                value,
            } => cmd::cmd_setting_set(&config, project, name, value).await?,
        },
        Commands::Notifier { command } => match command {
            NotifierCommands::Add {
                cluster,
                name,
                display_name,
                slack,
                webhook,
                default_recipient,
            } => {
                let kind = match (slack, webhook) {
                    (Some(url), _) => conveyor_common::NotifierKind::Slack {
                        url: url.clone(),
                        default_recipient: default_recipient.clone(),
                    },
                    (None, Some(url)) => conveyor_common::NotifierKind::Webhook { url: url.clone() },
                    (None, None) => anyhow::bail!("Either --slack or --webhook is required"),
                };
                cmd::cmd_notifier_add(&config, cluster, name, display_name, kind).await?
            }
        },
    }

    Ok(())
}
