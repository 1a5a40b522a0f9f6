use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use stack_daemon::daemon::DEFAULT_DAEMON_PORT;
use stack_orchestration::{OperationKind, OperationOptions, OperationTarget};
use std::path::PathBuf;
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "stackctl")]
#[command(about = "Control a multi-service container stack through stackd")]
#[command(version)]
struct Cli {
    /// Daemon port
    #[arg(short, long, global = true, env = "STACK_DAEMON_PORT", default_value_t = DEFAULT_DAEMON_PORT)]
    port: u16,

    /// Log filter for client diagnostics
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// How results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable tables
    Table,
    /// Pretty printed JSON
    Json,
}

/// A service name, or a group name with `--group`
#[derive(Debug, Args)]
struct TargetArgs {
    /// Service or group name
    name: String,

    /// Treat the name as a group
    #[arg(short, long)]
    group: bool,
}

impl TargetArgs {
    fn target(&self) -> OperationTarget {
        if self.group {
            OperationTarget::Group(self.name.clone())
        } else {
            OperationTarget::Service(self.name.clone())
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Abort on the first service failure
    #[arg(long)]
    strict: bool,

    /// Readiness timeout per service, in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Return once the operation is accepted
    #[arg(short, long)]
    detach: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Start,
    Stop,
    Restart,
}

impl From<KindArg> for OperationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Start => OperationKind::Start,
            KindArg::Stop => OperationKind::Stop,
            KindArg::Restart => OperationKind::Restart,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stack file without contacting the daemon
    Validate {
        /// Stack file
        #[arg(short, long, default_value = "stack.yaml")]
        config: PathBuf,
    },

    /// Show the dependency graph
    Graph,

    /// Show service status
    Status,

    /// Show groups with running counts
    Groups,

    /// Show one service with its dependencies and dependents
    Service {
        /// Service name
        name: String,
    },

    /// Preview an operation without executing it
    Plan {
        /// Operation kind
        #[arg(value_enum)]
        kind: KindArg,

        #[command(flatten)]
        target: TargetArgs,

        /// Profile to start under
        #[arg(long)]
        profile: Option<String>,

        /// Include running dependents of stopped services
        #[arg(short, long)]
        force: bool,
    },

    /// Start a service or group with its dependencies
    Start {
        #[command(flatten)]
        target: TargetArgs,

        /// Profile to start under
        #[arg(long)]
        profile: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Stop a service or group
    Stop {
        #[command(flatten)]
        target: TargetArgs,

        /// Stop running dependents first instead of refusing
        #[arg(short, long)]
        force: bool,

        /// Return once the operation is accepted
        #[arg(short, long)]
        detach: bool,
    },

    /// Stop then start a service or group
    Restart {
        #[command(flatten)]
        target: TargetArgs,

        /// Profile to start under
        #[arg(long)]
        profile: Option<String>,

        /// Restart running dependents too
        #[arg(short, long)]
        force: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List recent operations
    Operations,

    /// Show one operation
    Operation {
        /// Operation id
        id: Uuid,
    },

    /// Cancel an operation
    Cancel {
        /// Operation id
        id: Uuid,
    },

    /// Stream status changes
    Watch {
        /// Only this service
        service: Option<String>,
    },

    /// Follow the logs of a service
    Logs {
        /// Service name
        service: String,

        /// Lines to show before following
        #[arg(short = 'n', long, default_value_t = 100)]
        tail: usize,
    },

    /// Show resource usage
    Metrics {
        /// Only this service
        service: Option<String>,

        /// Show the retained samples of the service instead of the latest
        #[arg(long, requires = "service")]
        history: bool,
    },

    /// Check a service for resource pressure, crash loops and log errors
    Diagnose {
        /// Service name
        service: String,
    },

    /// Ask the daemon to re-read its stack file
    Reload,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    stack_daemon::logging::init(cli.log_level.as_deref(), "warn");

    smol::block_on(async move {
        let port = cli.port;
        let format = cli.format;

        match cli.command {
            Commands::Validate { config } => commands::validate::run(&config, format),
            Commands::Graph => commands::inspect::graph(port, format).await,
            Commands::Status => commands::status::run(port, format).await,
            Commands::Groups => commands::inspect::groups(port, format).await,
            Commands::Service { name } => commands::inspect::service(port, &name, format).await,
            Commands::Plan {
                kind,
                target,
                profile,
                force,
            } => {
                let options = OperationOptions {
                    force,
                    ..Default::default()
                };
                let (kind, target) = (kind.into(), target.target());
                commands::operations::plan(port, kind, target, profile, options, format).await
            }
            Commands::Start {
                target,
                profile,
                run,
            } => {
                let options = OperationOptions {
                    force: false,
                    strict: run.strict,
                    health_timeout_secs: run.timeout,
                };
                let request =
                    commands::operations::start_request(target.target(), profile, options);
                commands::operations::execute(port, request, run.detach, format).await
            }
            Commands::Stop {
                target,
                force,
                detach,
            } => {
                let options = OperationOptions {
                    force,
                    ..Default::default()
                };
                let request = commands::operations::stop_request(target.target(), options);
                commands::operations::execute(port, request, detach, format).await
            }
            Commands::Restart {
                target,
                profile,
                force,
                run,
            } => {
                let options = OperationOptions {
                    force,
                    strict: run.strict,
                    health_timeout_secs: run.timeout,
                };
                let request =
                    commands::operations::restart_request(target.target(), profile, options);
                commands::operations::execute(port, request, run.detach, format).await
            }
            Commands::Operations => commands::operations::list(port, format).await,
            Commands::Operation { id } => commands::operations::show(port, id, format).await,
            Commands::Cancel { id } => commands::operations::cancel(port, id).await,
            Commands::Watch { service } => commands::watch::status(port, service, format).await,
            Commands::Logs { service, tail } => {
                commands::watch::logs(port, service, tail, format).await
            }
            Commands::Metrics { service, history } => {
                commands::metrics::show(port, service, history, format).await
            }
            Commands::Diagnose { service } => {
                commands::metrics::diagnose(port, service, format).await
            }
            Commands::Reload => commands::operations::reload(port).await,
        }
    })
}
