use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repo_job_controller::config::{AppConfig, CliConfig, FileConfig};
use repo_job_controller::driver::{self, JobDriver};
use repo_job_controller::history::{
    FanoutHistoryWriter, HistoryStore, HistoryWriter, SqliteHistoryStore, TracingHistoryWriter,
};
use repo_job_controller::jobs::{
    Job, JobAction, JobKey, JobNotifier, JobSpec, JobStore, RepositoryRef, SqliteJobStore,
};
use repo_job_controller::metrics;
use repo_job_controller::repository::StaticRepositoryResolver;
use repo_job_controller::workers::{DirectoryMirror, WorkerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "job-controller", version = env!("APP_VERSION"))]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job driver until interrupted.
    Run(RunArgs),

    /// Queue a new job.
    Submit(SubmitArgs),

    /// Print live jobs as JSON.
    List {
        /// Directory holding jobs.db and history.db.
        #[clap(long, value_parser = parse_path)]
        db_dir: PathBuf,

        #[clap(long)]
        namespace: Option<String>,
    },

    /// Print finished jobs as JSON, most recent first.
    History {
        /// Directory holding jobs.db and history.db.
        #[clap(long, value_parser = parse_path)]
        db_dir: PathBuf,

        #[clap(long)]
        namespace: Option<String>,

        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to a TOML config file. Values in the file override CLI flags.
    #[clap(long, value_parser = parse_path)]
    config: Option<PathBuf>,

    /// Directory holding jobs.db and history.db.
    #[clap(long, value_parser = parse_path)]
    db_dir: Option<PathBuf>,

    /// Root of the instance content. Defaults to <db-dir>/mirror.
    #[clap(long, value_parser = parse_path)]
    mirror_dir: Option<PathBuf>,

    /// Lease holder prefix; each slot appends its own suffix.
    #[clap(long)]
    identity: Option<String>,

    /// Number of jobs processed concurrently.
    #[clap(long, default_value_t = driver::DEFAULT_SLOTS)]
    slots: usize,

    #[clap(long, default_value_t = driver::DEFAULT_MAX_JOB_DURATION.as_secs())]
    max_job_duration_secs: u64,

    #[clap(long, default_value_t = driver::DEFAULT_LEASE_DURATION.as_secs())]
    lease_duration_secs: u64,

    /// Must be shorter than the lease duration.
    #[clap(long, default_value_t = driver::DEFAULT_LEASE_RENEWAL_INTERVAL.as_secs())]
    lease_renewal_interval_secs: u64,

    /// Fallback claim interval when no notification arrives.
    #[clap(long, default_value_t = driver::DEFAULT_POLL_INTERVAL.as_secs())]
    poll_interval_secs: u64,

    /// Age after which history records are deleted. Set to 0 to keep them forever.
    #[clap(long, default_value_t = 0)]
    history_expiration_secs: u64,

    /// The port for the metrics server (Prometheus scraping). Set to 0 to disable it.
    #[clap(long, default_value_t = 0)]
    metrics_port: u16,
}

impl RunArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            mirror_dir: self.mirror_dir.clone(),
            metrics_port: self.metrics_port,
            identity: self.identity.clone(),
            slots: self.slots,
            max_job_duration_secs: self.max_job_duration_secs,
            lease_duration_secs: self.lease_duration_secs,
            lease_renewal_interval_secs: self.lease_renewal_interval_secs,
            poll_interval_secs: self.poll_interval_secs,
            history_expiration_secs: self.history_expiration_secs,
        }
    }
}

#[derive(clap::Args, Debug)]
struct SubmitArgs {
    /// Directory holding jobs.db.
    #[clap(long, value_parser = parse_path)]
    db_dir: PathBuf,

    #[clap(long)]
    namespace: String,

    /// Job name, unique within the namespace.
    #[clap(long)]
    name: String,

    /// Name of the repository inside the namespace.
    #[clap(long)]
    repository: String,

    #[command(subcommand)]
    action: ActionCommand,
}

#[derive(Subcommand, Debug)]
enum ActionCommand {
    /// Pull repository content into the instance.
    Sync {
        #[clap(long)]
        incremental: bool,
    },
    /// Push instance content into the repository.
    Export {
        #[clap(long)]
        branch: Option<String>,
        #[clap(long)]
        path: Option<String>,
        #[clap(long)]
        message: Option<String>,
    },
    /// Export, wipe the namespace, then sync it back.
    Migrate {
        #[clap(long)]
        history: bool,
        #[clap(long)]
        message: Option<String>,
    },
    /// Delete files from the repository.
    Delete {
        #[clap(long)]
        git_ref: Option<String>,
        #[clap(required = true)]
        paths: Vec<String>,
    },
    /// Move files into a directory of the repository.
    Move {
        #[clap(long)]
        git_ref: Option<String>,
        /// Destination directory, ending with '/'.
        #[clap(long)]
        target_path: String,
        #[clap(required = true)]
        paths: Vec<String>,
    },
}

impl From<ActionCommand> for JobAction {
    fn from(command: ActionCommand) -> Self {
        match command {
            ActionCommand::Sync { incremental } => JobAction::Sync { incremental },
            ActionCommand::Export {
                branch,
                path,
                message,
            } => JobAction::Export {
                branch,
                path,
                message,
            },
            ActionCommand::Migrate { history, message } => JobAction::Migrate { history, message },
            ActionCommand::Delete { git_ref, paths } => JobAction::Delete { git_ref, paths },
            ActionCommand::Move {
                git_ref,
                target_path,
                paths,
            } => JobAction::Move {
                git_ref,
                paths,
                target_path,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    match cli_args.command {
        Command::Run(args) => run(args).await,
        Command::Submit(args) => submit(args),
        Command::List { db_dir, namespace } => {
            let store = SqliteJobStore::new(db_dir.join("jobs.db"))?;
            let jobs = store.list(namespace.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Command::History {
            db_dir,
            namespace,
            limit,
        } => {
            let store = SqliteHistoryStore::new(db_dir.join("history.db"))?;
            let records = store.list(namespace.as_deref(), limit)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let file_config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&args.to_cli_config(), file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening job store at {:?}...", app_config.jobs_db_path());
    let notifier = JobNotifier::new(app_config.driver.notification_capacity);
    let job_store =
        Arc::new(SqliteJobStore::new(app_config.jobs_db_path())?.with_notifier(notifier));

    info!("Opening history store at {:?}...", app_config.history_db_path());
    let history_store = Arc::new(SqliteHistoryStore::new(app_config.history_db_path())?);
    let history_writer = Arc::new(FanoutHistoryWriter::new(vec![
        history_store.clone() as Arc<dyn HistoryWriter>,
        Arc::new(TracingHistoryWriter),
    ]));

    let resolver = StaticRepositoryResolver::from_settings(&app_config.repositories)
        .context("Failed to open configured repositories")?;
    info!("Serving {} repositories", resolver.len());

    std::fs::create_dir_all(&app_config.mirror_dir).with_context(|| {
        format!(
            "Failed to create mirror directory {:?}",
            app_config.mirror_dir
        )
    })?;
    let mirror = Arc::new(DirectoryMirror::new(app_config.mirror_dir.clone()));
    let workers = WorkerRegistry::standard(mirror.clone(), mirror.clone(), mirror);

    let driver = JobDriver::new(
        app_config.driver.to_driver_config(),
        job_store,
        history_writer,
        workers,
    )
    .with_resolver(Arc::new(resolver))
    .with_history_store(history_store as Arc<dyn HistoryStore>);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down..."),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        signal_token.cancel();
    });

    let metrics_handle = app_config.metrics_port.map(|port| {
        let token = shutdown.clone();
        info!("Metrics available at port {}!", port);
        tokio::spawn(async move {
            let stop = async move { token.cancelled().await };
            if let Err(e) = metrics::run_metrics_server(port, stop).await {
                error!("Metrics server failed: {:#}", e);
            }
        })
    });

    driver.run(shutdown.clone()).await?;

    shutdown.cancel();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn submit(args: SubmitArgs) -> Result<()> {
    std::fs::create_dir_all(&args.db_dir)
        .with_context(|| format!("Failed to create db directory {:?}", args.db_dir))?;
    let store = SqliteJobStore::new(args.db_dir.join("jobs.db"))?;

    let job = Job::new(
        JobKey::new(args.namespace.clone(), args.name),
        JobSpec {
            repository: RepositoryRef::new(args.namespace, args.repository),
            action: args.action.into(),
        },
    );
    let job = store.create(job)?;
    info!("Queued {} job {} ({})", job.kind(), job.key, job.uid);
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
