//! subcycle CLI binary (spec.md §6): `worker run`, `batch pause|resume`,
//! `schedule list|cancel|cancel-all`. Wires the components constructed
//! explicitly here — no runtime dependency-injection registry, per the
//! redesign note in spec.md §9.

mod logging;
mod schedule;
mod tasks;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use subcycle_batch::{BatchConfig, BatchProcessor, LifecycleEvent};
use subcycle_classify::PendingConfig;
use subcycle_config::{SharedConfig, TunableOverrides};
use subcycle_executor::ProcessExecutor;
use subcycle_lock::{LockService, WorkerId};
use subcycle_model::TransitionKind;
use subcycle_notify::{LogNotifier, Notifier, WebhookNotifier};
use subcycle_profile::ProfileResolver;
use subcycle_sheet::http::{HttpSheetGateway, HttpSheetGatewayConfig};
use subcycle_worker::{WindowMode, WorkerLoop};
use tokio_util::sync::CancellationToken;

const DEFAULT_SHEET_BASE_URL: &str = "https://sheets.subcycle.internal/v1";
const DEFAULT_EXECUTOR_PROGRAM: &str = "subcycle-executor-adapter";

#[derive(Parser)]
#[command(name = "subcycle")]
#[command(about = "Fleet-wide subscription pause/resume scheduler", version)]
struct Cli {
    /// Spreadsheet identifier (worker sheet + profile-mapping sheet).
    #[arg(long, global = true, env = "WORKER_SHEET_ID")]
    sheet_id: Option<String>,

    /// Path to the sheet-API service account credentials file.
    #[arg(long, global = true, env = "WORKER_SERVICE_ACCOUNT_PATH")]
    service_account_path: Option<PathBuf>,

    /// Verbose logging, overrides RUST_LOG.
    #[arg(long, global = true, env = "DEBUG_MODE")]
    debug_mode: bool,

    /// Root of structured log output; when unset logs go to stderr.
    #[arg(long, global = true, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Base URL of the sheet HTTP API (overrides the built-in default).
    #[arg(long, global = true)]
    sheet_base_url: Option<String>,

    /// External browser-automation executor program to invoke per transition.
    #[arg(long, global = true)]
    executor_program: Option<String>,

    /// Webhook URL for critical notifications; falls back to log-only.
    #[arg(long, global = true)]
    notify_webhook: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operate the scheduled-transition worker loop.
    #[command(subcommand)]
    Worker(WorkerCommands),

    /// Run an ad-hoc batch of pause or resume transitions.
    #[command(subcommand)]
    Batch(BatchCommands),

    /// Inspect or cancel in-memory scheduled tasks (current process only).
    #[command(subcommand)]
    Schedule(ScheduleCommands),
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Start the scheduler proper.
    Run {
        /// Tick forever. Pass `--continuous=false` to run exactly one cycle.
        #[arg(long, default_value_t = true)]
        continuous: bool,

        /// Seconds between cycles.
        #[arg(long)]
        interval: Option<u64>,

        /// Minutes ahead of a resume's scheduled time to consider it due.
        #[arg(long)]
        resume_lead: Option<i64>,

        /// Minutes past a pause's scheduled time to consider it due.
        #[arg(long)]
        pause_lag: Option<i64>,

        /// Consecutive retryable failures before a row stops being selected.
        #[arg(long)]
        retry_cap: Option<u32>,

        /// Run the executor's browser with a visible window or headless.
        #[arg(long, value_enum, default_value_t = WindowArg::Background)]
        window: WindowArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WindowArg {
    Focus,
    Background,
}

impl From<WindowArg> for WindowMode {
    fn from(value: WindowArg) -> Self {
        match value {
            WindowArg::Focus => WindowMode::Focus,
            WindowArg::Background => WindowMode::Background,
        }
    }
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Run pause transitions over a task file.
    Pause(BatchArgs),
    /// Run resume transitions over a task file.
    Resume(BatchArgs),
}

#[derive(clap::Args)]
struct BatchArgs {
    /// Path to a JSON array of account emails.
    #[arg(long)]
    tasks: PathBuf,

    /// Max tasks running concurrently.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Tasks per batch.
    #[arg(long, default_value_t = 25)]
    batch_size: usize,

    /// Delay between successive tasks, only applied when concurrency == 1.
    #[arg(long, default_value_t = 0)]
    inter_task_delay: u64,

    /// Delay between batches, in milliseconds.
    #[arg(long, default_value_t = 0)]
    inter_batch_delay: u64,

    /// Run one additional retry pass over failures (retry cap forced to 0).
    #[arg(long)]
    retry: bool,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// List scheduled tasks known to this process.
    List,
    /// Cancel a scheduled task by id.
    Cancel { id: String },
    /// Cancel every scheduled task known to this process.
    CancelAll,
}

/// Falls back to `~/.config/subcycle/service-account.json` the way the
/// teacher's CLI auto-locates its keypair/config file when none is given
/// explicitly, instead of failing outright.
fn default_service_account_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join("subcycle").join("service-account.json"))
}

fn build_sheet_config(cli: &Cli) -> Result<HttpSheetGatewayConfig> {
    let sheet_id = cli
        .sheet_id
        .clone()
        .context("WORKER_SHEET_ID (or --sheet-id) is required")?;
    let service_account_path = cli
        .service_account_path
        .clone()
        .or_else(default_service_account_path)
        .context("WORKER_SERVICE_ACCOUNT_PATH (or --service-account-path) is required")?;
    let api_key = std::fs::read_to_string(&service_account_path)
        .with_context(|| {
            format!(
                "failed to read service account credentials at {}",
                service_account_path.display()
            )
        })?
        .trim()
        .to_string();

    let base = cli
        .sheet_base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_SHEET_BASE_URL.to_string());

    Ok(HttpSheetGatewayConfig {
        base_url: format!("{}/sheets/{sheet_id}", base.trim_end_matches('/')),
        api_key,
        request_timeout: Duration::from_secs(30),
    })
}

fn build_notifier(cli: &Cli) -> Box<dyn Notifier> {
    match &cli.notify_webhook {
        Some(url) => Box::new(WebhookNotifier::new(url.clone())),
        None => Box::new(LogNotifier),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug_mode, cli.log_dir.as_deref());

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("subcycle: fatal error: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Worker(WorkerCommands::Run {
            continuous,
            interval,
            resume_lead,
            pause_lag,
            retry_cap,
            window,
        }) => run_worker(&cli, *continuous, *interval, *resume_lead, *pause_lag, *retry_cap, *window).await,

        Commands::Batch(batch_cmd) => run_batch(&cli, batch_cmd).await,

        Commands::Schedule(schedule_cmd) => {
            // Degenerate for a single process per spec.md §9: nothing has
            // been registered by the time this subcommand runs on its own,
            // so list/cancel only ever observe an empty registry here. Kept
            // as a real, testable module (`schedule.rs`) rather than a stub.
            let registry = schedule::ScheduleRegistry::new();
            match schedule_cmd {
                ScheduleCommands::List => {
                    for task in registry.list() {
                        println!("{} {} {}", task.id, task.kind, task.email);
                    }
                }
                ScheduleCommands::Cancel { id } => {
                    if registry.cancel(id) {
                        println!("cancelled {id}");
                    } else {
                        println!("no such scheduled task: {id}");
                    }
                }
                ScheduleCommands::CancelAll => {
                    let n = registry.cancel_all();
                    println!("cancelled {n} scheduled task(s)");
                }
            }
            Ok(())
        }
    }
}

async fn run_worker(
    cli: &Cli,
    continuous: bool,
    interval: Option<u64>,
    resume_lead: Option<i64>,
    pause_lag: Option<i64>,
    retry_cap: Option<u32>,
    window: WindowArg,
) -> Result<()> {
    let sheet_config = build_sheet_config(cli)?;
    let sheet = HttpSheetGateway::new(sheet_config)?;

    let worker_id = WorkerId::generate();
    log::info!("worker: starting as {worker_id}");
    let lock = LockService::new(&sheet, worker_id);
    let profiles = ProfileResolver::new(&sheet);
    let notifier = build_notifier(cli);

    let overrides = TunableOverrides {
        resume_lead_minutes: resume_lead,
        pause_lag_minutes: pause_lag,
        check_interval_seconds: interval,
        retry_cap,
        ..Default::default()
    };
    let config = SharedConfig::new(&sheet, overrides);

    let executor_program = cli
        .executor_program
        .clone()
        .unwrap_or_else(|| DEFAULT_EXECUTOR_PROGRAM.to_string());
    let executor = ProcessExecutor::new(executor_program, Vec::new(), Duration::from_secs(300));

    let worker = WorkerLoop::new(&sheet, &lock, &profiles, &executor, notifier.as_ref(), &config)
        .with_window_mode(window.into());

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("worker: shutdown signal received, finishing the in-flight cycle");
        shutdown_token.cancel();
    });

    worker.run(token, continuous).await
}

async fn run_batch(cli: &Cli, batch_cmd: &BatchCommands) -> Result<()> {
    let (kind, args) = match batch_cmd {
        BatchCommands::Pause(args) => (TransitionKind::Pause, args),
        BatchCommands::Resume(args) => (TransitionKind::Resume, args),
    };

    let sheet_config = build_sheet_config(cli)?;
    let sheet = HttpSheetGateway::new(sheet_config)?;

    let worker_id = WorkerId::generate();
    let lock = LockService::new(&sheet, worker_id);
    let profiles = ProfileResolver::new(&sheet);
    let notifier = build_notifier(cli);
    let config = SharedConfig::new(&sheet, TunableOverrides::default());

    let executor_program = cli
        .executor_program
        .clone()
        .unwrap_or_else(|| DEFAULT_EXECUTOR_PROGRAM.to_string());
    let executor = ProcessExecutor::new(executor_program, Vec::new(), Duration::from_secs(300));

    let worker = WorkerLoop::new(&sheet, &lock, &profiles, &executor, notifier.as_ref(), &config);
    let batch = BatchProcessor::new(&sheet, &worker);

    let task_list = tasks::load_tasks(&args.tasks, kind)?;
    let batch_config = BatchConfig {
        concurrency: args.concurrency,
        batch_size: args.batch_size,
        retry_enabled: args.retry,
        inter_task_delay: Duration::from_millis(args.inter_task_delay),
        inter_batch_delay: Duration::from_millis(args.inter_batch_delay),
        pending: PendingConfig::default(),
    };

    let on_event = |event: LifecycleEvent| match event {
        LifecycleEvent::BatchStart { index, size } => {
            log::info!("batch: starting batch {index} ({size} task(s))")
        }
        LifecycleEvent::TaskComplete { email } => log::info!("batch: {email} complete"),
        LifecycleEvent::TaskFailed { email, message } => {
            log::warn!("batch: {email} failed: {message}")
        }
        LifecycleEvent::TaskSkipped { email } => log::debug!("batch: {email} skipped"),
        LifecycleEvent::Progress { done, total } => log::debug!("batch: progress {done}/{total}"),
    };

    let report = batch.run(task_list, batch_config, &on_event).await?;
    log::info!(
        "batch: done — completed={} failed={} skipped={}",
        report.completed,
        report.failed,
        report.skipped
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
