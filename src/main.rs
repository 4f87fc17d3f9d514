use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use faxrelay::config::{Config, ModeName};
use faxrelay::daemon::{self, WatchOptions};
use faxrelay::dispatch::{DispatchOptions, Dispatcher, FaxSender, SendfaxCommand};
use faxrelay::jobs::{JobPoller, Journalctl, JobsOptions, PdfPreview, WebhookClient};
use faxrelay::loki::LokiClient;
use faxrelay::metrics::{self, FaxMetrics};
use faxrelay::qfile::Qfile;
use faxrelay::tail::{TailMode, Tailer};
use faxrelay::xferlog::{parse_line, DateOrder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "faxrelay", version)]
#[command(about = "Relay faxes received by GOfax.IP and report failed HylaFAX jobs")]
struct Cli {
    /// Config file (default: ~/.config/faxrelay/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stdout
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    watch: WatchArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the transaction log and relay received faxes (default)
    Watch(WatchArgs),
    /// Post failed outbound jobs to a webhook
    Jobs(JobsArgs),
    /// Print a queue file as JSON
    Qfile {
        path: PathBuf,
    },
    /// Parse one transaction log line and print it as JSON
    Parse {
        line: String,
        #[arg(long, value_enum)]
        date_order: Option<DateOrder>,
    },
}

#[derive(Args)]
struct WatchArgs {
    /// Transaction log to tail
    #[arg(long)]
    path: Option<PathBuf>,
    #[arg(long, env = "BASE_HYLAFAX_PATH")]
    spool_dir: Option<PathBuf>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    mode: Option<ModeName>,
    #[arg(long, value_enum)]
    date_order: Option<DateOrder>,
    #[arg(long)]
    metrics_addr: Option<String>,
    /// Don't serve /metrics
    #[arg(long)]
    no_metrics: bool,
    /// Log received faxes without forwarding them
    #[arg(long)]
    no_dispatch: bool,
    #[arg(long, env = "LOKI_URL")]
    loki_url: Option<String>,
    #[arg(long, env = "LOKI_USER")]
    loki_user: Option<String>,
    #[arg(long, env = "LOKI_PASS", hide_env_values = true)]
    loki_pass: Option<String>,
}

#[derive(Args)]
struct JobsArgs {
    #[arg(long, env = "BASE_HYLAFAX_PATH")]
    spool_dir: Option<PathBuf>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long, env = "WEBHOOK_URL")]
    webhook_url: Option<String>,
    #[arg(long, env = "WEBHOOK_USERNAME")]
    webhook_username: Option<String>,
    #[arg(long, env = "WEBHOOK_PASSWORD", hide_env_values = true)]
    webhook_password: Option<String>,
    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
}

impl WatchArgs {
    fn apply(self, config: &mut Config) {
        let watch = &mut config.watch;
        if let Some(path) = self.path {
            watch.log_path = path;
        }
        if let Some(dir) = self.spool_dir {
            watch.spool_dir = dir;
        }
        if let Some(dir) = self.state_dir {
            watch.state_dir = dir;
        }
        if let Some(mode) = self.mode {
            watch.mode = mode;
        }
        if let Some(order) = self.date_order {
            watch.date_order = order;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics.addr = addr;
        }
        if self.no_metrics {
            config.metrics.enabled = false;
        }
        if self.no_dispatch {
            config.dispatch.enabled = false;
        }
        if self.loki_url.is_some() {
            config.loki.url = self.loki_url;
        }
        if self.loki_user.is_some() {
            config.loki.username = self.loki_user;
        }
        if self.loki_pass.is_some() {
            config.loki.password = self.loki_pass;
        }
    }
}

impl JobsArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.spool_dir {
            config.watch.spool_dir = dir.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.watch.state_dir = dir.clone();
        }
        if let Some(url) = &self.webhook_url {
            config.webhook.url = Some(url.clone());
        }
        if let Some(user) = &self.webhook_username {
            config.webhook.username = user.clone();
        }
        if let Some(pass) = &self.webhook_password {
            config.webhook.password = pass.clone();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_file.as_ref())?;

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        None => {
            cli.watch.apply(&mut config);
            run_watch(config)?;
        }
        Some(Commands::Watch(args)) => {
            args.apply(&mut config);
            run_watch(config)?;
        }
        Some(Commands::Jobs(args)) => {
            args.apply(&mut config);
            run_jobs(config, args.once)?;
        }
        Some(Commands::Qfile { path }) => {
            let qfile = Qfile::open(&path)?;
            println!("{}", serde_json::to_string_pretty(qfile.params())?);
            qfile.close()?;
        }
        Some(Commands::Parse { line, date_order }) => {
            let order = date_order.unwrap_or(config.watch.date_order);
            let record = parse_line(&line, order)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn init_tracing(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn run_watch(config: Config) -> Result<()> {
    config.validate_watch()?;

    let metrics = Arc::new(FaxMetrics::new().context("Failed to register metrics")?);
    let sender: Arc<dyn FaxSender> = Arc::new(SendfaxCommand::new(config.dispatch.program.clone()));
    let dispatcher = Dispatcher::new(
        sender,
        Arc::clone(&metrics),
        DispatchOptions {
            spool_dir: config.watch.spool_dir.clone(),
            settle_delay: Duration::from_secs(config.dispatch.settle_delay_secs),
            delete_after_send: config.dispatch.delete_after_send,
            forward: config.dispatch.enabled,
        },
    );

    let mode = match config.watch.mode {
        ModeName::ProcessedSet => TailMode::ProcessedSet {
            path: config.watch.processed_path(),
        },
        ModeName::InPlace => TailMode::InPlace,
    };
    let mut tailer = Tailer::new(
        config.watch.log_path.clone(),
        mode,
        config.watch.date_order,
        dispatcher,
        Arc::clone(&metrics),
    );
    if let Some(url) = config.loki.url.as_deref().filter(|u| !u.is_empty()) {
        let loki = LokiClient::new(url, config.loki.username.clone(), config.loki.password.clone())?;
        info!(url = %url, "Shipping records to Loki");
        tailer = tailer.with_loki(loki);
    }
    if !config.dispatch.enabled {
        warn!("Forwarding disabled, received faxes are only logged");
    }

    let options = WatchOptions {
        poll_interval: config.watch.poll_interval(),
        debounce: Duration::from_millis(config.watch.debounce_ms),
        quiet_window: Duration::from_millis(config.watch.quiet_window_ms),
    };

    let metrics_listener = if config.metrics.enabled {
        let listener = metrics::bind(&config.metrics.addr)?;
        info!(addr = %config.metrics.addr, "Serving metrics");
        Some(listener)
    } else {
        None
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                wait_for_signal().await;
                info!("Shutting down");
                shutdown.cancel();
            }
        });

        let metrics_task = metrics_listener.map(|listener| {
            tokio::spawn(metrics::serve(
                listener,
                Arc::clone(&metrics),
                shutdown.clone(),
            ))
        });

        let result = daemon::run(tailer, options, shutdown.clone()).await;
        shutdown.cancel();

        if let Some(task) = metrics_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
                Err(e) => error!(error = %e, "Metrics server task panicked"),
            }
        }
        result
    })
}

fn run_jobs(config: Config, once: bool) -> Result<()> {
    config.validate_jobs()?;

    let url = config
        .webhook
        .url
        .clone()
        .ok_or_else(|| anyhow!("webhook.url is required for the jobs poller"))?;
    let webhook = WebhookClient::new(
        url,
        config.webhook.username.clone(),
        config.webhook.password.clone(),
    )?;
    let preview = Some(config.jobs.preview_program.as_str())
        .filter(|p| !p.is_empty())
        .map(PdfPreview::new);

    let poller = JobPoller::new(
        Box::new(Journalctl::new(config.jobs.unit.clone())),
        webhook,
        preview,
        JobsOptions {
            spool_root: config.watch.spool_dir.clone(),
            state_dir: config.watch.state_dir.clone(),
            interval: Duration::from_secs(config.jobs.interval_secs),
            lookback: Duration::from_secs(config.jobs.lookback_secs),
            reasons: config.jobs.reasons.clone(),
        },
    )?;

    if once {
        let pass = poller.run_pass()?;
        info!(
            notifications = pass.notifications,
            reported = pass.reported,
            failed = pass.failed,
            "Job pass complete"
        );
        return Ok(());
    }

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("faxrelay-jobs".to_string())
        .spawn(move || poller.run(&stop_rx))
        .context("Failed to spawn job poller thread")?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(wait_for_signal());

    info!("Shutting down");
    let _ = stop_tx.send(());
    handle
        .join()
        .map_err(|_| anyhow!("Job poller thread panicked"))?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        _ = terminate => {}
    }
}
