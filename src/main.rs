use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info, warn};
use specwatch::alerts::channels::build_channel;
use specwatch::alerts::AlertDispatcher;
use specwatch::collectors::{EventReader, EventRecord};
use specwatch::config::{Config, MAX_SECONDS};
use specwatch::error::ConfigError;
use specwatch::issues::IssueLog;
use specwatch::{HealthReport, Observer, SpecRegistry};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;

/// Command-line arguments for the runtime quality observer
#[derive(Parser)]
#[command(
    name = "specwatch",
    about = "Runtime quality observer - checks application behavior against a declared specification",
    long_about = "Reads state-transition and activity events as JSON lines from stdin, validates them \
                  against a behavioral specification, detects stuck and stale entities, and \
                  notifies an operator about qualifying issues."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Path to the behavioral specification
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Specification file (TOML or JSON); overrides observer.spec_path"
    )]
    spec: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Validate the specification and exit
    #[arg(long, help = "Load and validate the specification, then exit")]
    check_spec: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// A missing config file is fine (defaults are used); a missing spec file
    /// is not.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if config_path.extension().is_some_and(|ext| ext != "toml") {
                    warn!(
                        "Configuration file does not have .toml extension: {}",
                        config_path.display()
                    );
                }
            }
        }

        if let Some(ref spec_path) = self.spec {
            if !spec_path.is_file() {
                return Err(format!(
                    "Specification file not found: {}",
                    spec_path.display()
                ));
            }
        }

        Ok(())
    }

    /// Specification path from the command line, else from the config file
    fn spec_path(&self, config: &Config) -> Option<PathBuf> {
        self.spec
            .clone()
            .or_else(|| config.observer.spec_path.clone())
    }
}

/// Load configuration from file or use defaults
///
/// An unreadable or invalid file is reported and replaced by defaults.
fn load_config(config_path: Option<&Path>) -> Config {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path.display()
                    );
                    Config::default()
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Config::default()
                }
            }
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    }
}

fn build_observer(config: &Config, registry: SpecRegistry) -> anyhow::Result<Observer> {
    let channel = build_channel(&config.alerts.channel)
        .context("Failed to set up notification channel")?;
    let dispatcher = AlertDispatcher::new(channel, config.alerts.dispatcher_settings());
    let issues = Arc::new(IssueLog::new(config.issues.capacity));
    Ok(Observer::new(Arc::new(registry), issues, dispatcher))
}

/// Feed parsed records to the observer until input ends or shutdown
///
/// End of input also triggers shutdown.
fn spawn_ingest_thread(
    observer: Arc<Observer>,
    records: Receiver<EventRecord>,
    shutdown: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut ingested = 0usize;
        loop {
            match records.recv_timeout(Duration::from_millis(250)) {
                Ok(record) => {
                    observer.ingest(&record.module, &record.entity_id, &record.event);
                    ingested += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Event input exhausted, shutting down");
                    shutdown.send_replace(true);
                    break;
                }
            }
        }
        info!("Ingest thread stopped after {} events", ingested);
    })
}

/// Run periodic checks until shutdown, then one final check
async fn run_checks(
    observer: Arc<Observer>,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(interval_seconds.clamp(1, MAX_SECONDS));
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                observer.run_periodic_check(chrono::Utc::now()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let summary = observer.run_periodic_check(chrono::Utc::now()).await;
    info!("Final check: {:?}", summary);
}

fn print_report(report: &HealthReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize health report")?;
    println!("{}", json);
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref());

    let Some(spec_path) = cli.spec_path(&config) else {
        bail!("No specification given; pass --spec or set observer.spec_path");
    };
    let registry = SpecRegistry::from_file(&spec_path)
        .with_context(|| format!("Invalid specification {}", spec_path.display()))?;

    if cli.check_spec {
        println!(
            "Specification OK: {} modules ({})",
            registry.module_names().len(),
            registry.module_names().join(", ")
        );
        return Ok(());
    }

    let observer = Arc::new(build_observer(&config, registry)?);
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    let (shutdown_sender, shutdown_receiver) = watch::channel(false);
    let shutdown_sender = Arc::new(shutdown_sender);
    {
        let shutdown_sender = Arc::clone(&shutdown_sender);
        ctrlc::set_handler(move || {
            info!("Received interrupt signal (SIGINT), shutting down gracefully...");
            shutdown_sender.send_replace(true);
        })
        .context("Error setting SIGINT handler for graceful shutdown")?;
    }

    let (record_sender, record_receiver) = mpsc::channel();
    let mut reader = EventReader::new(record_sender);
    reader.start(std::io::BufReader::new(std::io::stdin()));

    let ingest_thread = spawn_ingest_thread(
        Arc::clone(&observer),
        record_receiver,
        Arc::clone(&shutdown_sender),
    );

    info!("Observer is running. Press Ctrl+C to stop.");
    runtime.block_on(run_checks(
        Arc::clone(&observer),
        config.observer.check_interval_seconds,
        shutdown_receiver,
    ));

    // stdin may still be blocked in a read; the reader thread is not joined
    reader.stop();
    if ingest_thread.join().is_err() {
        error!("Ingest thread panicked");
    }

    let window = config.observer.report_window();
    let report = runtime.block_on(observer.health_report(window, chrono::Utc::now()));
    print_report(&report)?;

    if !report.is_healthy() {
        warn!(
            "Shutting down with {} critical issues and {} failed alerts",
            report.issues.count(specwatch::Severity::Critical),
            report.failed_alerts.len()
        );
    }
    info!("Observer shutdown complete");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting specwatch");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
