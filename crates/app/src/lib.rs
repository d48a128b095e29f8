use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use graphcap_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use graphcap_core::logging::{
    self, FileSink, LoggingOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use graphcap_core::media::webp::warm_webp_cache;
use graphcap_core::providers::{seed_defaults, ProviderStore};
use graphcap_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(
    name = "graphcap",
    about = "Image dataset server with a batch caption queue"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the HTTP server and the batch queue worker (default).
    Serve,
    /// Insert the default inference providers that are not present yet.
    SeedProviders,
    /// Convert workspace images into the WebP cache and exit.
    WarmWebp,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    let command = cli.command.unwrap_or(Commands::Serve);
    log_startup_metadata(&command, &resolved_data_dir);

    match command {
        Commands::Serve => run_server(cli.port, cli.host, resolved_data_dir).await,
        Commands::SeedProviders => seed_providers(resolved_data_dir).await,
        Commands::WarmWebp => warm_webp(resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_filters(&options);

    match logging::build_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let console_env_filter =
                parse_env_filter_with_fallback(&filters.console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&filters.file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::Unavailable {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter =
                parse_env_filter_with_fallback(&filters.console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Serve => "serve",
        Commands::SeedProviders => "seed-providers",
        Commands::WarmWebp => "warm-webp",
    }
}

fn log_startup_metadata(command: &Commands, data_dir: &Path) {
    info!(
        command = command_name(command),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn ensure_data_dir(data_dir: &Path) {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    ensure_data_dir(data_dir);
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// CLI flag, then `PORT`, then the config file.
fn resolve_port(cli_port: Option<u16>, env_port: Option<&str>, config_port: u16) -> u16 {
    cli_port
        .or_else(|| env_port.and_then(|value| value.trim().parse().ok()))
        .unwrap_or(config_port)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);
    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());
    let features = config.features;

    let state = AppState::new(config, config_path(&data_dir), data_dir)?;

    let providers = state.provider_store().clone();
    match tokio::task::spawn_blocking(move || seed_defaults(&providers)).await? {
        Ok(0) => {}
        Ok(inserted) => info!(inserted, "Seeded default inference providers"),
        Err(err) => warn!(error = ?err, "Failed to seed default providers"),
    }

    if features.webp_cache {
        let paths = state.paths().clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || warm_webp_cache(&paths)).await {
                Ok(Ok(report)) => info!(
                    generated = report.generated,
                    skipped = report.skipped,
                    failed = report.failed,
                    "WebP cache warmed"
                ),
                Ok(Err(err)) => warn!(error = ?err, "WebP cache warm-up failed"),
                Err(err) => warn!(error = %err, "WebP cache warm-up task panicked"),
            }
        });
    }

    let shutdown = CancellationToken::new();
    let worker = if features.batch_queue {
        let backend = Arc::new(state.http_caption_backend().await);
        Some(state.spawn_queue_worker(backend, shutdown.clone()))
    } else {
        info!("Batch queue disabled by feature flag; worker not started");
        None
    };

    let app = app_router(state);
    let addr = format!("{host}:{port}");
    info!(%addr, "Starting graphcap server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_ctrl_c().await;
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(worker) = worker {
        if let Err(err) = worker.await {
            warn!(error = %err, "Queue worker ended abnormally");
        }
    }
    info!("graphcap server stopped");
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            warn!(error = %err, "Failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

async fn seed_providers(data_dir: PathBuf) -> Result<()> {
    ensure_data_dir(&data_dir);
    let inserted = tokio::task::spawn_blocking(move || -> Result<usize> {
        let store = ProviderStore::new(&data_dir)?;
        seed_defaults(&store)
    })
    .await??;
    info!(inserted, "Default providers seeded");
    println!("Inserted {inserted} provider(s)");
    Ok(())
}

async fn warm_webp(data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let paths = config.paths.resolve(&data_dir);
    let report = tokio::task::spawn_blocking(move || warm_webp_cache(&paths)).await??;
    println!(
        "WebP cache: {} generated, {} up to date, {} failed",
        report.generated, report.skipped, report.failed
    );
    Ok(())
}
