use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kpi_collector::{
    digest, parse_reference_date, run_scheduled, Config, IdentityResolver, MongoStore, Pipeline,
    SnapshotPublisher, StatsPoster,
};
use nostr_core::{RelayConnector, SdkConnector};

#[derive(Parser)]
#[command(name = "kpi")]
#[command(about = "Trustroots and Nostroots KPI collector")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "kpi.toml", global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect on a schedule (the default)
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Reference date (YYYY-MM-DD) for the first cycle
        #[arg(long)]
        date: Option<String>,

        /// Post the daily digest after each successful cycle
        #[arg(long)]
        post: bool,
    },
    /// Test configuration and connectivity
    Test,
    /// Print the digest of a published snapshot
    Digest {
        /// Snapshot to read; defaults to the configured output path
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run {
        once: false,
        date: None,
        post: false,
    });

    if let Commands::Version = command {
        print_version();
        return Ok(());
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    init_logging(&config.logging.level)?;

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    match command {
        Commands::Run { once, date, post } => run_collector(config, once, date, post).await,
        Commands::Test => test_config(&config).await,
        Commands::Digest { input } => print_digest(&config, input),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn print_version() {
    println!("kpi v{}", env!("CARGO_PKG_VERSION"));
}

async fn run_collector(config: Config, once: bool, date: Option<String>, post: bool) -> Result<()> {
    tracing::info!("Starting KPI collector v{}", env!("CARGO_PKG_VERSION"));

    let reference = date
        .as_deref()
        .map(parse_reference_date)
        .transpose()
        .with_context(|| "Invalid --date, expected YYYY-MM-DD")?;
    if let Some(reference) = reference {
        tracing::info!("Running for specific date: {}", reference.date_naive());
    }

    let store = MongoStore::connect(&config.store.uri, &config.store.database, config.store_timeout())
        .await
        .with_context(|| "Failed to connect to MongoDB")?;
    let connector: Arc<dyn RelayConnector> = Arc::new(SdkConnector::new());
    let pipeline = Pipeline::from_config(&config, Arc::new(store.clone()), connector)
        .with_context(|| "Failed to build collection pipeline")?;

    if post && !pipeline.can_post() {
        tracing::warn!("--post given but no usable stats nsec is configured");
    }

    if once {
        let outcome = pipeline.run_cycle(reference, post).await;
        store.close().await;
        outcome.with_context(|| "Collection cycle failed")?.log();
        return Ok(());
    }

    let shutdown = shutdown_signal()?;

    tracing::info!(
        "KPI service started. Updating every {} minutes. Output: {}",
        config.schedule.interval_minutes,
        config.resolve_output_path()?.display()
    );

    run_scheduled(&pipeline, config.interval(), reference, post, shutdown).await;

    tracing::info!("Received shutdown signal, stopping collector...");
    store.close().await;
    Ok(())
}

async fn test_config(config: &Config) -> Result<()> {
    println!("Testing configuration...");
    println!("✓ Configuration is valid");

    let output = config.resolve_output_path()?;
    println!("  Output: {}", output.display());

    let store = MongoStore::connect(&config.store.uri, &config.store.database, config.store_timeout())
        .await
        .with_context(|| "Failed to connect to MongoDB")?;
    println!("✓ MongoDB connection successful ({})", config.store.database);
    let with_npub = IdentityResolver::new(Arc::new(store.clone()), config.store_timeout())
        .count_with_key_field()
        .await
        .with_context(|| "Failed to count users with npubs")?;
    println!("  Users with an npub set: {}", with_npub);
    store.close().await;

    let connector = SdkConnector::new();
    for url in &config.relays.urls {
        match connector.connect(url, config.connect_timeout()).await {
            Ok(session) => {
                session.close().await;
                println!("✓ Relay reachable: {}", url);
            }
            Err(e) => println!("⚠ Relay unreachable: {} ({:#})", url, e),
        }
    }

    match config.poster.nsec.as_deref() {
        None => println!("  No stats nsec configured, digest posting disabled"),
        Some(nsec) => {
            let poster = StatsPoster::from_nsec(
                Arc::new(connector),
                config.relays.urls.clone(),
                nsec,
                config.connect_timeout(),
                config.poster.digest_link.clone(),
            )
            .with_context(|| "Failed to create keys from stats nsec")?;
            println!("✓ Stats key is valid");
            println!("  Public key: {}", poster.keys().public_key());
        }
    }

    println!("\nConfiguration test completed successfully!");
    Ok(())
}

fn print_digest(config: &Config, input: Option<PathBuf>) -> Result<()> {
    let path = match input {
        Some(path) => path,
        None => config.resolve_output_path()?,
    };
    let snapshot = SnapshotPublisher::read(&path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    println!("{}", digest(&snapshot, &config.poster.digest_link));
    Ok(())
}

/// Install the signal handlers now; the returned future resolves on the
/// first SIGTERM, SIGINT or Ctrl+C.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            },
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
            },
            _ = signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C");
            }
        }
    })
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();

    Ok(())
}
