//! Unraid Service - Background GraphQL poller.
//!
//! Run with: `cargo run -p unraid-service -- run`

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use unraid_core::{ConnectionResolver, QueryExecutor};
use unraid_service::{Config, ConfigError, Poller, PollerState};

/// Unraid Service - Background GraphQL poller.
#[derive(Parser, Debug)]
#[command(name = "unraid-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server host (overrides config).
    #[arg(long, global = true)]
    host: Option<String>,

    /// API key (overrides config).
    #[arg(long, global = true)]
    api_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the configured jobs in the foreground (default behavior).
    Run,

    /// Discover how to reach the server and print the result as JSON.
    Discover,

    /// Run one GraphQL document and print the returned data.
    Query {
        /// GraphQL document.
        document: String,

        /// Variables as a JSON object.
        #[arg(long)]
        variables: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("unraid_service=info".parse()?)
                .add_directive("unraid_core=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Discover) => discover(config).await,
        Some(Command::Query {
            document,
            variables,
        }) => query(config, &document, variables.as_deref()).await,
        Some(Command::Run) | None => run(config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(api_key) = &args.api_key {
        config.server.api_key = api_key.clone();
    }
    Ok(config)
}

fn executor() -> anyhow::Result<QueryExecutor> {
    let resolver = Arc::new(ConnectionResolver::http()?);
    Ok(QueryExecutor::new(resolver)?)
}

async fn discover(config: Config) -> anyhow::Result<()> {
    anyhow::ensure!(
        !config.server.host.trim().is_empty(),
        "No server host configured; pass --host or set server.host"
    );

    let resolver = ConnectionResolver::http()?;
    let result = resolver
        .discover(&config.server.host, &config.server.discovery_options())
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn query(config: Config, document: &str, variables: Option<&str>) -> anyhow::Result<()> {
    let errors = config.server.validate();
    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors).into());
    }

    let variables: Value = match variables {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(Default::default()),
    };
    anyhow::ensure!(variables.is_object(), "--variables must be a JSON object");

    let executor = executor()?;
    let data: Value = executor
        .execute(&config.server.connection(), document, variables)
        .await?;

    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let executor = executor()?;
    let mut connection = config.server.connection();
    executor.resolve(&mut connection).await?;
    info!(
        "Using {} (ssl mode: {})",
        connection.resolved_url().unwrap_or_default(),
        connection.transport_mode()
    );

    let state = PollerState::new(config.server.broadcast_buffer);
    let poller = Poller::new(Arc::clone(&state), executor, connection);
    poller.register_jobs(&config)?;

    // Print every result as a JSON line.
    let mut events = state.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event printer fell behind, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    poller.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    poller.shutdown().await;
    printer.abort();

    Ok(())
}
