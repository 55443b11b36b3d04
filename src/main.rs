use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use morrigan::cli::{self, Cli, Command, ConfigCommand};
use morrigan::config;
use morrigan::connection::ConnectionServiceBuilder;
use morrigan::identity::StaticIdentityProvider;
use morrigan::logging;
use morrigan::server::{self, ServerConfig};
use morrigan::store::DocumentStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Get { key } => cli::handle_config_get(&key)?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Status { host, port, token }) => {
            cli::handle_status(&host, port, token.as_deref()).await
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the connection provider server.
async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;
    let cfg = config::load_config()?;

    let state_dir = config::get_state_dir();
    std::fs::create_dir_all(&state_dir)?;

    let store = Arc::new(DocumentStore::open(state_dir.join("store"))?);
    let identity = Arc::new(StaticIdentityProvider::from_config(&cfg));

    let server_id = cfg
        .pointer("/server/id")
        .and_then(Value::as_str)
        .unwrap_or("srv-local")
        .to_string();
    let mut builder = ConnectionServiceBuilder::new(server_id.clone(), store, identity);
    if let Some(secret) = cfg.pointer("/tokens/secret").and_then(Value::as_str) {
        builder = builder.token_secret(secret.as_bytes().to_vec());
    }
    let service = builder.build();

    let bind_address = config::server_address(&cfg).parse()?;
    let endpoint_base = cfg
        .pointer("/server/endpointBase")
        .and_then(Value::as_str)
        .map(str::to_string);
    let api_token = cfg
        .pointer("/api/token")
        .and_then(Value::as_str)
        .map(str::to_string);

    info!("Morrigan connection provider v{}", env!("CARGO_PKG_VERSION"));
    info!("Server id: {}", server_id);
    info!("State directory: {}", state_dir.display());

    let handle = server::run_server_with_config(ServerConfig {
        service,
        bind_address,
        api_token,
        endpoint_base,
    })
    .await?;

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    info!("Server shut down");
    Ok(())
}

/// Initialize logging based on the MORRIGAN_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("MORRIGAN_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or SIGHUP (Unix) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(mut sigterm), Ok(mut sighup)) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
                _ = sighup.recv() => "SIGHUP",
            }
        }
        _ => {
            warn!("Failed to install Unix signal handlers; falling back to Ctrl+C only");
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("Failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
