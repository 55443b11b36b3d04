//! Command-line interface
//!
//! `morrigan` with no subcommand (or `start`) runs the server; the rest are
//! operator helpers.

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config;

#[derive(Parser)]
#[command(name = "morrigan", version, about = "Morrigan control server - connection provider")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server (default)
    Start,

    /// Configuration inspection helpers
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Query a running server for its connection records
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = config::DEFAULT_PORT)]
        port: u16,
        /// API token for the read endpoints
        #[arg(long)]
        token: Option<String>,
    },

    /// Print the version
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved configuration
    Show,
    /// Print one config value by dotted key (e.g. server.port)
    Get { key: String },
    /// Print the config file path
    Path,
}

pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

pub fn handle_config_get(key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let pointer = format!("/{}", key.replace('.', "/"));
    match cfg.pointer(&pointer) {
        Some(value) => println!("{value}"),
        None => println!("null"),
    }
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

pub fn handle_version() {
    println!("morrigan v{}", env!("CARGO_PKG_VERSION"));
}

/// Fetch and print the connection records of a running server.
pub async fn handle_status(
    host: &str,
    port: u16,
    token: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("http://{host}:{port}/api/connection");
    let mut request = reqwest::Client::new().get(&url);
    if let Some(token) = token {
        request = request.header(reqwest::header::AUTHORIZATION, token);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(format!("status request failed: {}", response.status()).into());
    }
    let records: Vec<Value> = response.json().await?;
    println!("{} connection(s)", records.len());
    for record in &records {
        let id = record.get("id").and_then(Value::as_str).unwrap_or("?");
        let client = record.get("clientId").and_then(Value::as_str).unwrap_or("?");
        let open = record.get("open").and_then(Value::as_bool).unwrap_or(false);
        let alive = record.get("alive").and_then(Value::as_bool).unwrap_or(false);
        println!("  {id}  client={client}  open={open}  alive={alive}");
    }
    Ok(())
}
