// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! roomhub daemon
//!
//! Discovers room devices on the local network and bridges them to the
//! cloud relay.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, credentials kept in memory
//! roomhubd --password changeme
//!
//! # Configuration file with overrides
//! roomhubd --config /etc/roomhub.toml --interfaces eth0,wlan0 --log-level debug
//!
//! # Write a default configuration file
//! roomhubd gen-config --output roomhub.toml
//!
//! # Check a configuration file
//! roomhubd validate --config roomhub.toml
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;

use clap::{Parser, Subcommand};
use roomhub::{ConfigError, Hub, HubConfig, HubError};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum DaemonError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Hub(#[from] HubError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// roomhub - local IoT aggregation hub
#[derive(Parser, Debug)]
#[command(name = "roomhubd")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Discovers room devices and bridges them to the cloud relay")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interfaces to broadcast on (comma-separated, empty for all)
    #[arg(long, value_delimiter = ',')]
    interfaces: Option<Vec<String>>,

    /// Discovery period in milliseconds
    #[arg(long)]
    discovery_period_ms: Option<u64>,

    /// UDP port beacons are sent to
    #[arg(long)]
    broadcast_port: Option<u16>,

    /// Heartbeat period in milliseconds
    #[arg(long)]
    heartbeat_period_ms: Option<u64>,

    /// Device connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Credential file
    #[arg(long)]
    credentials_file: Option<PathBuf>,

    /// Default password for devices without a stored token
    #[arg(long)]
    password: Option<String>,

    /// Relay websocket URL
    #[arg(long)]
    relay_url: Option<String>,

    /// Hub token for the relay
    #[arg(long)]
    relay_token: Option<String>,

    /// Base URL of the HTTP API
    #[arg(long)]
    http_base: Option<String>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "roomhub.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("roomhubd: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), DaemonError> {
    match &args.command {
        Some(Commands::GenConfig { output }) => return gen_config(output),
        Some(Commands::Validate { config }) => return validate(config),
        None => {}
    }

    let config = build_config(&args)?;
    init_logging(&config.log_level);

    let hub = Hub::start(config)?;
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "roomhubd running, Ctrl+C to stop");
    let _ = stop_rx.recv();

    tracing::info!("stopping");
    hub.shutdown();

    let metrics = hub.metrics();
    tracing::info!(
        connections_opened = metrics.reactor.connections_opened,
        connections_closed = metrics.reactor.connections_closed,
        frames_in = metrics.reactor.frames_received,
        frames_out = metrics.reactor.frames_sent,
        frames_rejected = metrics.reactor.framing_errors,
        beacons_sent = metrics.discovery.beacons_sent,
        responses_parsed = metrics.discovery.responses_parsed,
        relay_sent = metrics.relay.sent,
        relay_received = metrics.relay.received,
        relay_connects = metrics.relay.connects,
        pending_passwords = metrics.pending_passwords,
        "roomhubd stopped"
    );
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// File (or defaults) with command line overrides applied.
fn build_config(args: &Args) -> Result<HubConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => HubConfig::from_file(path)?,
        None => HubConfig::default(),
    };

    if let Some(interfaces) = &args.interfaces {
        config.discovery.interfaces = interfaces
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
    }
    if let Some(period) = args.discovery_period_ms {
        config.discovery.period_ms = period;
    }
    if let Some(port) = args.broadcast_port {
        config.discovery.broadcast_port = port;
    }
    if let Some(period) = args.heartbeat_period_ms {
        config.manager.heartbeat_period_ms = period;
    }
    if let Some(timeout) = args.connect_timeout_ms {
        config.manager.connect_timeout_ms = timeout;
    }
    if let Some(path) = &args.credentials_file {
        config.credentials.file = Some(path.clone());
    }
    if let Some(password) = &args.password {
        config.credentials.default_password = Some(password.clone());
    }
    if let Some(url) = &args.relay_url {
        config.relay.url = url.clone();
    }
    if let Some(token) = &args.relay_token {
        config.relay.token = Some(token.clone());
    }
    if let Some(base) = &args.http_base {
        config.relay.http_base = base.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn gen_config(output: &Path) -> Result<(), DaemonError> {
    let text = HubConfig::default().to_toml()?;
    std::fs::write(output, text)?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

fn validate(path: &Path) -> Result<(), DaemonError> {
    let config = HubConfig::from_file(path)?;
    println!("Configuration is valid");
    println!("  Interfaces: {}", describe_interfaces(&config.discovery.interfaces));
    println!("  Relay: {}", config.relay.url);
    println!(
        "  Credentials: {}",
        config
            .credentials
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in memory".to_string())
    );
    Ok(())
}

fn describe_interfaces(interfaces: &[String]) -> String {
    if interfaces.is_empty() {
        "all".to_string()
    } else {
        interfaces.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_arguments() {
        let args = Args::parse_from(["roomhubd"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.discovery.period_ms, 10_000);
        assert_eq!(config.log_level, "info");
        assert!(args.command.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "roomhubd",
            "--interfaces",
            "eth0,wlan0",
            "--password",
            "pw",
            "--relay-url",
            "ws://127.0.0.1:9000/stream/hub/",
            "--relay-token",
            "tok",
            "--heartbeat-period-ms",
            "500",
            "--log-level",
            "debug",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.discovery.interfaces, vec!["eth0", "wlan0"]);
        assert_eq!(config.credentials.default_password.as_deref(), Some("pw"));
        assert_eq!(config.relay.url, "ws://127.0.0.1:9000/stream/hub/");
        assert_eq!(config.relay.token.as_deref(), Some("tok"));
        assert_eq!(config.manager.heartbeat_period_ms, 500);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::parse_from(["roomhubd", "--relay-url", "http://example.com/"]);
        assert!(matches!(build_config(&args), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_gen_config_then_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roomhub.toml");
        gen_config(&path).unwrap();
        validate(&path).unwrap();

        let args = Args::parse_from([
            "roomhubd",
            "--config",
            path.to_str().unwrap(),
            "--interfaces",
            "",
        ]);
        let config = build_config(&args).unwrap();
        assert!(config.discovery.interfaces.is_empty());
        assert_eq!(describe_interfaces(&config.discovery.interfaces), "all");
    }

    #[test]
    fn test_subcommands_parse() {
        let args = Args::parse_from(["roomhubd", "gen-config", "--output", "x.toml"]);
        assert!(matches!(args.command, Some(Commands::GenConfig { .. })));
        let args = Args::parse_from(["roomhubd", "validate", "--config", "x.toml"]);
        assert!(matches!(args.command, Some(Commands::Validate { .. })));
    }
}
