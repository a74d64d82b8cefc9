//! hop-relay: reverse proxy for a single upstream.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::Listener ──▶ http::server (sniff)
//!                                    │
//!                  ┌─────────────────┴──────────────────┐
//!                  ▼                                    ▼
//!          Proxy::handle_web                    Proxy::handle_upgrade
//!          (hyper, HTTP/1.1 + h2)               (raw socket, HTTP/1.1)
//!                  │                                    │
//!                  ▼                                    ▼
//!          security::headers ──▶ outbound HTTP/1.1 ──▶ Upstream
//!                  │                                    │
//!                  ▼                                    ▼
//!          ResponseRelay                        UpgradeTunnel
//!
//!     Cross-cutting: config, handlers (pools, error routing),
//!     observability, resilience (idle timeouts), lifecycle
//! ```

use std::path::PathBuf;

use clap::Parser;

use hop_relay::config::validation::validate_config;
use hop_relay::config::{load_config, ConfigError, ProxyConfig};
use hop_relay::lifecycle::{shutdown_signal, Shutdown};
use hop_relay::net::Listener;
use hop_relay::observability::{logging, metrics};
use hop_relay::HttpServer;

#[derive(Parser)]
#[command(name = "hop-relay")]
#[command(about = "Reverse proxy for a single upstream", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream as HOST:PORT, overrides `[upstream]`
    #[arg(short, long, value_parser = parse_upstream)]
    upstream: Option<(String, u16)>,

    /// Name added to `Via`, overrides `proxy_name`
    #[arg(long)]
    proxy_name: Option<String>,
}

fn parse_upstream(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("`{value}` is not HOST:PORT"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port `{port}`: {e}"))?;
    Ok((host.trim_matches(['[', ']']).to_string(), port))
}

fn resolve_config(cli: Cli) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }
    if let Some((hostname, port)) = cli.upstream {
        config.upstream.hostname = hostname;
        config.upstream.port = port;
    }
    if let Some(name) = cli.proxy_name {
        config.proxy_name = Some(name);
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(Cli::parse())?;

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hop-relay starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        upstream = %format!("{}:{}", config.upstream.hostname, config.upstream.port),
        request_timeout_ms = config.timeouts.request_ms,
        proxy_timeout_ms = config.timeouts.proxy_ms,
        proxy_name = config.proxy_name.as_deref().unwrap_or("-"),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    shutdown.trigger_on(shutdown_signal());

    HttpServer::from_config(&config)
        .run(listener, shutdown)
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_argument_splits_on_last_colon() {
        assert_eq!(
            parse_upstream("backend:9000").unwrap(),
            ("backend".to_string(), 9000)
        );
        assert_eq!(parse_upstream("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(parse_upstream("backend").is_err());
        assert!(parse_upstream("backend:http").is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "hop-relay",
            "--listen",
            "127.0.0.1:0",
            "--upstream",
            "10.0.0.2:8000",
            "--proxy-name",
            "edge",
        ]);
        let config = resolve_config(cli).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:0");
        assert_eq!(config.upstream.hostname, "10.0.0.2");
        assert_eq!(config.upstream.port, 8000);
        assert_eq!(config.proxy_name.as_deref(), Some("edge"));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let cli = Cli::parse_from(["hop-relay", "--proxy-name", "a,b"]);
        assert!(matches!(
            resolve_config(cli),
            Err(ConfigError::Validation(_))
        ));
    }
}
