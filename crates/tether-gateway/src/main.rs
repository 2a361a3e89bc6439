//! # tether-gateway
//!
//! Gateway binary: loads layered settings, installs logging and metrics,
//! wires the key-set cache into the token validator and serves device
//! sockets until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_auth::{HttpKeySetFetcher, KeySetCache, KeySetCacheConfig, TokenValidator};
use tether_core::logging::{LogFormat, init_subscriber};
use tether_server::{GatewayConfig, GatewayServer, metrics};
use tether_settings::GatewaySettings;

/// Tether device session gateway.
#[derive(Parser, Debug)]
#[command(name = "tether-gateway", about = "Authenticated realtime device gateway")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. `info` or `tether_server=debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `compact` or `json` (overrides settings).
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<GatewaySettings> {
        let mut settings = match &self.config {
            Some(path) => tether_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => tether_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            settings.logging.format.clone_from(format);
        }
        Ok(settings)
    }
}

fn build_validator(settings: &GatewaySettings) -> Result<TokenValidator> {
    let key_set = &settings.auth.key_set;
    let fetcher = HttpKeySetFetcher::new(
        key_set.url_template.clone(),
        Duration::from_millis(key_set.fetch_timeout_ms),
    )
    .context("Failed to build key-set HTTP client")?;
    let cache = KeySetCache::new(Arc::new(fetcher), KeySetCacheConfig::from(key_set));
    Ok(TokenValidator::new(cache))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    let format = LogFormat::parse(&settings.logging.format).unwrap_or_default();
    init_subscriber(&settings.logging.level, format);

    let config = GatewayConfig::from_settings(&settings).context("Invalid settings")?;
    let metrics_handle =
        metrics::install_recorder().context("Failed to install metrics recorder")?;
    let validator = build_validator(&settings)?;
    let shutdown_timeout = config.shutdown_timeout;

    let server = GatewayServer::new(config, validator, metrics_handle);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    tracing::info!(
        issuer = %settings.auth.issuer,
        audience = %settings.auth.audience,
        control_plane = settings.control_plane.enabled,
        "Tether gateway listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let drained = server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(shutdown_timeout))
        .await;
    tracing::info!(drained, "Shutdown complete");
    Ok(())
}
