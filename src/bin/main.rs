//! servicekeel binary entry point.

use clap::Parser;
use servicekeel::{telemetry, Config, Sidecar};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// DNS hijacking resolver and tunnel reconciler for remote cluster services.
#[derive(Parser, Debug)]
#[command(name = "servicekeel")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Optional if everything is set by flags or env.
    #[arg(short, long, default_value = "servicekeel.toml")]
    config: PathBuf,

    /// Comma-separated service names to watch (overrides controller.watch_list).
    #[arg(long, env = "SIDECAR_MAPPED_SERVICES", value_delimiter = ',')]
    mapped_services: Option<Vec<String>>,

    /// Virtual IP range (overrides dns.ip_range).
    #[arg(long, env = "SIDECAR_IP_RANGE")]
    ip_range: Option<String>,

    /// DNS listen address (overrides dns.listen_addr).
    #[arg(long, env = "SIDECAR_DNS_ADDR")]
    dns_addr: Option<SocketAddr>,
}

fn load_config(args: &Args) -> Result<Config, config::ConfigError> {
    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("SERVICEKEEL")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("controller.watch_list")
                .with_list_parse_key("controller.alias_suffixes")
                .with_list_parse_key("dns.search_domains")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    if let Some(services) = &args.mapped_services {
        config.controller.watch_list = services
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(ip_range) = &args.ip_range {
        config.dns.ip_range = ip_range.clone();
    }
    if let Some(dns_addr) = args.dns_addr {
        config.dns.listen_addr = dns_addr;
    }

    Ok(config)
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = load_config(&args)?;

    telemetry::init(&config.telemetry)?;

    config.validate()?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        ip_range = %config.dns.ip_range,
        services = ?config.controller.watch_list,
        "Starting servicekeel"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = Sidecar::new(config).run(shutdown).await;

    telemetry::shutdown();

    if let Err(e) = result {
        error!("sidecar error: {}", e);
        return Err(e.into());
    }

    info!("servicekeel shutdown complete");
    Ok(())
}
