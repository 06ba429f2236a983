//! DNS server setup and sidecar lifecycle management.

use hickory_server::ServerFuture;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::controller::Controller;
use crate::error::SidecarError;
use crate::handler::HijackHandler;
use crate::source::{ClusterStateSource, FileStateSource};
use crate::state::DnsState;
use crate::tunnel::{FrpcTunnels, TunnelProcess};

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit pool metrics.
async fn metrics_loop(state: DnsState, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                state.emit_metrics();
                debug!(
                    mappings = state.mappings_count(),
                    aliases = state.aliases_count(),
                    capacity = state.capacity(),
                    "emitted pool metrics"
                );
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Bind a UDP socket on `addr`, falling back to the wildcard address on the
/// same port if `addr` itself cannot be bound.
pub async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, SidecarError> {
    let err = match UdpSocket::bind(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => e,
    };

    let wildcard: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    if addr.ip() == wildcard {
        return Err(err.into());
    }

    let fallback = SocketAddr::new(wildcard, addr.port());
    warn!(addr = %addr, fallback = %fallback, error = %err, "failed to bind, trying wildcard address");
    Ok(UdpSocket::bind(fallback).await?)
}

/// UDP DNS server answering from a [`HijackHandler`].
pub struct DnsServer {
    server: ServerFuture<HijackHandler>,
    local_addr: SocketAddr,
}

impl DnsServer {
    /// Bind the listener. Queries are served as soon as this returns.
    pub async fn bind(listen_addr: SocketAddr, handler: HijackHandler) -> Result<Self, SidecarError> {
        let socket = bind_udp(listen_addr).await?;
        let local_addr = socket.local_addr()?;

        let mut server = ServerFuture::new(handler);
        server.register_socket(socket);
        info!(addr = %local_addr, "DNS UDP listening");

        Ok(Self { server, local_addr })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` fires, then let in-flight queries finish.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SidecarError> {
        let requested = tokio::select! {
            _ = shutdown.cancelled() => true,
            result = self.server.block_until_done() => {
                result?;
                false
            }
        };

        if requested {
            info!("DNS server shutdown requested");
            self.server.shutdown_gracefully().await?;
        }

        info!("DNS server stopped");
        Ok(())
    }
}

/// The resolver and the reconciliation controller, wired together.
pub struct Sidecar {
    config: Config,
}

impl Sidecar {
    /// Create a sidecar from validated or unvalidated configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run with the file-backed desired state and `frpc` tunnels until
    /// `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SidecarError> {
        let source = Arc::new(FileStateSource::new(
            self.config.source.path.clone(),
            self.config.tunnel.default_server_port,
        ));
        let tunnels = Arc::new(FrpcTunnels::new(self.config.tunnel.binary.clone()));

        self.run_with(source, tunnels, shutdown).await
    }

    /// Run with the given collaborators until `shutdown` fires.
    ///
    /// On shutdown the controller loop is stopped, the DNS listener is closed
    /// and every tunnel and mapping still held is released.
    pub async fn run_with(
        self,
        source: Arc<dyn ClusterStateSource>,
        tunnels: Arc<dyn TunnelProcess>,
        shutdown: CancellationToken,
    ) -> Result<(), SidecarError> {
        let config = self.config;
        config.validate()?;

        info!(
            listen_addr = %config.dns.listen_addr,
            ip_range = %config.dns.ip_range,
            services = config.controller.watch_list.len(),
            "Starting servicekeel sidecar"
        );

        let state = DnsState::new(&config.dns.ip_range)?;
        let search_domains = config.dns.effective_search_domains()?;
        if !search_domains.is_empty() {
            info!(domains = ?search_domains, "using search domains");
        }
        state.set_search_domains(search_domains);

        let handler = HijackHandler::new(state.clone()).with_ttl(config.dns.ttl);
        let server = DnsServer::bind(config.dns.listen_addr, handler).await?;

        let controller = Controller::new(
            config.controller.settings("sidecar"),
            state.clone(),
            source,
            tunnels,
        )?;
        controller.start();

        let metrics_handle = tokio::spawn(metrics_loop(state, shutdown.clone()));

        let result = server.run(shutdown.clone()).await;
        if let Err(ref e) = result {
            error!(error = %e, "DNS server error");
        }

        // Stop everything else even if the server ended on its own.
        shutdown.cancel();
        controller.shutdown().await;
        if let Err(e) = metrics_handle.await {
            warn!(error = %e, "metrics loop ended abnormally");
        }

        info!("servicekeel sidecar stopped");
        result
    }
}
