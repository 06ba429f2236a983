//! Tunnel processes.
//!
//! The controller only sees [`TunnelProcess`] and opaque [`TunnelHandle`]s.
//! [`FrpcTunnels`] is the production implementation: one `frpc` child process
//! per endpoint.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::SidecarError;
use crate::source::{EndpointDescriptor, EndpointKind};

/// Reference to one running tunnel.
///
/// Two handles are equal only if they refer to the same started tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelHandle {
    /// Unique per started tunnel.
    pub id: u64,
    /// Endpoint identity the tunnel was started for.
    pub identity: String,
}

/// Starts and stops the tunnel carrying traffic for one endpoint.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// Start a tunnel. Import endpoints bind to `virtual_ip`; other kinds get
    /// `None`. Returns once the tunnel is running.
    async fn start(
        &self,
        identity: &str,
        descriptor: &EndpointDescriptor,
        virtual_ip: Option<Ipv4Addr>,
    ) -> Result<TunnelHandle, SidecarError>;

    /// Stop a previously started tunnel.
    async fn stop(&self, handle: &TunnelHandle) -> Result<(), SidecarError>;
}

/// Build the `frpc` argument list for an endpoint.
pub fn frpc_args(
    identity: &str,
    descriptor: &EndpointDescriptor,
    virtual_ip: Option<Ipv4Addr>,
) -> Result<Vec<String>, SidecarError> {
    let invalid = |reason: &str| SidecarError::TunnelStart {
        identity: identity.to_string(),
        reason: reason.to_string(),
    };

    if descriptor.secret.is_empty() {
        return Err(invalid("secret is empty"));
    }
    if descriptor.tunnel_server_address.is_empty() {
        return Err(invalid("tunnel server address is empty"));
    }

    let mut args: Vec<String> = match &descriptor.kind {
        EndpointKind::Import => {
            let Some(virtual_ip) = virtual_ip else {
                return Err(invalid("import endpoint has no virtual IP"));
            };
            vec![
                "stcp".into(),
                "visitor".into(),
                "-n".into(),
                identity.into(),
                "--server-name".into(),
                identity.into(),
                "--sk".into(),
                descriptor.secret.clone(),
                "--bind-addr".into(),
                virtual_ip.to_string(),
                "--bind-port".into(),
                descriptor.port.to_string(),
            ]
        }
        EndpointKind::Export => vec![
            "stcp".into(),
            "server".into(),
            "-n".into(),
            identity.into(),
            "--sk".into(),
            descriptor.secret.clone(),
            "--local-port".into(),
            descriptor.port.to_string(),
        ],
        EndpointKind::Relay {
            source_server,
            target_server,
        } => {
            if source_server.is_empty() || target_server.is_empty() {
                return Err(invalid("relay source or target server is empty"));
            }
            vec![
                "stcp".into(),
                "relay".into(),
                "-n".into(),
                identity.into(),
                "--source-server".into(),
                source_server.clone(),
                "--target-server".into(),
                target_server.clone(),
                "--sk".into(),
                descriptor.secret.clone(),
            ]
        }
    };

    args.extend([
        "-s".to_string(),
        descriptor.tunnel_server_address.clone(),
        "-P".to_string(),
        descriptor.tunnel_server_port.to_string(),
    ]);

    Ok(args)
}

/// Runs one external `frpc` process per tunnel.
pub struct FrpcTunnels {
    binary: PathBuf,
    startup_grace: Duration,
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
}

impl FrpcTunnels {
    /// Create a factory spawning `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            startup_grace: Duration::from_millis(200),
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// How long a freshly spawned process must survive to count as started.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Number of tunnel processes currently tracked.
    pub fn running(&self) -> usize {
        self.children.lock().len()
    }
}

#[async_trait]
impl TunnelProcess for FrpcTunnels {
    async fn start(
        &self,
        identity: &str,
        descriptor: &EndpointDescriptor,
        virtual_ip: Option<Ipv4Addr>,
    ) -> Result<TunnelHandle, SidecarError> {
        let args = frpc_args(identity, descriptor, virtual_ip)?;
        let start_error = |reason: String| SidecarError::TunnelStart {
            identity: identity.to_string(),
            reason,
        };

        info!(
            identity,
            binary = %self.binary.display(),
            virtual_ip = ?virtual_ip,
            "starting tunnel process"
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| start_error(e.to_string()))?;

        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Err(start_error(format!("exited immediately: {status}"))),
            Err(e) => return Err(start_error(e.to_string())),
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(identity, id, pid = child.id(), "tunnel process running");
        self.children.lock().insert(id, child);

        Ok(TunnelHandle {
            id,
            identity: identity.to_string(),
        })
    }

    async fn stop(&self, handle: &TunnelHandle) -> Result<(), SidecarError> {
        let child = self.children.lock().remove(&handle.id);
        let Some(mut child) = child else {
            return Err(SidecarError::TunnelStop {
                identity: handle.identity.clone(),
                reason: format!("no tunnel process with id {}", handle.id),
            });
        };

        info!(identity = %handle.identity, id = handle.id, "stopping tunnel process");

        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(identity = %handle.identity, %status, "tunnel process had already exited");
                Ok(())
            }
            _ => child.kill().await.map_err(|e| SidecarError::TunnelStop {
                identity: handle.identity.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
