//! Desired endpoint state.
//!
//! A [`ClusterStateSource`] returns the set of tunnels that should exist. The
//! raw rows it reads ([`DesiredEntry`]) carry a proxy name of the form
//! `<service>:<port>/<protocol>`, which doubles as the endpoint's stable
//! identity.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::SidecarError;

/// Transport protocol of a remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Role of the local tunnel process for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    /// Remote service made reachable locally on the virtual IP.
    Import,
    /// Local service offered to the remote cluster.
    Export,
    /// Traffic forwarded between two tunnel servers.
    Relay {
        /// Tunnel server the traffic comes from.
        source_server: String,
        /// Tunnel server the traffic goes to.
        target_server: String,
    },
}

/// One desired tunnel, as handed to the controller.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Stable identity (`<service>:<port>/<protocol>`).
    pub identity: String,
    /// Service name, used as the DNS mapping name for imports.
    pub service_name: String,
    /// Service port.
    pub port: u16,
    /// Service protocol.
    pub protocol: Protocol,
    /// Tunnel server host.
    pub tunnel_server_address: String,
    /// Tunnel server port.
    pub tunnel_server_port: u16,
    /// Shared secret for the tunnel.
    pub secret: String,
    /// Role of the tunnel process.
    pub kind: EndpointKind,
}

impl EndpointDescriptor {
    /// Only imported services are hijacked in DNS; exports and relays never
    /// bind the virtual IP.
    pub fn needs_mapping(&self) -> bool {
        matches!(self.kind, EndpointKind::Import)
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("identity", &self.identity)
            .field("service_name", &self.service_name)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("tunnel_server_address", &self.tunnel_server_address)
            .field("tunnel_server_port", &self.tunnel_server_port)
            .field("secret", &"<redacted>")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Source of the desired endpoint set.
#[async_trait]
pub trait ClusterStateSource: Send + Sync {
    /// Fetch desired endpoints whose service name is in `watch_list`.
    async fn fetch_endpoints(
        &self,
        watch_list: &[String],
    ) -> Result<Vec<EndpointDescriptor>, SidecarError>;
}

/// A raw desired-state row: one active connection on a tunnel server.
#[derive(Clone, Deserialize)]
pub struct DesiredEntry {
    /// Proxy name, `<service>:<port>/<protocol>`.
    pub proxy_name: String,
    /// Tunnel server host.
    pub server_addr: String,
    /// Tunnel server port; 0 means the default port.
    #[serde(default)]
    pub server_port: u16,
    /// Shared secret.
    #[serde(default)]
    pub secret: String,
    /// Tunnel role.
    #[serde(default, rename = "type")]
    pub kind: EntryKind,
    /// Relay source server, required for relay entries.
    #[serde(default)]
    pub source_server: Option<String>,
    /// Relay target server, required for relay entries.
    #[serde(default)]
    pub target_server: Option<String>,
}

/// Tunnel role as written in desired-state rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// See [`EndpointKind::Import`].
    #[default]
    Import,
    /// See [`EndpointKind::Export`].
    Export,
    /// See [`EndpointKind::Relay`].
    Relay,
}

impl DesiredEntry {
    fn endpoint_kind(&self) -> Result<EndpointKind, SidecarError> {
        match self.kind {
            EntryKind::Import => Ok(EndpointKind::Import),
            EntryKind::Export => Ok(EndpointKind::Export),
            EntryKind::Relay => match (&self.source_server, &self.target_server) {
                (Some(source), Some(target)) => Ok(EndpointKind::Relay {
                    source_server: source.clone(),
                    target_server: target.clone(),
                }),
                _ => Err(SidecarError::MalformedDesiredEntry {
                    entry: self.proxy_name.clone(),
                    reason: "relay entry needs source_server and target_server".to_string(),
                }),
            },
        }
    }
}

impl fmt::Debug for DesiredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredEntry")
            .field("proxy_name", &self.proxy_name)
            .field("server_addr", &self.server_addr)
            .field("server_port", &self.server_port)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Split an identity `<service>:<port>/<protocol>` into its parts.
pub fn parse_identity(identity: &str) -> Result<(String, u16, Protocol), SidecarError> {
    let malformed = |reason: &str| SidecarError::MalformedDesiredEntry {
        entry: identity.to_string(),
        reason: reason.to_string(),
    };

    let (service, rest) = identity
        .rsplit_once(':')
        .ok_or_else(|| malformed("missing ':<port>'"))?;
    let (port, protocol) = rest
        .split_once('/')
        .ok_or_else(|| malformed("missing '/<protocol>'"))?;

    let service = service.trim();
    if service.is_empty() {
        return Err(malformed("empty service name"));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| malformed("port is not a number"))?;
    if port == 0 {
        return Err(malformed("port is zero"));
    }

    let protocol = match protocol.to_ascii_lowercase().as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return Err(malformed("protocol must be tcp or udp")),
    };

    Ok((service.to_string(), port, protocol))
}

/// Turn raw rows into descriptors for the watched services.
///
/// Malformed rows are logged and skipped. When two rows share an identity the
/// first one wins.
pub fn collect_endpoints(
    entries: Vec<DesiredEntry>,
    watch_list: &[String],
    default_server_port: u16,
) -> Vec<EndpointDescriptor> {
    let watched: HashSet<&str> = watch_list.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut endpoints = Vec::with_capacity(entries.len());

    for entry in entries {
        let parsed = parse_identity(&entry.proxy_name)
            .and_then(|parts| Ok((parts, entry.endpoint_kind()?)));
        let ((service_name, port, protocol), kind) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "skipping desired entry");
                continue;
            }
        };

        if !watched.contains(service_name.as_str()) {
            debug!(service = %service_name, "service not watched, skipping");
            continue;
        }

        if !seen.insert(entry.proxy_name.clone()) {
            debug!(identity = %entry.proxy_name, "duplicate desired entry");
            continue;
        }

        let tunnel_server_port = if entry.server_port == 0 {
            default_server_port
        } else {
            entry.server_port
        };

        endpoints.push(EndpointDescriptor {
            identity: entry.proxy_name,
            service_name,
            port,
            protocol,
            tunnel_server_address: entry.server_addr,
            tunnel_server_port,
            secret: entry.secret,
            kind,
        });
    }

    endpoints
}

#[derive(Debug, Deserialize)]
struct DesiredFile {
    #[serde(default)]
    entries: Vec<DesiredEntry>,
}

/// Reads the desired state from a declarative file on every fetch.
///
/// The format follows the extension (`.toml`, `.json`, `.yaml`).
#[derive(Debug, Clone)]
pub struct FileStateSource {
    path: PathBuf,
    default_server_port: u16,
}

impl FileStateSource {
    /// Create a source reading `path`.
    pub fn new(path: impl Into<PathBuf>, default_server_port: u16) -> Self {
        Self {
            path: path.into(),
            default_server_port,
        }
    }

    fn read_entries(&self) -> Result<Vec<DesiredEntry>, SidecarError> {
        let file: DesiredFile = ::config::Config::builder()
            .add_source(::config::File::from(self.path.as_path()))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                SidecarError::DesiredStateFetch(format!("{}: {e}", self.path.display()))
            })?;

        Ok(file.entries)
    }
}

#[async_trait]
impl ClusterStateSource for FileStateSource {
    async fn fetch_endpoints(
        &self,
        watch_list: &[String],
    ) -> Result<Vec<EndpointDescriptor>, SidecarError> {
        let source = self.clone();
        let entries = tokio::task::spawn_blocking(move || source.read_entries())
            .await
            .map_err(|e| {
                SidecarError::DesiredStateFetch(format!("{}: reader task failed: {e}", self.path.display()))
            })??;
        debug!(path = %self.path.display(), entries = entries.len(), "read desired state");
        Ok(collect_endpoints(entries, watch_list, self.default_server_port))
    }
}
