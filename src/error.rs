//! Error types for servicekeel.

use ipnet::Ipv4Net;
use thiserror::Error;

/// Errors returned by the virtual IP pool when mutating mappings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// Every address in the range is already assigned.
    #[error("no unused IP left in {range}")]
    PoolExhausted {
        /// The exhausted address range.
        range: Ipv4Net,
    },

    /// The name has no mapping.
    #[error("no mapping for {0}")]
    UnknownMapping(String),
}

/// Errors that can occur in the sidecar.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// The synthetic address range is not a valid IPv4 CIDR.
    #[error("invalid address range {range:?}: {reason}")]
    InvalidAddressRange {
        /// The rejected input.
        range: String,
        /// Parser message.
        reason: String,
    },

    /// Mapping allocation or removal failed.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// The desired endpoint set could not be fetched.
    #[error("failed to fetch desired endpoints: {0}")]
    DesiredStateFetch(String),

    /// A desired-state entry could not be turned into an endpoint.
    #[error("malformed desired entry {entry:?}: {reason}")]
    MalformedDesiredEntry {
        /// The raw entry name.
        entry: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The tunnel process for an endpoint failed to start.
    #[error("failed to start tunnel {identity}: {reason}")]
    TunnelStart {
        /// Endpoint identity.
        identity: String,
        /// Underlying cause.
        reason: String,
    },

    /// The tunnel process for an endpoint failed to stop.
    #[error("failed to stop tunnel {identity}: {reason}")]
    TunnelStop {
        /// Endpoint identity.
        identity: String,
        /// Underlying cause.
        reason: String,
    },

    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}
