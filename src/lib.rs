//! servicekeel - a cluster-connectivity sidecar.
//!
//! Remote services are made reachable from the local cluster without touching
//! client applications:
//!
//! - a DNS server hijacks `A` queries for watched service names and answers
//!   with a virtual IP drawn from a private range;
//! - a reconciliation controller keeps one tunnel per desired endpoint running,
//!   bound to that virtual IP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           servicekeel                            │
//! │                                                                  │
//! │  ┌──────────────────┐   desired    ┌──────────────────┐          │
//! │  │ ClusterState     │─────────────▶│  Controller      │          │
//! │  │ Source           │   endpoints  │  (every 10s)     │          │
//! │  └──────────────────┘              └───┬──────────┬───┘          │
//! │                         add/remove     │          │ start/stop   │
//! │                         mapping        ▼          ▼              │
//! │  ┌──────────────────┐         ┌─────────────┐  ┌─────────────┐   │
//! │  │  Hickory DNS     │◀────────│  DnsState   │  │ frpc tunnel │   │
//! │  │  Server   :53/udp│ resolve │ (IP pool)   │  │ processes   │   │
//! │  └──────────────────┘         └─────────────┘  └─────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! mysql.                     A?
//!   → exact mapping          mysql.
//!   → alias                  mysql. → <canonical>.
//!   → search domains         mysql.default.svc.cluster.local. ...
//!   → 127.0.66.N, TTL 5      (AAAA: always empty NOERROR)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use servicekeel::{Config, Sidecar};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = Config::default();
//!     config.controller.watch_list = vec!["mysql.default.svc".to_string()];
//!
//!     let shutdown = CancellationToken::new();
//!     Sidecar::new(config).run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod source;
pub mod state;
pub mod telemetry;
pub mod tunnel;

// Re-export main types
pub use config::{Config, DnsConfig, TelemetryConfig};
pub use controller::{Controller, ControllerSettings, CycleReport, Endpoint, MetadataPolicy};
pub use error::{MappingError, SidecarError};
pub use handler::HijackHandler;
pub use server::{DnsServer, Sidecar};
pub use source::{ClusterStateSource, EndpointDescriptor, FileStateSource};
pub use state::DnsState;
pub use tunnel::{FrpcTunnels, TunnelHandle, TunnelProcess};
