//! Reconciliation controller.
//!
//! Each cycle fetches the desired endpoint set, diffs it against the endpoints
//! currently running and converges:
//! - endpoints that are no longer desired get their tunnel stopped, then their
//!   DNS mapping freed;
//! - new endpoints get a DNS mapping (imports only), then a tunnel bound to
//!   the mapped IP;
//! - endpoints present on both sides are left alone (see [`MetadataPolicy`]).
//!
//! Failures are scoped: a failed fetch aborts the cycle without touching
//! anything, a failure on one endpoint only skips that endpoint.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MappingError, SidecarError};
use crate::metrics::{ReconcileMetrics, Timer};
use crate::source::{ClusterStateSource, EndpointDescriptor};
use crate::state::{join_domain, DnsState};
use crate::tunnel::{TunnelHandle, TunnelProcess};

/// Upper bound on the number of watched services.
pub const MAX_WATCHED_SERVICES: usize = 100;

/// What to do when a running endpoint's descriptor changes under the same identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataPolicy {
    /// Keep the running tunnel and its virtual IP as they are.
    #[default]
    Ignore,
    /// Restart the tunnel with the new descriptor on the same virtual IP.
    Restart,
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Instance name, used as a metric label.
    pub name: String,
    /// Service names to reconcile.
    pub watch_list: Vec<String>,
    /// Pause between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Policy for descriptor changes on a stable identity.
    pub metadata_policy: MetadataPolicy,
    /// Extra domains under which each service is aliased.
    pub alias_suffixes: Vec<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            watch_list: Vec::new(),
            interval: Duration::from_secs(10),
            metadata_policy: MetadataPolicy::Ignore,
            alias_suffixes: Vec::new(),
        }
    }
}

/// An endpoint that is currently running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Stable identity.
    pub identity: String,
    /// Descriptor the tunnel was started with.
    pub descriptor: EndpointDescriptor,
    /// Virtual IP the service name maps to. Set for imports only.
    pub virtual_ip: Option<Ipv4Addr>,
    /// Running tunnel.
    pub tunnel: TunnelHandle,
}

/// Identities touched by one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Newly started endpoints.
    pub added: Vec<String>,
    /// Endpoints torn down because they are no longer desired.
    pub removed: Vec<String>,
    /// Endpoints restarted after a descriptor change.
    pub restarted: Vec<String>,
    /// Desired endpoints that could not be brought up this cycle.
    pub skipped: Vec<String>,
}

impl CycleReport {
    /// True if the cycle changed nothing and skipped nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.restarted.is_empty()
            && self.skipped.is_empty()
    }
}

/// Keeps tunnels and DNS mappings in line with the desired endpoint set.
///
/// Cloning is cheap; clones share the same endpoint table and loop.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    settings: ControllerSettings,
    dns: DnsState,
    source: Arc<dyn ClusterStateSource>,
    tunnels: Arc<dyn TunnelProcess>,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    metrics: ReconcileMetrics,
    /// Held for the whole of a cycle and of the shutdown sweep.
    cycle: tokio::sync::Mutex<()>,
    started: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Create a controller. Nothing runs until [`Controller::start`].
    pub fn new(
        settings: ControllerSettings,
        dns: DnsState,
        source: Arc<dyn ClusterStateSource>,
        tunnels: Arc<dyn TunnelProcess>,
    ) -> Result<Self, SidecarError> {
        if settings.watch_list.is_empty() {
            return Err(SidecarError::Config("watch list is empty".to_string()));
        }
        if settings.watch_list.len() > MAX_WATCHED_SERVICES {
            return Err(SidecarError::Config(format!(
                "watch list has {} services, at most {MAX_WATCHED_SERVICES} allowed",
                settings.watch_list.len()
            )));
        }
        if settings.interval.is_zero() {
            return Err(SidecarError::Config("reconcile interval must be positive".to_string()));
        }

        let metrics = ReconcileMetrics::new(&settings.name);

        Ok(Self {
            inner: Arc::new(ControllerInner {
                settings,
                dns,
                source,
                tunnels,
                endpoints: RwLock::new(HashMap::new()),
                metrics,
                cycle: tokio::sync::Mutex::new(()),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        })
    }

    /// Start the reconciliation loop. Calling it again has no effect.
    ///
    /// The first cycle runs immediately; each following one starts `interval`
    /// after the previous one finished.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(controller = %self.inner.settings.name, "reconcile loop already started");
            return;
        }

        info!(
            controller = %self.inner.settings.name,
            services = self.inner.settings.watch_list.len(),
            interval_secs = self.inner.settings.interval.as_secs_f64(),
            "starting reconcile loop"
        );

        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let interval = self.inner.settings.interval;
        let handle = tokio::spawn(reconcile_loop(weak, cancel, interval));

        *self.inner.task.lock() = Some(handle);
    }

    /// Run a single reconciliation cycle.
    ///
    /// Returns an error only if the desired state could not be fetched, in
    /// which case nothing was changed.
    pub async fn reconcile_once(&self) -> Result<CycleReport, SidecarError> {
        let _cycle = self.inner.cycle.lock().await;
        let mut report = CycleReport::default();

        if self.inner.cancel.is_cancelled() {
            debug!(controller = %self.inner.settings.name, "controller shut down, skipping cycle");
            return Ok(report);
        }

        let timer = Timer::start();

        let fetched = match self
            .inner
            .source
            .fetch_endpoints(&self.inner.settings.watch_list)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                self.inner.metrics.record_error();
                error!(controller = %self.inner.settings.name, error = %e, "failed to fetch desired endpoints");
                return Err(e);
            }
        };

        let mut desired_ids = HashSet::with_capacity(fetched.len());
        let desired: Vec<EndpointDescriptor> = fetched
            .into_iter()
            .filter(|d| desired_ids.insert(d.identity.clone()))
            .collect();

        let mut stale: Vec<Endpoint> = self
            .inner
            .endpoints
            .read()
            .values()
            .filter(|ep| !desired_ids.contains(&ep.identity))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.identity.cmp(&b.identity));

        for endpoint in stale {
            self.stop_tunnel(&endpoint.tunnel).await;
            self.inner.endpoints.write().remove(&endpoint.identity);
            if endpoint.descriptor.needs_mapping() {
                self.release_mapping(&endpoint.descriptor.service_name);
            }
            report.removed.push(endpoint.identity);
        }

        for descriptor in desired {
            let existing = self.inner.endpoints.read().get(&descriptor.identity).cloned();

            match existing {
                None => self.add_endpoint(descriptor, &mut report).await,
                Some(current) if current.descriptor == descriptor => {}
                Some(current) => match self.inner.settings.metadata_policy {
                    MetadataPolicy::Ignore => {
                        debug!(identity = %current.identity, "descriptor changed, keeping running tunnel");
                    }
                    MetadataPolicy::Restart => {
                        self.restart_endpoint(current, descriptor, &mut report).await;
                    }
                },
            }
        }

        let active = self.inner.endpoints.read().len();
        self.inner.metrics.set_active_endpoints(active);
        self.inner.metrics.record_cycle(timer.elapsed());

        if report.is_empty() {
            debug!(controller = %self.inner.settings.name, active, "reconcile cycle: no changes");
        } else {
            info!(
                controller = %self.inner.settings.name,
                active,
                added = report.added.len(),
                removed = report.removed.len(),
                restarted = report.restarted.len(),
                skipped = report.skipped.len(),
                "reconcile cycle complete"
            );
        }

        Ok(report)
    }

    /// Map the endpoint's service name and its alias suffixes.
    fn map_service(&self, descriptor: &EndpointDescriptor) -> Result<Ipv4Addr, MappingError> {
        let service = &descriptor.service_name;
        let virtual_ip = self.inner.dns.add_mapping(service)?;
        debug!(identity = %descriptor.identity, service = %service, ip = %virtual_ip, "mapped service");

        let suffixes = &self.inner.settings.alias_suffixes;
        if !suffixes.is_empty() {
            self.inner
                .dns
                .add_mapping_alias(service, suffixes.iter().map(|s| join_domain(service, s)));
        }
        Ok(virtual_ip)
    }

    async fn add_endpoint(&self, descriptor: EndpointDescriptor, report: &mut CycleReport) {
        let identity = descriptor.identity.clone();
        let service = descriptor.service_name.clone();

        let virtual_ip = if descriptor.needs_mapping() {
            match self.map_service(&descriptor) {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(identity = %identity, service = %service, error = %e, "failed to add mapping, skipping endpoint");
                    report.skipped.push(identity);
                    return;
                }
            }
        } else {
            None
        };

        match self.inner.tunnels.start(&identity, &descriptor, virtual_ip).await {
            Ok(tunnel) => {
                info!(identity = %identity, service = %service, ip = ?virtual_ip, "endpoint started");
                self.inner.endpoints.write().insert(
                    identity.clone(),
                    Endpoint {
                        identity: identity.clone(),
                        descriptor,
                        virtual_ip,
                        tunnel,
                    },
                );
                report.added.push(identity);
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "failed to start tunnel, rolling back mapping");
                if virtual_ip.is_some() {
                    self.release_mapping(&service);
                }
                report.skipped.push(identity);
            }
        }
    }

    async fn restart_endpoint(
        &self,
        current: Endpoint,
        descriptor: EndpointDescriptor,
        report: &mut CycleReport,
    ) {
        let identity = current.identity.clone();
        info!(identity = %identity, "descriptor changed, restarting tunnel");

        self.stop_tunnel(&current.tunnel).await;

        // The role may have changed: imports keep (or gain) a mapping, other kinds drop it.
        let virtual_ip = match (descriptor.needs_mapping(), current.virtual_ip) {
            (true, Some(ip)) => Ok(Some(ip)),
            (true, None) => self.map_service(&descriptor).map(Some),
            (false, _) => Ok(None),
        };

        let newly_mapped = current.virtual_ip.is_none() && matches!(virtual_ip, Ok(Some(_)));
        let started = match virtual_ip {
            Ok(virtual_ip) => self
                .inner
                .tunnels
                .start(&identity, &descriptor, virtual_ip)
                .await
                .map(|tunnel| (tunnel, virtual_ip)),
            Err(e) => Err(e.into()),
        };

        match started {
            Ok((tunnel, virtual_ip)) => {
                let released = current.virtual_ip.is_some() && virtual_ip.is_none();
                self.inner.endpoints.write().insert(
                    identity.clone(),
                    Endpoint {
                        identity: identity.clone(),
                        descriptor,
                        virtual_ip,
                        tunnel,
                    },
                );
                if released {
                    self.release_mapping(&current.descriptor.service_name);
                }
                report.restarted.push(identity);
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "failed to restart tunnel, tearing endpoint down");
                self.inner.endpoints.write().remove(&identity);
                if current.virtual_ip.is_some() {
                    self.release_mapping(&current.descriptor.service_name);
                }
                if newly_mapped {
                    self.release_mapping(&descriptor.service_name);
                }
                report.skipped.push(identity);
            }
        }
    }

    async fn stop_tunnel(&self, tunnel: &TunnelHandle) {
        match self.inner.tunnels.stop(tunnel).await {
            Ok(()) => debug!(identity = %tunnel.identity, "tunnel stopped"),
            Err(e) => warn!(identity = %tunnel.identity, error = %e, "failed to stop tunnel"),
        }
    }

    /// Free the mapping for `service` unless another running import still uses it.
    fn release_mapping(&self, service: &str) {
        let in_use = self
            .inner
            .endpoints
            .read()
            .values()
            .any(|ep| ep.virtual_ip.is_some() && ep.descriptor.service_name == service);
        if in_use {
            debug!(service, "mapping still in use, keeping it");
            return;
        }

        match self.inner.dns.remove_mapping(service) {
            Ok(ip) => debug!(service, ip = %ip, "removed mapping"),
            Err(e) => warn!(service, error = %e, "failed to remove mapping"),
        }
    }

    /// Look up a running endpoint by identity.
    pub fn get_endpoint(&self, identity: &str) -> Option<Endpoint> {
        self.inner.endpoints.read().get(identity).cloned()
    }

    /// All running endpoints, ordered by identity.
    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.inner.endpoints.read().values().cloned().collect();
        endpoints.sort_by(|a, b| a.identity.cmp(&b.identity));
        endpoints
    }

    /// Reconciliation metrics of this controller.
    pub fn metrics(&self) -> &ReconcileMetrics {
        &self.inner.metrics
    }

    /// The resolver state this controller maintains.
    pub fn dns(&self) -> &DnsState {
        &self.inner.dns
    }

    /// Stop the loop, wait for a running cycle, then stop every tunnel and
    /// free every mapping.
    pub async fn shutdown(&self) {
        info!(controller = %self.inner.settings.name, "shutting down controller");
        self.inner.cancel.cancel();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "reconcile loop ended abnormally");
            }
        }

        let _cycle = self.inner.cycle.lock().await;

        let drained: Vec<Endpoint> = self
            .inner
            .endpoints
            .write()
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();

        join_all(drained.iter().map(|endpoint| self.stop_tunnel(&endpoint.tunnel))).await;

        let services: BTreeSet<&str> = drained
            .iter()
            .filter(|endpoint| endpoint.virtual_ip.is_some())
            .map(|endpoint| endpoint.descriptor.service_name.as_str())
            .collect();
        for service in services {
            self.release_mapping(service);
        }

        self.inner.metrics.set_active_endpoints(0);
        info!(
            controller = %self.inner.settings.name,
            stopped = drained.len(),
            "controller stopped"
        );
    }
}

async fn reconcile_loop(inner: Weak<ControllerInner>, cancel: CancellationToken, interval: Duration) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let controller = Controller { inner };
        if let Err(e) = controller.reconcile_once().await {
            debug!(error = %e, "cycle aborted, retrying next interval");
        }
        drop(controller);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!("reconcile loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoSource;

    #[async_trait]
    impl ClusterStateSource for NoSource {
        async fn fetch_endpoints(&self, _: &[String]) -> Result<Vec<EndpointDescriptor>, SidecarError> {
            Ok(Vec::new())
        }
    }

    struct NoTunnels;

    #[async_trait]
    impl TunnelProcess for NoTunnels {
        async fn start(
            &self,
            identity: &str,
            _: &EndpointDescriptor,
            _: Option<Ipv4Addr>,
        ) -> Result<TunnelHandle, SidecarError> {
            Ok(TunnelHandle {
                id: 1,
                identity: identity.to_string(),
            })
        }

        async fn stop(&self, _: &TunnelHandle) -> Result<(), SidecarError> {
            Ok(())
        }
    }

    fn build(settings: ControllerSettings) -> Result<Controller, SidecarError> {
        Controller::new(
            settings,
            DnsState::new("127.0.66.0/24").unwrap(),
            Arc::new(NoSource),
            Arc::new(NoTunnels),
        )
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(build(ControllerSettings::default()), Err(SidecarError::Config(_))));

        let too_many = ControllerSettings {
            watch_list: (0..=MAX_WATCHED_SERVICES).map(|i| format!("svc-{i}")).collect(),
            ..Default::default()
        };
        assert!(build(too_many).is_err());

        let zero_interval = ControllerSettings {
            watch_list: vec!["svc".to_string()],
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(build(zero_interval).is_err());

        let exactly_max = ControllerSettings {
            watch_list: (0..MAX_WATCHED_SERVICES).map(|i| format!("svc-{i}")).collect(),
            ..Default::default()
        };
        assert!(build(exactly_max).is_ok());
    }

    #[tokio::test]
    async fn test_cycle_after_shutdown_is_noop() {
        let controller = build(ControllerSettings {
            watch_list: vec!["svc".to_string()],
            ..Default::default()
        })
        .unwrap();

        controller.shutdown().await;
        let report = controller.reconcile_once().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(controller.metrics().cycles(), 0);
    }

    #[test]
    fn test_metadata_policy_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: MetadataPolicy,
        }

        let parsed: Wrapper = ::config::Config::builder()
            .set_override("policy", "restart")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(parsed.policy, MetadataPolicy::Restart);
    }
}
