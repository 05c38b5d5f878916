//! NAT manager - maps listen addresses on the gateway and publishes them
//!
//! [`NatManager::start`] launches a background mapping pass over the node's
//! listen addresses. For every bare IPv4 TCP address the gateway is asked to
//! forward the same external port, and the resulting external address is handed
//! to the [`AddressSink`]. Mapping failures never fail node startup; they end
//! up in the log.
//!
//! The manager owns at most one port mapping client at a time. It is created
//! on the first network operation and released by [`NatManager::stop`].
//! Every `start()` and `stop()` advances a generation counter; a pass that is no
//! longer current abandons the client operation it is waiting on and finishes
//! without publishing anything.

use super::address::{AddressCandidate, AddressSink, AddressSource, ObservedAddress};
use super::cgnat::{detect_cgnat, is_private_ip};
use super::client::{ClientFactory, ClientOptions, PortMappingClient};
use super::gateway_client::GatewayClientFactory;
use super::retry::{FailureObserver, RetryAdapter, RetryPolicy, log_failed_attempt};
use super::types::{IpProtocol, MappingError, MappingRequest};
use crate::config::{FailurePolicy, NatConfig};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the host environment allows the NAT manager to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Whether the process may open raw UDP/TCP sockets towards the gateway
    pub raw_sockets: bool,
}

impl HostCapabilities {
    /// Regular desktop/server process
    pub fn native() -> Self {
        Self { raw_sockets: true }
    }

    /// Sandboxed environment without socket access; the manager stays idle
    pub fn sandboxed() -> Self {
        Self { raw_sockets: false }
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::native()
    }
}

/// Outcome of one mapping pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Addresses published to the sink, in order
    pub mapped: Vec<ObservedAddress>,
    /// Candidates that were not eligible for mapping
    pub skipped: usize,
    /// Candidates that failed while the pass continued ([`FailurePolicy::SkipCandidate`])
    pub failed: Vec<(AddressCandidate, String)>,
    /// The pass stopped early because `start()` or `stop()` was called again
    pub superseded: bool,
}

/// Handle of a running background mapping pass
#[derive(Debug)]
pub struct MappingPass {
    generation: u64,
    handle: JoinHandle<Result<PassReport>>,
}

impl MappingPass {
    /// Generation the pass was started with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the pass has completed
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the pass to complete
    ///
    /// Errors have already been logged by the time they are returned here.
    pub async fn join(self) -> Result<PassReport> {
        self.handle
            .await
            .map_err(|e| Error::Mapping(MappingError::Internal(format!("Task join error: {}", e))))?
    }
}

#[derive(Default)]
struct ClientState {
    client: Option<Arc<dyn PortMappingClient>>,
    generation: u64,
}

/// Everything a mapping pass needs, cloned into the background task
#[derive(Clone)]
struct PassContext {
    config: NatConfig,
    client_options: ClientOptions,
    source: Arc<dyn AddressSource>,
    sink: Arc<dyn AddressSink>,
    factory: Arc<dyn ClientFactory>,
    retry_policy: RetryPolicy,
    observer: FailureObserver,
    state: Arc<Mutex<ClientState>>,
    generation_changed: Arc<Notify>,
}

impl PassContext {
    fn current_generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    /// Move to the next generation, optionally taking the client out
    fn advance_generation(&self, release_client: bool) -> (u64, Option<Arc<dyn PortMappingClient>>) {
        let (generation, client) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let client = if release_client { state.client.take() } else { None };
            (state.generation, client)
        };
        self.generation_changed.notify_waiters();
        (generation, client)
    }

    /// Resolves once `generation` is no longer current
    async fn superseded(&self, generation: u64) {
        loop {
            // Registered before the check so a concurrent bump can't be missed
            let changed = self.generation_changed.notified();
            if !self.is_current(generation) {
                return;
            }
            changed.await;
        }
    }

    /// Run `op` unless the pass is superseded first
    async fn unless_superseded<T>(&self, generation: u64, op: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            result = op => Some(result),
            _ = self.superseded(generation) => None,
        }
    }

    /// The memoized client, created on first use
    ///
    /// Returns `None` once `generation` is stale; checked under the same lock
    /// `stop()` takes the client out with.
    fn client(&self, generation: u64) -> Option<Arc<dyn PortMappingClient>> {
        let mut state = self.state.lock();

        if state.generation != generation {
            return None;
        }
        if let Some(client) = &state.client {
            return Some(client.clone());
        }

        debug!("Creating port mapping client (generation {})", state.generation);
        let raw = self.factory.create(&self.client_options);
        let client: Arc<dyn PortMappingClient> = Arc::new(
            RetryAdapter::new(raw, self.retry_policy).with_observer(self.observer.clone()),
        );
        state.client = Some(client.clone());
        Some(client)
    }

    /// Configured external address, or the one reported by the gateway
    async fn resolve_external_ip(&self, client: &dyn PortMappingClient) -> Result<Ipv4Addr> {
        if let Some(external_ip) = self.config.external_ip {
            return Ok(external_ip);
        }

        match client.external_ip().await? {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(ip) => Err(Error::InvalidAddress(format!(
                "gateway reported non-IPv4 external address {}",
                ip
            ))),
        }
    }

    /// Map one eligible candidate and publish the observed address
    async fn map_candidate(
        &self,
        candidate: &AddressCandidate,
        generation: u64,
    ) -> Result<Option<ObservedAddress>> {
        let Some(client) = self.client(generation) else {
            return Ok(None);
        };
        let Some(external_ip) = self
            .unless_superseded(generation, self.resolve_external_ip(client.as_ref()))
            .await
        else {
            return Ok(None);
        };
        let external_ip = external_ip?;

        if is_private_ip(IpAddr::V4(external_ip)) {
            // Warns on its own when the outer NAT is the carrier's
            detect_cgnat(IpAddr::V4(external_ip));
            return Err(Error::DoubleNat {
                address: IpAddr::V4(external_ip),
            });
        }

        let protocol: IpProtocol = candidate.transport.parse()?;
        let request = MappingRequest::same_port(candidate.port, protocol);

        info!(
            "Opening port mapping from {}:{} to {}:{} ({})",
            external_ip, request.public_port, candidate.host, request.private_port, protocol
        );
        let Some(mapped) = self.unless_superseded(generation, client.map(request)).await else {
            return Ok(None);
        };
        mapped?;

        if !self.is_current(generation) {
            debug!("Mapping pass {} superseded, not publishing {}", generation, candidate);
            return Ok(None);
        }

        let observed = ObservedAddress::ipv4(external_ip, candidate.port, candidate.transport.clone());
        info!("Publishing observed address {}", observed);
        self.sink.add_observed_addr(observed.clone());

        Ok(Some(observed))
    }

    async fn run(&self, generation: u64) -> Result<PassReport> {
        let mut report = PassReport::default();

        for candidate in self.source.addrs() {
            if !self.is_current(generation) {
                debug!("Mapping pass {} superseded", generation);
                report.superseded = true;
                break;
            }

            if !candidate.is_eligible() {
                debug!("Skipping {} - only bare non-loopback IPv4 TCP addresses are mapped", candidate);
                report.skipped += 1;
                continue;
            }

            match self.map_candidate(&candidate, generation).await {
                Ok(Some(observed)) => report.mapped.push(observed),
                Ok(None) => {
                    report.superseded = true;
                    break;
                }
                Err(e @ Error::DoubleNat { .. }) => return Err(e),
                Err(e) => match self.config.failure_policy {
                    FailurePolicy::AbortPass => return Err(e),
                    FailurePolicy::SkipCandidate => {
                        warn!("Failed to map {}: {}", candidate, e);
                        report.failed.push((candidate, e.to_string()));
                    }
                },
            }
        }

        debug!(
            "Mapping pass {} done: {} mapped, {} skipped, {} failed",
            generation,
            report.mapped.len(),
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }
}

/// Maps the node's listen addresses on the local gateway
pub struct NatManager {
    ctx: PassContext,
    capabilities: HostCapabilities,
    pass_lock: Arc<tokio::sync::Mutex<()>>,
}

impl NatManager {
    /// Create a NAT manager
    ///
    /// # Arguments
    ///
    /// * `config` - NAT configuration
    /// * `identity` - Node identity, used in the default mapping description
    /// * `source` - Supplies the node's listen addresses
    /// * `sink` - Receives the externally reachable addresses
    pub fn new(
        config: NatConfig,
        identity: impl std::fmt::Display,
        source: Arc<dyn AddressSource>,
        sink: Arc<dyn AddressSink>,
    ) -> Self {
        let description = config.description_for(&identity.to_string());
        let client_options = ClientOptions::from_config(&config, description);

        Self {
            ctx: PassContext {
                config,
                client_options,
                source,
                sink,
                factory: Arc::new(GatewayClientFactory),
                retry_policy: RetryPolicy::default(),
                observer: Arc::new(log_failed_attempt),
                state: Arc::new(Mutex::new(ClientState::default())),
                generation_changed: Arc::new(Notify::new()),
            },
            capabilities: HostCapabilities::default(),
            pass_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Set what the host environment allows
    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Build port mapping clients with a custom factory
    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.ctx.factory = factory;
        self
    }

    /// Retry policy applied to every client operation
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.ctx.retry_policy = policy;
        self
    }

    /// Observer notified of every failed client operation attempt
    pub fn with_failure_observer(mut self, observer: FailureObserver) -> Self {
        self.ctx.observer = observer;
        self
    }

    /// The configuration the manager was built with
    pub fn config(&self) -> &NatConfig {
        &self.ctx.config
    }

    /// Description attached to gateway mapping entries
    pub fn description(&self) -> &str {
        &self.ctx.client_options.description
    }

    /// Whether a port mapping client is currently held
    pub fn has_client(&self) -> bool {
        self.ctx.state.lock().client.is_some()
    }

    /// Start mapping listen addresses in the background
    ///
    /// Returns immediately. Does nothing and returns `None` when NAT traversal
    /// is disabled, the host lacks socket access or there is no Tokio runtime
    /// to run the pass on. A running pass is superseded.
    pub fn start(&self) -> Option<MappingPass> {
        if !self.capabilities.raw_sockets {
            debug!("NAT manager idle: no raw socket access");
            return None;
        }
        if !self.ctx.config.enabled {
            debug!("NAT manager idle: disabled in config");
            return None;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("NAT manager idle: no Tokio runtime to run the mapping pass on");
            return None;
        };

        let (generation, _) = self.ctx.advance_generation(false);

        let ctx = self.ctx.clone();
        let pass_lock = self.pass_lock.clone();

        info!("Starting NAT mapping pass {}", generation);
        let handle = runtime.spawn(async move {
            let _running = pass_lock.lock().await;
            let result = ctx.run(generation).await;
            if let Err(e) = &result {
                // Mapping failures are not fatal to the node
                error!("NAT mapping pass {} failed: {}", generation, e);
            }
            result
        });

        Some(MappingPass { generation, handle })
    }

    /// Run one mapping pass in the foreground
    ///
    /// Unlike [`start`](Self::start) this ignores the `enabled` flag and returns
    /// the failure to the caller.
    pub async fn run_mapping_pass(&self) -> Result<PassReport> {
        let _running = self.pass_lock.lock().await;
        let generation = self.ctx.current_generation();
        self.ctx.run(generation).await
    }

    /// Release the port mapping client
    ///
    /// Removes the installed mappings and drops the client; the next pass
    /// creates a new one. Never fails; errors are logged.
    pub async fn stop(&self) {
        if !self.capabilities.raw_sockets {
            return;
        }

        let (_, client) = self.ctx.advance_generation(true);

        let Some(client) = client else {
            return;
        };

        info!("Stopping NAT manager");
        if let Err(e) = client.destroy().await {
            error!("Failed to release port mappings: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::address::{ObservedAddressBook, StaticAddressSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_stale_generation_never_creates_client() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = move |options: &ClientOptions| -> Arc<dyn PortMappingClient> {
            counter.fetch_add(1, Ordering::SeqCst);
            GatewayClientFactory.create(options)
        };

        let manager = NatManager::new(
            NatConfig::default(),
            "peer-1",
            Arc::new(StaticAddressSource::default()),
            Arc::new(ObservedAddressBook::new()),
        )
        .with_client_factory(Arc::new(factory));

        // stop() lands between a pass's generation check and client creation
        let stale = manager.ctx.current_generation();
        manager.ctx.advance_generation(true);

        assert!(manager.ctx.client(stale).is_none());
        assert!(!manager.has_client());
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let current = manager.ctx.current_generation();
        assert!(manager.ctx.client(current).is_some());
        assert!(manager.has_client());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
