//! Default port mapping client talking to the local gateway
//!
//! [`GatewayClient`] implements [`PortMappingClient`] on top of a protocol
//! backend (UPnP or NAT-PMP). It remembers every mapping it installed so they
//! can be renewed before they expire and removed again on `destroy()`.

use super::client::{ClientFactory, ClientOptions, PortMappingClient};
use super::natpmp::NatPmpBackend;
use super::types::{MappingError, MappingLease, MappingRequest};
use super::upnp::UpnpBackend;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// A concrete port mapping protocol
#[async_trait]
pub trait MappingBackend: Send + Sync {
    /// Protocol name for logging
    fn name(&self) -> &'static str;

    /// Install (or refresh) a mapping; returns the lifetime granted by the gateway
    async fn add_mapping(
        &self,
        request: MappingRequest,
        lifetime_secs: u32,
        description: &str,
    ) -> Result<u32, MappingError>;

    /// Remove a mapping
    async fn remove_mapping(&self, request: MappingRequest) -> Result<(), MappingError>;

    /// External address of the gateway
    async fn external_ip(&self) -> Result<IpAddr, MappingError>;
}

/// Delay before renewing a mapping with the given lifetime (80% of it)
pub fn renewal_delay(lifetime_secs: u32) -> Duration {
    let secs = (u64::from(lifetime_secs) * 4 / 5).max(1);
    Duration::from_secs(secs)
}

/// A lease together with the time it is due for renewal
struct TrackedLease {
    lease: MappingLease,
    renew_at: Option<Instant>,
}

impl TrackedLease {
    /// Leases granted without a lifetime never expire
    fn new(request: MappingRequest, granted_secs: u32, auto_update: bool) -> Self {
        let renew_at =
            (auto_update && granted_secs > 0).then(|| Instant::now() + renewal_delay(granted_secs));
        Self {
            lease: MappingLease::new(request, granted_secs),
            renew_at,
        }
    }
}

/// State shared with spawned mapping and renewal tasks
struct Shared {
    backend: Arc<dyn MappingBackend>,
    options: ClientOptions,
    leases: Mutex<Vec<TrackedLease>>,
    destroyed: AtomicBool,
    rescheduled: Notify,
}

impl Shared {
    /// Install a mapping and record its lease; returns the granted lifetime
    async fn install(&self, request: MappingRequest) -> Result<u32, MappingError> {
        let granted = self
            .backend
            .add_mapping(request, self.options.ttl, &self.options.description)
            .await?;

        let recorded = {
            let mut leases = self.leases.lock().await;
            // destroy() sets the flag before draining the leases
            if self.destroyed.load(Ordering::SeqCst) {
                false
            } else {
                leases.retain(|l| l.lease.request != request);
                leases.push(TrackedLease::new(request, granted, self.options.auto_update));
                true
            }
        };

        if !recorded {
            if let Err(e) = self.backend.remove_mapping(request).await {
                debug!("Failed to remove mapping for port {}: {}", request.public_port, e);
            }
            return Err(MappingError::ClientDestroyed);
        }

        self.rescheduled.notify_one();
        Ok(granted)
    }

    /// Re-issue every lease when it reaches 80% of its granted lifetime
    async fn renew_loop(self: Arc<Self>) {
        loop {
            let next = self.leases.lock().await.iter().filter_map(|l| l.renew_at).min();

            match next {
                Some(deadline) => {
                    debug!(
                        "Next mapping renewal in {:?}",
                        deadline.saturating_duration_since(Instant::now())
                    );
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.rescheduled.notified() => continue,
                    }
                }
                None => {
                    self.rescheduled.notified().await;
                    continue;
                }
            }

            let now = Instant::now();
            let due: Vec<MappingRequest> = self
                .leases
                .lock()
                .await
                .iter()
                .filter(|l| l.renew_at.is_some_and(|at| at <= now))
                .map(|l| l.lease.request)
                .collect();

            for request in due {
                info!("Renewing {} mapping for port {}", self.backend.name(), request.public_port);
                let renewed = self
                    .backend
                    .add_mapping(request, self.options.ttl, &self.options.description)
                    .await;

                let mut leases = self.leases.lock().await;
                let Some(tracked) = leases.iter_mut().find(|l| l.lease.request == request) else {
                    continue;
                };
                match renewed {
                    Ok(granted) => *tracked = TrackedLease::new(request, granted, true),
                    Err(e) => {
                        // Try again after another 80% of the last granted lifetime
                        error!("Failed to renew mapping for port {}: {}", request.public_port, e);
                        tracked.renew_at =
                            Some(Instant::now() + renewal_delay(tracked.lease.lifetime_secs));
                    }
                }
            }
        }
    }
}

/// Port mapping client with lease tracking and automatic renewal
pub struct GatewayClient {
    shared: Arc<Shared>,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Create a client using NAT-PMP when enabled, UPnP otherwise
    pub fn new(options: ClientOptions) -> Self {
        let backend: Arc<dyn MappingBackend> = if options.enable_pmp {
            Arc::new(NatPmpBackend::new(options.gateway))
        } else {
            Arc::new(UpnpBackend::new(options.gateway))
        };
        Self::with_backend(backend, options)
    }

    /// Create a client on top of a specific backend
    pub fn with_backend(backend: Arc<dyn MappingBackend>, options: ClientOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                options,
                leases: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
                rescheduled: Notify::new(),
            }),
            renewal_task: Mutex::new(None),
        }
    }

    /// Mappings currently installed through this client
    pub async fn leases(&self) -> Vec<MappingLease> {
        self.shared.leases.lock().await.iter().map(|l| l.lease.clone()).collect()
    }

    /// Whether `destroy()` has been called
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), MappingError> {
        if self.is_destroyed() {
            Err(MappingError::ClientDestroyed)
        } else {
            Ok(())
        }
    }

    /// Spawn the renewal task unless it is already running
    async fn ensure_renewal_task(&self) {
        let mut task = self.renewal_task.lock().await;
        // destroy() sets the flag before taking the task
        if self.is_destroyed() || task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(self.shared.clone().renew_loop()));
    }
}

#[async_trait]
impl PortMappingClient for GatewayClient {
    async fn map(&self, request: MappingRequest) -> Result<(), MappingError> {
        self.ensure_alive()?;

        // Runs to completion even if the caller stops waiting, so an installed
        // mapping always ends up in the lease list
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.install(request).await })
            .await
            .map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))??;

        if self.shared.options.auto_update {
            self.ensure_renewal_task().await;
        }

        Ok(())
    }

    async fn destroy(&self) -> Result<(), MappingError> {
        if !self.shared.destroyed.swap(true, Ordering::SeqCst) {
            info!("Releasing {} port mapping client", self.shared.backend.name());
        }

        if let Some(task) = self.renewal_task.lock().await.take() {
            task.abort();
        }

        // Failed removals stay recorded so a repeated destroy() retries them
        let mut leases = self.shared.leases.lock().await;
        let mut first_error = None;
        let mut remaining = Vec::new();

        for tracked in leases.drain(..) {
            let request = tracked.lease.request;
            if let Err(e) = self.shared.backend.remove_mapping(request).await {
                debug!("Failed to remove mapping for port {}: {}", request.public_port, e);
                first_error.get_or_insert(e);
                remaining.push(tracked);
            }
        }
        *leases = remaining;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.ensure_alive()?;
        self.shared.backend.external_ip().await
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        if let Some(task) = self.renewal_task.try_lock().ok().and_then(|mut guard| guard.take()) {
            task.abort();
        }
    }
}

/// Builds a [`GatewayClient`] per NAT manager client generation
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayClientFactory;

impl ClientFactory for GatewayClientFactory {
    fn create(&self, options: &ClientOptions) -> Arc<dyn PortMappingClient> {
        Arc::new(GatewayClient::new(options.clone()))
    }
}
