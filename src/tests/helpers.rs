//! Shared test helpers: recording fakes for the NAT manager collaborators

use crate::connectivity::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Port mapping client that records every call
pub struct FakeClient {
    external_ip: IpAddr,
    failing_ports: Vec<u16>,
    transient_failures: AtomicU32,
    map_delay: Option<Duration>,
    destroy_fails: bool,
    pub maps: Mutex<Vec<MappingRequest>>,
    pub external_ip_calls: AtomicUsize,
    pub destroy_calls: AtomicUsize,
}

impl FakeClient {
    pub fn new(external_ip: &str) -> Self {
        Self {
            external_ip: external_ip.parse().expect("valid test IP"),
            failing_ports: Vec::new(),
            transient_failures: AtomicU32::new(0),
            map_delay: None,
            destroy_fails: false,
            maps: Mutex::new(Vec::new()),
            external_ip_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    /// Mapping these ports always fails with a gateway error
    pub fn failing_ports(mut self, ports: &[u16]) -> Self {
        self.failing_ports = ports.to_vec();
        self
    }

    /// The next `count` operations fail with a timeout
    pub fn flaky(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Every destroy call fails with a timeout
    pub fn failing_destroy(mut self) -> Self {
        self.destroy_fails = true;
        self
    }

    /// Every map call takes this long
    pub fn map_delay(mut self, delay: Duration) -> Self {
        self.map_delay = Some(delay);
        self
    }

    pub fn map_calls(&self) -> Vec<MappingRequest> {
        self.maps.lock().clone()
    }

    fn take_transient_failure(&self) -> Result<(), MappingError> {
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            Err(MappingError::Timeout)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PortMappingClient for FakeClient {
    async fn map(&self, request: MappingRequest) -> Result<(), MappingError> {
        self.take_transient_failure()?;
        if let Some(delay) = self.map_delay {
            tokio::time::sleep(delay).await;
        }
        self.maps.lock().push(request);
        if self.failing_ports.contains(&request.public_port) {
            return Err(MappingError::GatewayError("ConflictInMappingEntry".to_string()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), MappingError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.destroy_fails {
            return Err(MappingError::Timeout);
        }
        self.take_transient_failure()
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.external_ip_calls.fetch_add(1, Ordering::SeqCst);
        self.take_transient_failure()?;
        Ok(self.external_ip)
    }
}

/// Factory handing out fresh [`FakeClient`]s and keeping them for inspection
pub struct FakeFactory {
    make: Box<dyn Fn() -> FakeClient + Send + Sync>,
    created: Mutex<Vec<Arc<FakeClient>>>,
    options: Mutex<Vec<ClientOptions>>,
}

impl FakeFactory {
    pub fn new(external_ip: &'static str) -> Arc<Self> {
        Self::with(move || FakeClient::new(external_ip))
    }

    pub fn with<F>(make: F) -> Arc<Self>
    where
        F: Fn() -> FakeClient + Send + Sync + 'static,
    {
        Arc::new(Self {
            make: Box::new(make),
            created: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn client(&self, index: usize) -> Arc<FakeClient> {
        self.created.lock()[index].clone()
    }

    pub fn latest(&self) -> Arc<FakeClient> {
        self.created.lock().last().cloned().expect("no client created")
    }

    pub fn last_options(&self) -> ClientOptions {
        self.options.lock().last().cloned().expect("no client created")
    }
}

impl ClientFactory for FakeFactory {
    fn create(&self, options: &ClientOptions) -> Arc<dyn PortMappingClient> {
        let client = Arc::new((self.make)());
        self.created.lock().push(client.clone());
        self.options.lock().push(options.clone());
        client
    }
}

/// Gateway protocol backend that records installed and removed mappings
#[derive(Default)]
pub struct FakeBackend {
    pub added: Mutex<Vec<(MappingRequest, u32)>>,
    pub removed: Mutex<Vec<MappingRequest>>,
    pub fail_removals: AtomicU32,
    /// Lifetime granted instead of the requested one
    pub grant_secs: Option<u32>,
    /// How long each AddPortMapping takes
    pub add_delay: Option<Duration>,
}

impl FakeBackend {
    pub fn add_count(&self) -> usize {
        self.added.lock().len()
    }
}

#[async_trait]
impl MappingBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn add_mapping(
        &self,
        request: MappingRequest,
        lifetime_secs: u32,
        _description: &str,
    ) -> Result<u32, MappingError> {
        if let Some(delay) = self.add_delay {
            tokio::time::sleep(delay).await;
        }
        self.added.lock().push((request, lifetime_secs));
        Ok(self.grant_secs.unwrap_or(lifetime_secs))
    }

    async fn remove_mapping(&self, request: MappingRequest) -> Result<(), MappingError> {
        let failed = self
            .fail_removals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MappingError::Timeout);
        }
        self.removed.lock().push(request);
        Ok(())
    }

    async fn external_ip(&self) -> Result<IpAddr, MappingError> {
        Ok("82.3.1.5".parse().expect("valid test IP"))
    }
}

/// Manager over the given listen addresses with a fake client factory and no retry delays
pub fn test_manager(
    config: crate::NatConfig,
    addrs: &[&str],
    factory: Arc<FakeFactory>,
) -> (NatManager, Arc<ObservedAddressBook>) {
    let source = Arc::new(StaticAddressSource::parse(addrs).expect("valid test addresses"));
    let sink = Arc::new(ObservedAddressBook::new());
    let manager = NatManager::new(config, "peer-1", source, sink.clone())
        .with_client_factory(factory)
        .with_retry_policy(RetryPolicy::immediate(2));
    (manager, sink)
}
