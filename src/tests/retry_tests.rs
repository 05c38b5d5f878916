use super::helpers::FakeClient;
use crate::connectivity::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

type Recorded = Arc<Mutex<Vec<(&'static str, u32, u32)>>>;

fn recording_adapter(client: FakeClient, policy: RetryPolicy) -> (RetryAdapter<FakeClient>, Recorded) {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let adapter = RetryAdapter::new(client, policy).with_observer(Arc::new(
        move |attempt: &FailedAttempt<'_>| {
            sink.lock()
                .push((attempt.operation, attempt.attempt_number, attempt.retries_left));
        },
    ));
    (adapter, recorded)
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failures() {
    let (adapter, recorded) =
        recording_adapter(FakeClient::new("82.3.1.5").flaky(2), RetryPolicy::immediate(3));

    let ip = adapter.external_ip().await.unwrap();

    assert_eq!(ip.to_string(), "82.3.1.5");
    assert_eq!(adapter.inner().external_ip_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *recorded.lock(),
        vec![("external_ip", 1, 3), ("external_ip", 2, 2)]
    );
}

#[tokio::test]
async fn test_retry_gives_up_after_budget() {
    let (adapter, recorded) =
        recording_adapter(FakeClient::new("82.3.1.5").flaky(10), RetryPolicy::immediate(2));

    let err = adapter.external_ip().await.unwrap_err();

    assert!(matches!(err, MappingError::Timeout));
    assert_eq!(adapter.inner().external_ip_calls.load(Ordering::SeqCst), 3);
    assert_eq!(recorded.lock().len(), 3);
    assert_eq!(recorded.lock().last(), Some(&("external_ip", 3, 0)));
}

#[tokio::test]
async fn test_retry_wraps_map_and_destroy() {
    let (adapter, recorded) =
        recording_adapter(FakeClient::new("82.3.1.5").flaky(1), RetryPolicy::immediate(1));

    adapter
        .map(MappingRequest::same_port(4001, IpProtocol::TCP))
        .await
        .unwrap();
    adapter.destroy().await.unwrap();

    assert_eq!(adapter.inner().map_calls().len(), 1);
    assert_eq!(adapter.inner().destroy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*recorded.lock(), vec![("map", 1, 1)]);
}

#[tokio::test]
async fn test_retry_does_not_repeat_permanent_errors() {
    let backend = Arc::new(super::helpers::FakeBackend::default());
    let options = ClientOptions {
        description: "test".to_string(),
        ttl: 60,
        auto_update: false,
        gateway: None,
        enable_pmp: false,
    };
    let client = GatewayClient::with_backend(backend.clone(), options);
    client.destroy().await.unwrap();

    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let adapter = RetryAdapter::new(client, RetryPolicy::immediate(5)).with_observer(Arc::new(
        move |attempt: &FailedAttempt<'_>| {
            sink.lock()
                .push((attempt.operation, attempt.attempt_number, attempt.retries_left));
        },
    ));

    let err = adapter
        .map(MappingRequest::same_port(4001, IpProtocol::TCP))
        .await
        .unwrap_err();

    assert!(matches!(err, MappingError::ClientDestroyed));
    assert_eq!(recorded.lock().len(), 1);
    assert_eq!(backend.add_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_backs_off_exponentially() {
    let policy = RetryPolicy {
        retries: 3,
        min_delay: Duration::from_secs(1),
        factor: 2,
        max_delay: None,
    };
    let (adapter, _recorded) = recording_adapter(FakeClient::new("82.3.1.5").flaky(3), policy);

    let started = tokio::time::Instant::now();
    adapter.external_ip().await.unwrap();

    // 1s + 2s + 4s
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7));
    assert!(elapsed < Duration::from_secs(8));
}
