//! End-to-end tests for the call bridge.
//!
//! Every scenario runs over the in-process transport and over the machine-local
//! transport, with endpoint files placed in a temp directory.

use callbridge_core::{
    connect, gateway, invoke, BridgeError, CallbackSet, CountingAllocator, EndpointDescriptor,
    Payload, ServiceHost, SharedAllocator, StatusCode, TransportRuntime, PASS_AND_GET_STRING,
};
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A runtime with a counting transport allocator and a private socket dir.
struct TestEnv {
    _dir: TempDir,
    counting: Arc<CountingAllocator<callbridge_core::HeapAllocator>>,
    runtime: Arc<TransportRuntime>,
}

impl TestEnv {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let counting = Arc::new(CountingAllocator::transport());
        let allocator: SharedAllocator = counting.clone();
        let runtime = Arc::new(
            TransportRuntime::new()
                .with_allocator(allocator)
                .with_socket_dir(dir.path()),
        );
        Self {
            _dir: dir,
            counting,
            runtime,
        }
    }
}

fn descriptors(name: &str) -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor::inproc(name).unwrap(),
        EndpointDescriptor::local(name).unwrap(),
    ]
}

fn shout(input: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(input);
    format!("{}!", text.to_uppercase()).into_bytes()
}

fn shouting_service() -> CallbackSet {
    CallbackSet::new().with(PASS_AND_GET_STRING, |input: &[u8]| {
        Ok(Some(Payload::Local(shout(input))))
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_strings_round_trip_on_every_transport() {
    for descriptor in descriptors("strings") {
        let env = TestEnv::new();
        let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
        host.initialize(shouting_service()).await.unwrap();

        let session = connect(&env.runtime, &descriptor).unwrap();
        for input in ["", "hello", "ünïcødé ✓ 日本語"] {
            let expected = String::from_utf8(shout(input.as_bytes())).unwrap();
            let output = gateway::pass_and_get_string(&session, input).await.unwrap();
            assert_eq!(output, expected, "on {}", descriptor);
        }

        drop(session);
        host.terminate().await.unwrap();
        assert!(env.counting.is_balanced(), "leak on {}", descriptor);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_without_service_is_server_unavailable() {
    for descriptor in descriptors("nobody") {
        let env = TestEnv::new();
        let session = connect(&env.runtime, &descriptor).unwrap();

        let result = invoke(&session, PASS_AND_GET_STRING, b"anyone?").await;
        assert_eq!(result.status(), StatusCode::RPC_S_SERVER_UNAVAILABLE);
        assert!(result.fault().is_some());
        assert!(result.output().is_none());

        let err = gateway::pass_and_get_string(&session, "anyone?")
            .await
            .unwrap_err();
        assert!(err.is_transport_fault());
        assert!(env.counting.is_balanced());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_result_is_success_with_no_output() {
    for descriptor in descriptors("empty") {
        let env = TestEnv::new();
        let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
        host.initialize(CallbackSet::new().with(PASS_AND_GET_STRING, |_: &[u8]| Ok(None)))
            .await
            .unwrap();

        let session = connect(&env.runtime, &descriptor).unwrap();
        let result = invoke(&session, PASS_AND_GET_STRING, b"ignored").await;
        assert!(result.is_success());
        assert!(result.output().is_none());
        assert_eq!(
            gateway::pass_and_get_string(&session, "ignored").await.unwrap(),
            ""
        );

        host.terminate().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_do_not_cross_talk() {
    for descriptor in descriptors("concurrent") {
        let env = TestEnv::new();
        let seen: Arc<Mutex<HashMap<Vec<u8>, usize>>> = Arc::default();

        let recorder = seen.clone();
        let callbacks = CallbackSet::new().with(PASS_AND_GET_STRING, move |input: &[u8]| {
            *recorder
                .lock()
                .unwrap()
                .entry(input.to_vec())
                .or_insert(0) += 1;
            Ok(Some(Payload::Local(shout(input))))
        });

        let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
        host.initialize(callbacks).await.unwrap();

        let session = Arc::new(connect(&env.runtime, &descriptor).unwrap());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                let input = format!("caller-{}", i);
                let output = gateway::pass_and_get_string(&session, &input).await.unwrap();
                (input, output)
            }));
        }

        for task in tasks {
            let (input, output) = task.await.unwrap();
            assert_eq!(output, format!("{}!", input.to_uppercase()));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 32);
        assert!(seen.values().all(|count| *count == 1));

        host.terminate().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_then_initialize_leaves_no_residual_callback() {
    for descriptor in descriptors("reinit") {
        let env = TestEnv::new();
        let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
        let session = connect(&env.runtime, &descriptor).unwrap();

        host.initialize(CallbackSet::new().with(PASS_AND_GET_STRING, |_: &[u8]| {
            Ok(Some(Payload::from("old".to_string())))
        }))
        .await
        .unwrap();
        assert_eq!(
            gateway::pass_and_get_string(&session, "x").await.unwrap(),
            "old"
        );

        host.terminate().await.unwrap();
        let between = invoke(&session, PASS_AND_GET_STRING, b"x").await;
        assert!(between.fault().is_some(), "on {}", descriptor);

        host.initialize(CallbackSet::new().with(PASS_AND_GET_STRING, |_: &[u8]| {
            Ok(Some(Payload::from("new".to_string())))
        }))
        .await
        .unwrap();
        assert_eq!(
            gateway::pass_and_get_string(&session, "x").await.unwrap(),
            "new"
        );

        host.terminate().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_waits_for_in_flight_dispatch() {
    for descriptor in descriptors("drain") {
        let env = TestEnv::new();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let callbacks = CallbackSet::new().with(PASS_AND_GET_STRING, move |_: &[u8]| {
            let _ = started_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
            Ok(Some(Payload::from("old".to_string())))
        });

        let host = Arc::new(ServiceHost::new(env.runtime.clone(), descriptor.clone()));
        host.initialize(callbacks).await.unwrap();

        let session = connect(&env.runtime, &descriptor).unwrap();
        let call = tokio::spawn(async move { gateway::pass_and_get_string(&session, "x").await });

        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let terminating = host.clone();
        let terminate = tokio::spawn(async move { terminating.terminate().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!terminate.is_finished(), "terminate must wait on {}", descriptor);

        release_tx.send(()).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), "old");
        terminate.await.unwrap().unwrap();
        assert!(!host.is_serving().await);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_can_terminate_its_own_host() {
    for descriptor in descriptors("self-stop") {
        let env = TestEnv::new();
        let host = Arc::new(ServiceHost::new(env.runtime.clone(), descriptor.clone()));

        let weak = Arc::downgrade(&host);
        let callbacks = CallbackSet::new().with("stop", move |_: &[u8]| {
            let host = weak.upgrade().ok_or(StatusCode::INTERNAL_ERROR)?;
            let handle = tokio::runtime::Handle::current();
            handle.block_on(host.terminate()).map_err(|e| e.status())?;

            // Still inside the old set's callback.
            let restart = handle.block_on(host.initialize(CallbackSet::new()));
            let status = restart.err().map(|e| e.status()).unwrap_or(StatusCode::SUCCESS);
            Ok(Some(Payload::from(status.raw().to_string())))
        });
        host.initialize(callbacks).await.unwrap();

        let session = connect(&env.runtime, &descriptor).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), invoke(&session, "stop", b""))
            .await
            .unwrap_or_else(|_| panic!("self-terminating call hung on {}", descriptor));
        assert!(result.is_success(), "on {}", descriptor);
        assert_eq!(
            result.output(),
            Some(StatusCode::RPC_S_DUPLICATE_ENDPOINT.raw().to_string().as_bytes())
        );

        // Waits until the old set is cleared, then serves again.
        host.initialize(shouting_service()).await.unwrap();
        assert_eq!(
            invoke(&session, "stop", b"").await.status(),
            StatusCode::RPC_S_PROCNUM_OUT_OF_RANGE
        );
        assert_eq!(
            gateway::pass_and_get_string(&session, "again").await.unwrap(),
            "AGAIN!"
        );

        host.terminate().await.unwrap();
        assert!(env.counting.is_balanced(), "leak on {}", descriptor);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocations_balance_across_mixed_outcomes() {
    for descriptor in descriptors("balance") {
        let env = TestEnv::new();
        let callbacks = shouting_service()
            .with("deny", |_: &[u8]| Err(StatusCode::from_raw(5)))
            .with("crash", |_: &[u8]| panic!("callback crashed"));
        let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
        host.initialize(callbacks).await.unwrap();

        let session = connect(&env.runtime, &descriptor).unwrap();
        assert!(invoke(&session, PASS_AND_GET_STRING, b"ok").await.is_success());
        assert_eq!(
            invoke(&session, "deny", b"no").await.status(),
            StatusCode::from_raw(5)
        );
        assert_eq!(
            invoke(&session, "crash", b"boom").await.status(),
            StatusCode::INTERNAL_ERROR
        );
        assert_eq!(
            invoke(&session, "missing", b"?").await.status(),
            StatusCode::RPC_S_PROCNUM_OUT_OF_RANGE
        );

        host.terminate().await.unwrap();
        assert_eq!(
            invoke(&session, PASS_AND_GET_STRING, b"late").await.status(),
            StatusCode::RPC_S_SERVER_UNAVAILABLE
        );

        assert!(env.counting.allocations() > 0);
        assert!(env.counting.is_balanced(), "leak on {}", descriptor);
    }
}

#[tokio::test]
async fn test_explicit_status_surfaces_as_status_error() {
    let env = TestEnv::new();
    let descriptor = EndpointDescriptor::inproc("status").unwrap();
    let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
    host.initialize(
        CallbackSet::new().with(PASS_AND_GET_STRING, |_: &[u8]| Err(StatusCode::from_raw(5))),
    )
    .await
    .unwrap();

    let session = connect(&env.runtime, &descriptor).unwrap();
    let err = gateway::pass_and_get_string(&session, "x").await.unwrap_err();
    assert!(matches!(err, BridgeError::Status(status) if status.raw() == 5));

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_non_utf8_reply_is_encoding_error() {
    let env = TestEnv::new();
    let descriptor = EndpointDescriptor::inproc("bytes").unwrap();
    let host = ServiceHost::new(env.runtime.clone(), descriptor.clone());
    host.initialize(CallbackSet::new().with(PASS_AND_GET_STRING, |_: &[u8]| {
        Ok(Some(Payload::Local(vec![0xff, 0xfe])))
    }))
    .await
    .unwrap();

    let session = connect(&env.runtime, &descriptor).unwrap();
    let err = gateway::pass_and_get_string(&session, "x").await.unwrap_err();
    assert_eq!(err.status(), StatusCode::NO_UNICODE_TRANSLATION);

    host.terminate().await.unwrap();
}

#[test]
fn test_malformed_descriptor_fails_before_connect() {
    for binding in ["ncalrpc:[]", "ncalrpc:[../etc]", "tcp:[svc]", "ncalrpc"] {
        let err = EndpointDescriptor::parse(binding).unwrap_err();
        assert!(matches!(err, BridgeError::Connection { .. }), "{}", binding);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_registration_fails_on_every_transport() {
    for descriptor in descriptors("duplicate") {
        let env = TestEnv::new();
        let first = ServiceHost::new(env.runtime.clone(), descriptor.clone());
        let second = ServiceHost::new(env.runtime.clone(), descriptor.clone());

        first.initialize(shouting_service()).await.unwrap();
        let err = second.initialize(shouting_service()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::RPC_S_DUPLICATE_ENDPOINT, "on {}", descriptor);

        first.terminate().await.unwrap();
    }
}
