//! IPC bus integration: request/response correlation, signing, tampering

use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmgate::config::IpcConfig;
use swarmgate::crypto::CipherSuite;
use swarmgate::ipc::{
    FnHandler, IpcBus, IpcMessage, MessageCodec, RequestTarget, MASTER_ID,
};
use swarmgate::Error;

const SECRET: &str = "integration-cluster-secret";

fn config() -> IpcConfig {
    IpcConfig {
        encrypt: true,
        sign: true,
        secret: Some(SECRET.to_string()),
        request_timeout_ms: 2_000,
        queue_capacity: 64,
        queue_timeout_secs: 1,
        binary_codec: true,
    }
}

fn suite() -> Arc<CipherSuite> {
    Arc::new(CipherSuite::derive(&SecretString::from(SECRET)).unwrap())
}

/// Wire two buses together over an in-memory duplex, as master and worker.
fn linked_buses(worker_id: &str) -> (Arc<IpcBus>, Arc<IpcBus>) {
    let (master_io, worker_io) = tokio::io::duplex(256 * 1024);
    let (master_read, master_write) = tokio::io::split(master_io);
    let (worker_read, worker_write) = tokio::io::split(worker_io);

    let master = Arc::new(IpcBus::new(MASTER_ID, &config(), Some(suite())));
    let worker = Arc::new(IpcBus::new(worker_id, &config(), Some(suite())));

    master.attach_peer(worker_id, master_read, master_write);
    worker.attach_peer(MASTER_ID, worker_read, worker_write);
    (master, worker)
}

/// A ping request resolves with the worker's payload and a matching
/// correlation id (observed through the resolved pending entry).
#[tokio::test]
async fn request_response_resolves_within_timeout() {
    let (master, worker) = linked_buses("w2");

    worker.register_handler(
        "ping",
        Arc::new(FnHandler::new(|_from: &str, _payload| {
            Ok(serde_json::json!({ "status": "alive" }))
        })),
    );

    let response = master
        .send_request(
            RequestTarget::Peer("w2".to_string()),
            "ping",
            serde_json::json!({}),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(response, serde_json::json!({ "status": "alive" }));
    assert_eq!(master.stats().pending_requests, 0);
    assert_eq!(master.stats().security_drops, 0);
}

/// Handlers run on encrypted payloads transparently; the wire carries only
/// the sealed envelope.
#[tokio::test]
async fn encrypted_event_payload_round_trips() {
    let (master, worker) = linked_buses("w1");

    let observed = Arc::new(std::sync::Mutex::new(serde_json::Value::Null));
    let sink = Arc::clone(&observed);
    worker.register_handler(
        "configure",
        Arc::new(FnHandler::new(move |_from: &str, payload: serde_json::Value| {
            *sink.lock().unwrap_or_else(|p| p.into_inner()) = payload;
            Ok(serde_json::Value::Null)
        })),
    );

    master
        .send_to_worker("w1", "configure", serde_json::json!({ "ttl": 300 }))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let seen = observed.lock().unwrap().clone();
    assert_eq!(seen, serde_json::json!({ "ttl": 300 }));
}

/// Tampered messages increment the security counter and never reach a
/// handler.
#[tokio::test]
async fn tampered_message_is_dropped() {
    let bus = Arc::new(IpcBus::new(MASTER_ID, &config(), Some(suite())));

    let invocations = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&invocations);
    bus.register_handler(
        "ping",
        Arc::new(FnHandler::new(move |_from: &str, _payload| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(serde_json::Value::Null)
        })),
    );

    let mut message = IpcMessage::event("w1", MASTER_ID, "ping", serde_json::json!({}));
    message.sign(&suite());
    // Flip a signed field after signing
    message.timestamp += 1;

    let frame = MessageCodec { binary: true }.encode(&message).unwrap();
    bus.handle_incoming(&frame).await;

    assert_eq!(invocations.load(Ordering::Relaxed), 0);
    assert_eq!(bus.stats().security_drops, 1);
}

/// A worker that never answers produces the typed "Request timeout" error
/// and leaves no pending entry behind.
#[tokio::test]
async fn silent_worker_times_out() {
    let (master, worker) = linked_buses("w4");
    worker.register_handler("stall", Arc::new(StallHandler));

    let err = master
        .send_request(
            RequestTarget::Peer("w4".to_string()),
            "stall",
            serde_json::json!({}),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(master.stats().pending_requests, 0);
}

struct StallHandler;

#[async_trait::async_trait]
impl swarmgate::ipc::EventHandler for StallHandler {
    async fn handle(
        &self,
        _from: &str,
        _payload: serde_json::Value,
    ) -> swarmgate::Result<serde_json::Value> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(serde_json::Value::Null)
    }
}

/// Broadcast tolerates unreachable peers and still reports deliveries to
/// the live ones.
#[tokio::test]
async fn broadcast_tolerates_partial_failure() {
    let (master, worker) = linked_buses("w1");

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    worker.register_handler(
        "announce",
        Arc::new(FnHandler::new(move |_from: &str, _payload| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(serde_json::Value::Null)
        })),
    );

    // Attach a second peer whose read side is immediately dropped
    let (dead_io, dropped) = tokio::io::duplex(1024);
    drop(dropped);
    let (dead_read, dead_write) = tokio::io::split(dead_io);
    master.attach_peer("w-dead", dead_read, dead_write);

    let delivered = master
        .broadcast("announce", serde_json::json!({ "generation": 2 }))
        .await;
    assert!(delivered >= 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received.load(Ordering::Relaxed), 1);
}
