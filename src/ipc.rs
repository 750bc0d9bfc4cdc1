//! Inter-process message bus between the master and its workers
//!
//! Messages travel as length-prefixed frames over the child's stdio,
//! MessagePack-encoded with a JSON fallback. Signatures cover the canonical
//! `{id,type,from,to,timestamp}` tuple; payload encryption uses the IPC AAD
//! domain. Tampered or malformed frames are dropped before any handler runs.

use crate::config::IpcConfig;
use crate::crypto::{CipherSuite, SealedPayload, AAD_IPC};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Frames above this size are treated as corruption, not payload.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Address of the supervising process on the bus
pub const MASTER_ID: &str = "master";
/// Wildcard recipient
pub const BROADCAST_ID: &str = "broadcast";

/// Message categories on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Broadcast,
}

impl MessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Broadcast => "broadcast",
        }
    }
}

/// One bus message. Field names follow the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    pub to: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(rename = "_serialized", default)]
    pub serialized: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The signed subset, serialised in this exact field order.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    from: &'a str,
    to: &'a str,
    timestamp: i64,
}

/// Encrypted `data` envelope carried as a JSON string
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedEnvelope {
    encrypted: String,
    iv: String,
    #[serde(rename = "authTag")]
    auth_tag: String,
}

impl IpcMessage {
    pub fn new(kind: MessageKind, from: &str, to: &str, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            from: from.to_string(),
            to: to.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
            encrypted: false,
            signature: None,
            correlation_id: None,
            serialized: String::new(),
        }
    }

    /// Event payload convention: `{ "event": <name>, "payload": <value> }`
    pub fn event(from: &str, to: &str, event: &str, payload: serde_json::Value) -> Self {
        Self::new(
            MessageKind::Event,
            from,
            to,
            serde_json::json!({ "event": event, "payload": payload }),
        )
    }

    pub fn event_name(&self) -> Option<&str> {
        self.data.get("event").and_then(|v| v.as_str())
    }

    pub fn payload(&self) -> serde_json::Value {
        self.data
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    fn canonical_signed_bytes(&self) -> Vec<u8> {
        // serde_json keeps struct field order, giving a stable byte string
        serde_json::to_vec(&SignedFields {
            id: &self.id,
            kind: self.kind.as_str(),
            from: &self.from,
            to: &self.to,
            timestamp: self.timestamp,
        })
        .unwrap_or_default()
    }

    pub fn sign(&mut self, suite: &CipherSuite) {
        self.signature = Some(suite.sign(&self.canonical_signed_bytes()));
    }

    pub fn verify_signature(&self, suite: &CipherSuite) -> bool {
        match &self.signature {
            Some(signature) => suite.verify(&self.canonical_signed_bytes(), signature),
            None => false,
        }
    }

    /// Replace `data` with the sealed envelope string.
    pub fn encrypt_data(&mut self, suite: &CipherSuite) -> Result<()> {
        let plaintext = serde_json::to_vec(&self.data)?;
        let sealed = suite.seal(AAD_IPC, &plaintext)?;
        let envelope = EncryptedEnvelope {
            encrypted: hex::encode(&sealed.ciphertext),
            iv: hex::encode(sealed.nonce),
            auth_tag: hex::encode(sealed.tag),
        };
        self.data = serde_json::Value::String(serde_json::to_string(&envelope)?);
        self.encrypted = true;
        Ok(())
    }

    /// Reverse of `encrypt_data`; failures are security errors.
    pub fn decrypt_data(&mut self, suite: &CipherSuite) -> Result<()> {
        if !self.encrypted {
            return Ok(());
        }
        let raw = self
            .data
            .as_str()
            .ok_or_else(|| Error::Security("encrypted data is not a string".to_string()))?;
        let envelope: EncryptedEnvelope = serde_json::from_str(raw)
            .map_err(|_| Error::Security("malformed encryption envelope".to_string()))?;
        let sealed = SealedPayload::from_hex(&envelope.encrypted, &envelope.iv, &envelope.auth_tag)
            .map_err(|e| Error::Security(e.to_string()))?;
        let plaintext = suite
            .open(AAD_IPC, &sealed)
            .map_err(|e| Error::Security(e.to_string()))?;
        self.data = serde_json::from_slice(&plaintext)?;
        self.encrypted = false;
        Ok(())
    }
}

/// Wire codec: MessagePack preferred, JSON fallback, tagged per message
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    pub binary: bool,
}

impl MessageCodec {
    pub fn encode(&self, msg: &IpcMessage) -> Result<Vec<u8>> {
        let mut msg = msg.clone();
        if self.binary {
            msg.serialized = "msgpack".to_string();
            match rmp_serde::to_vec_named(&msg) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(error = %e, "msgpack encode failed, falling back to json");
                }
            }
        }
        msg.serialized = "json".to_string();
        Ok(serde_json::to_vec(&msg)?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<IpcMessage> {
        // JSON frames start with '{'; anything else is MessagePack
        if bytes.first() == Some(&b'{') {
            Ok(serde_json::from_slice(bytes)?)
        } else {
            Ok(rmp_serde::from_slice(bytes)?)
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(Error::Resource("IPC frame exceeds size limit".to_string()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(Error::Security(format!(
            "oversized IPC frame: {} bytes",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Platform/runtime messages (not ours) are silently ignored: they lack the
/// required envelope fields or carry known platform keys.
pub fn is_platform_message(value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return true;
    };
    if obj.contains_key("cmd") || obj.contains_key("NODE_UNIQUE_ID") {
        return true;
    }
    !(obj.contains_key("id")
        && obj.contains_key("type")
        && obj.contains_key("from")
        && obj.contains_key("to")
        && obj.contains_key("timestamp"))
}

/// Handler for a named event; requests answer with the returned value.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, from: &str, payload: serde_json::Value) -> Result<serde_json::Value>;
}

/// Convenience wrapper for closures
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&str, serde_json::Value) -> Result<serde_json::Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&str, serde_json::Value) -> Result<serde_json::Value> + Send + Sync,
{
    async fn handle(&self, from: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        (self.0)(from, payload)
    }
}

/// Target selection for `send_request`
#[derive(Debug, Clone)]
pub enum RequestTarget {
    Peer(String),
    Random,
    /// The peer with the most free space in its send queue
    LeastLoaded,
}

struct PeerHandle {
    tx: mpsc::Sender<IpcMessage>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

#[derive(Debug, Default)]
pub struct IpcCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub security_drops: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Counter snapshot for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcStats {
    pub sent: u64,
    pub received: u64,
    pub dropped_invalid: u64,
    pub security_drops: u64,
    pub timeouts: u64,
    pub peers: usize,
    pub pending_requests: usize,
}

/// The bus itself: one per process, addressed by node id.
pub struct IpcBus {
    node_id: String,
    codec: MessageCodec,
    suite: Option<Arc<CipherSuite>>,
    encrypt: bool,
    sign: bool,
    request_timeout: Duration,
    queue_capacity: usize,
    queue_timeout: Duration,
    peers: DashMap<String, PeerHandle>,
    pending: Arc<DashMap<String, oneshot::Sender<IpcMessage>>>,
    handlers: Arc<DashMap<String, Arc<dyn EventHandler>>>,
    counters: Arc<IpcCounters>,
    debug_frames: bool,
}

impl IpcBus {
    pub fn new(node_id: &str, config: &IpcConfig, suite: Option<Arc<CipherSuite>>) -> Self {
        let debug_frames = std::env::var("DEBUG_IPC").map(|v| v == "1").unwrap_or(false);
        Self {
            node_id: node_id.to_string(),
            codec: MessageCodec {
                binary: config.binary_codec,
            },
            encrypt: config.encrypt && suite.is_some(),
            sign: config.sign && suite.is_some(),
            suite,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            queue_capacity: config.queue_capacity,
            queue_timeout: Duration::from_secs(config.queue_timeout_secs),
            peers: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            handlers: Arc::new(DashMap::new()),
            counters: Arc::new(IpcCounters::default()),
            debug_frames,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn counters(&self) -> &Arc<IpcCounters> {
        &self.counters
    }

    pub fn stats(&self) -> IpcStats {
        IpcStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            dropped_invalid: self.counters.dropped_invalid.load(Ordering::Relaxed),
            security_drops: self.counters.security_drops.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            peers: self.peers.len(),
            pending_requests: self.pending.len(),
        }
    }

    pub fn register_handler(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event.to_string(), handler);
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.key().clone()).collect()
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Attach a peer over any duplex byte stream (child stdio in
    /// production, an in-memory duplex in tests).
    pub fn attach_peer<R, W>(self: &Arc<Self>, peer_id: &str, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<IpcMessage>(self.queue_capacity);

        let codec = self.codec;
        let debug_frames = self.debug_frames;
        let writer_peer = peer_id.to_string();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = rx.recv().await {
                match codec.encode(&msg) {
                    Ok(bytes) => {
                        if debug_frames {
                            debug!(peer = %writer_peer, bytes = bytes.len(), id = %msg.id, "ipc frame out");
                        }
                        if let Err(e) = write_frame(&mut writer, &bytes).await {
                            warn!(peer = %writer_peer, error = %e, "ipc write failed, peer channel closed");
                            break;
                        }
                    }
                    Err(e) => warn!(peer = %writer_peer, error = %e, "ipc encode failed"),
                }
            }
        });

        let bus = Arc::clone(self);
        let reader_peer = peer_id.to_string();
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(bytes)) => bus.handle_incoming(&bytes).await,
                    Ok(None) => {
                        debug!(peer = %reader_peer, "ipc peer closed");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %reader_peer, error = %e, "ipc read failed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.peers.insert(
            peer_id.to_string(),
            PeerHandle {
                tx,
                writer_task,
                reader_task,
            },
        ) {
            previous.writer_task.abort();
            previous.reader_task.abort();
        }
    }

    pub fn detach_peer(&self, peer_id: &str) {
        if let Some((_, handle)) = self.peers.remove(peer_id) {
            handle.writer_task.abort();
            handle.reader_task.abort();
        }
    }

    /// Fire-and-forget event to one peer.
    pub async fn send_to_worker(
        &self,
        peer_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let msg = IpcMessage::event(&self.node_id, peer_id, event, payload);
        self.dispatch(peer_id, msg).await
    }

    /// Request/response with correlation-id matching.
    pub async fn send_request(
        &self,
        target: RequestTarget,
        event: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let peer_id = match target {
            RequestTarget::Peer(id) => id,
            RequestTarget::Random => {
                let ids = self.peer_ids();
                if ids.is_empty() {
                    return Err(Error::Resource("no peers attached".to_string()));
                }
                ids[fastrand::usize(..ids.len())].clone()
            }
            RequestTarget::LeastLoaded => self
                .peers
                .iter()
                .max_by_key(|p| p.tx.capacity())
                .map(|p| p.key().clone())
                .ok_or_else(|| Error::Resource("no peers attached".to_string()))?,
        };

        let mut msg = IpcMessage::event(&self.node_id, &peer_id, event, payload);
        msg.kind = MessageKind::Request;

        let (tx, rx) = oneshot::channel();
        let request_id = msg.id.clone();
        self.pending.insert(request_id.clone(), tx);

        if let Err(e) = self.dispatch(&peer_id, msg).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let timeout = timeout.unwrap_or(self.request_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.data.get("error").and_then(|e| e.as_str()) {
                    return Err(Error::Transient(error.to_string()));
                }
                Ok(response.payload())
            }
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(Error::Internal("response channel dropped".to_string()))
            }
            Err(_) => {
                // Late responses find no pending entry and are dropped
                self.pending.remove(&request_id);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::Timeout("Request timeout".to_string()))
            }
        }
    }

    /// Deliver to every live peer; per-peer failure is tolerated.
    pub async fn broadcast(&self, event: &str, payload: serde_json::Value) -> usize {
        let peer_ids = self.peer_ids();
        let mut delivered = 0usize;
        for peer_id in peer_ids {
            let mut msg = IpcMessage::event(&self.node_id, BROADCAST_ID, event, payload.clone());
            msg.kind = MessageKind::Broadcast;
            match self.dispatch(&peer_id, msg).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %peer_id, error = %e, "broadcast delivery failed"),
            }
        }
        delivered
    }

    async fn dispatch(&self, peer_id: &str, mut msg: IpcMessage) -> Result<()> {
        if let Some(suite) = &self.suite {
            if self.encrypt {
                msg.encrypt_data(suite)?;
            }
            if self.sign {
                msg.sign(suite);
            }
        }

        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| Error::Validation(format!("unknown peer: {}", peer_id)))?;
        let tx = peer.tx.clone();
        drop(peer);

        match tx.try_send(msg) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                // Back-pressure: wait up to the queue timeout, then reject
                match tokio::time::timeout(self.queue_timeout, tx.send(msg)).await {
                    Ok(Ok(())) => {
                        self.counters.sent.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    _ => Err(Error::Resource("queue full".to_string())),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Transient(format!("peer {} channel closed", peer_id)))
            }
        }
    }

    /// Process one raw incoming frame. Exposed for direct testing.
    pub async fn handle_incoming(self: &Arc<Self>, bytes: &[u8]) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        // Pre-decode as a loose value so platform chatter never reaches the
        // typed path.
        if bytes.first() == Some(&b'{') {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
                if is_platform_message(&value) {
                    return;
                }
            }
        }

        let mut msg = match self.codec.decode(bytes) {
            Ok(msg) => msg,
            Err(_) => {
                self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(e) = self.validate(&msg) {
            warn!(error = %e, "invalid ipc message dropped");
            self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(suite) = &self.suite {
            if self.sign && !msg.verify_signature(suite) {
                // Tampered or unsigned: drop before any handler runs
                self.counters.security_drops.fetch_add(1, Ordering::Relaxed);
                warn!(from = %msg.from, id = %msg.id, "ipc signature mismatch, message dropped");
                return;
            }
            if msg.encrypted {
                if let Err(e) = msg.decrypt_data(suite) {
                    self.counters.security_drops.fetch_add(1, Ordering::Relaxed);
                    warn!(from = %msg.from, error = %e, "ipc decryption failed, message dropped");
                    return;
                }
            }
        }

        if self.debug_frames {
            debug!(id = %msg.id, kind = ?msg.kind, from = %msg.from, "ipc frame in");
        }

        match msg.kind {
            MessageKind::Response => {
                if let Some(correlation_id) = msg.correlation_id.clone() {
                    if let Some((_, tx)) = self.pending.remove(&correlation_id) {
                        let _ = tx.send(msg);
                    }
                    // No pending entry: the caller timed out, drop silently
                }
            }
            MessageKind::Request => {
                let Some(event) = msg.event_name().map(|s| s.to_string()) else {
                    self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let handler = self.handlers.get(&event).map(|h| Arc::clone(h.value()));
                let reply_to = msg.from.clone();
                let correlation_id = msg.id.clone();

                let data = match handler {
                    Some(handler) => match handler.handle(&msg.from, msg.payload()).await {
                        Ok(value) => serde_json::json!({ "payload": value }),
                        Err(e) => serde_json::json!({ "error": e.to_string() }),
                    },
                    None => serde_json::json!({ "error": format!("no handler for {}", event) }),
                };

                let mut response =
                    IpcMessage::new(MessageKind::Response, &self.node_id, &reply_to, data);
                response.correlation_id = Some(correlation_id);
                if let Err(e) = self.dispatch(&reply_to, response).await {
                    warn!(peer = %reply_to, error = %e, "failed to deliver ipc response");
                }
            }
            MessageKind::Event | MessageKind::Broadcast => {
                let Some(event) = msg.event_name().map(|s| s.to_string()) else {
                    debug!(id = %msg.id, "ipc event without name dropped");
                    self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let handler = self.handlers.get(&event).map(|h| Arc::clone(h.value()));
                match handler {
                    Some(handler) => {
                        if let Err(e) = handler.handle(&msg.from, msg.payload()).await {
                            warn!(event = %event, error = %e, "ipc event handler failed");
                        }
                    }
                    None => debug!(event = %event, "no handler registered, event ignored"),
                }
            }
        }
    }

    fn validate(&self, msg: &IpcMessage) -> Result<()> {
        if msg.id.is_empty() || msg.from.is_empty() || msg.to.is_empty() {
            return Err(Error::Validation("missing required fields".to_string()));
        }
        if msg.timestamp <= 0 {
            return Err(Error::Validation("timestamp must be a number".to_string()));
        }
        // Recipients must be us, broadcast, or a peer we know about
        if msg.to != self.node_id && msg.to != BROADCAST_ID && !self.peers.contains_key(&msg.to) {
            return Err(Error::Validation(format!("unknown recipient: {}", msg.to)));
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        for peer in self.peers.iter() {
            peer.writer_task.abort();
            peer.reader_task.abort();
        }
        self.peers.clear();
        self.pending.clear();
    }
}
