//! Signed point-to-point message transport over TCP.
//!
//! Every send opens a fresh connection, writes one signed envelope, shuts down its
//! write side and closes. The listener reads each connection until the peer's EOF,
//! bounded by `max_payload_bytes` and the read timeout, checks the signature under
//! the configured [`VerificationPolicy`] and hands the message to the handler
//! registered for its type.

use crate::config::TransportConfig;
use crate::error::{HyphaError, Result};
use crate::identity::{Identity, NodeId};
use crate::model::Listing;
use crate::protocol::{self, Message, MessageType};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How inbound signatures are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// Verify senders whose key we learned from discovery; drop on mismatch.
    /// Senders we have never seen are dispatched unverified.
    #[default]
    KnownKeys,
    /// Treat `sender` as the Ed25519 public key and require a valid signature
    /// from every message.
    SelfCertifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// A single outbound delivery. Never reused and never reconnects.
#[derive(Debug)]
pub struct OutboundConnection {
    target: String,
    state: ConnectionState,
}

impl OutboundConnection {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{}:{}", host, port),
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Connect, write `bytes`, half-close and drop the stream.
    pub async fn deliver(&mut self, bytes: &[u8], connect_timeout: Duration) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(HyphaError::ConnectionFailed(format!(
                "connection to {} already used",
                self.target
            )));
        }

        self.state = ConnectionState::Connecting;
        let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Closed;
                return Err(HyphaError::ConnectionFailed(format!("{}: {}", self.target, e)));
            }
            Err(_) => {
                self.state = ConnectionState::Closed;
                return Err(HyphaError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.target, connect_timeout
                )));
            }
        };
        self.state = ConnectionState::Connected;

        let written = async {
            stream.write_all(bytes).await?;
            stream.shutdown().await
        }
        .await;
        self.state = ConnectionState::Closed;

        written.map_err(|e| HyphaError::ConnectionFailed(format!("{}: {}", self.target, e)))
    }
}

/// Sign the canonical bytes of `message` and store the hex signature on it.
pub fn sign_message(mut message: Message, key: &SigningKey) -> Result<Message> {
    message.signature = None;
    let bytes = protocol::canonical_bytes(&message)?;
    let signature = key.sign(&bytes);
    message.signature = Some(hex::encode(signature.to_bytes()));
    Ok(message)
}

/// `false` for a missing, malformed or mismatched signature.
pub fn verify_message(message: &Message, key: &VerifyingKey) -> bool {
    let Some(signature_hex) = message.signature.as_deref() else {
        return false;
    };
    let Ok(raw) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return false;
    };
    let Ok(bytes) = protocol::canonical_bytes(message) else {
        return false;
    };
    key.verify(&bytes, &signature).is_ok()
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Default)]
struct KnownPeer {
    key: Option<VerifyingKey>,
    endpoint: Option<(String, u16)>,
}

struct Listening {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct Transport {
    node_id: NodeId,
    signing_key: SigningKey,
    config: TransportConfig,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    peers: RwLock<HashMap<String, KnownPeer>>,
    listening: Mutex<Option<Listening>>,
}

impl Transport {
    pub fn new(identity: &Identity, config: TransportConfig) -> Self {
        Self {
            node_id: identity.node_id(),
            signing_key: identity.signing_key().clone(),
            config,
            handlers: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            listening: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Our id as it appears in the `sender` field.
    pub fn sender_id(&self) -> String {
        self.node_id.to_hex()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn sign(&self, message: Message) -> Result<Message> {
        sign_message(message, &self.signing_key)
    }

    pub fn verify(&self, message: &Message, key: &VerifyingKey) -> bool {
        verify_message(message, key)
    }

    /// Sign and deliver `message`. Returns `false` on any failure; nothing is retried.
    pub async fn send(&self, message: Message, host: &str, port: u16) -> bool {
        let message_type = message.message_type.clone();
        match self.try_send(message, host, port).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} to {}:{}: {}", message_type, host, port, e);
                false
            }
        }
    }

    pub async fn try_send(&self, message: Message, host: &str, port: u16) -> Result<()> {
        let signed = self.sign(message)?;
        let bytes = protocol::serialize(&signed)?;
        if bytes.len() > self.config.max_payload_bytes {
            return Err(HyphaError::Validation(format!(
                "envelope of {} bytes exceeds {} byte limit",
                bytes.len(),
                self.config.max_payload_bytes
            )));
        }

        let mut connection = OutboundConnection::new(host, port);
        connection.deliver(&bytes, self.config.connect_timeout()).await?;
        debug!("Sent {} to {}", signed.message_type, connection.target());
        Ok(())
    }

    /// Deliver to the recipient's address from the peer book.
    pub async fn send_to_peer(&self, message: Message) -> Result<()> {
        let (host, port) = self
            .peer_address(&message.recipient_id)
            .ok_or_else(|| HyphaError::UnknownPeer(message.recipient_id.clone()))?;
        self.try_send(message, &host, port).await
    }

    /// Bind and start accepting. Returns the bound address; when already listening
    /// the existing address is returned.
    pub async fn listen(self: &Arc<Self>, host: &str, port: u16) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| HyphaError::ConnectionFailed(format!("cannot listen on {}:{}: {}", host, port, e)))?;
        let addr = listener.local_addr()?;

        let transport = Arc::clone(self);
        let task = tokio::spawn(async move {
            transport.accept_loop(listener).await;
        });

        let mut listening = self.listening.lock();
        if let Some(existing) = listening.as_ref() {
            // lost a race with a concurrent listen()
            task.abort();
            return Ok(existing.addr);
        }
        *listening = Some(Listening { addr, task });
        info!("Transport listening on {} (node_id={})", addr, self.node_id.short());
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().as_ref().map(|l| l.addr)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.lock().is_some()
    }

    pub fn stop(&self) {
        if let Some(listening) = self.listening.lock().take() {
            listening.task.abort();
            info!("Transport on {} stopped", listening.addr);
        }
    }

    /// Install `handler` for `message_type`, replacing any earlier one.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        if self.handlers.write().insert(message_type.clone(), handler).is_some() {
            debug!("Replaced handler for {}", message_type);
        }
    }

    pub fn has_handler(&self, message_type: &MessageType) -> bool {
        self.handlers.read().contains_key(message_type)
    }

    /// Run the handler for the message's type. Returns whether one ran to completion.
    /// Handler errors and panics are logged and swallowed.
    pub async fn dispatch(&self, message: Message) -> bool {
        let message_type = message.message_type.clone();
        let handler = self.handlers.read().get(&message_type).cloned();
        let Some(handler) = handler else {
            debug!("No handler for {} from {}, dropping", message_type, message.sender_id);
            return false;
        };

        match tokio::spawn(async move { handler.handle(message).await }).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Handler for {} failed: {:#}", message_type, e);
                false
            }
            Err(e) if e.is_panic() => {
                error!("Handler for {} panicked", message_type);
                false
            }
            Err(e) => {
                warn!("Handler for {} cancelled: {}", message_type, e);
                false
            }
        }
    }

    /// Remember the signing key and endpoint advertised in a listing.
    pub fn learn_peer(&self, listing: &Listing) -> Result<NodeId> {
        let node_id: NodeId = listing.node_id.parse()?;
        let key = node_id.verifying_key()?;
        let mut peers = self.peers.write();
        let peer = peers.entry(node_id.to_hex()).or_default();
        peer.key = Some(key);
        if let (Some(host), Some(port)) = (&listing.host, listing.port) {
            peer.endpoint = Some((host.clone(), port));
        }
        Ok(node_id)
    }

    pub fn trust_key(&self, node_id: NodeId) -> Result<()> {
        let key = node_id.verifying_key()?;
        self.peers.write().entry(node_id.to_hex()).or_default().key = Some(key);
        Ok(())
    }

    pub fn remember_address(&self, node_id: &str, host: &str, port: u16) {
        self.peers
            .write()
            .entry(node_id.to_ascii_lowercase())
            .or_default()
            .endpoint = Some((host.to_string(), port));
    }

    pub fn peer_address(&self, node_id: &str) -> Option<(String, u16)> {
        self.peers
            .read()
            .get(&node_id.to_ascii_lowercase())
            .and_then(|p| p.endpoint.clone())
    }

    pub fn known_peers(&self) -> usize {
        self.peers.read().len()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let transport = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = transport.handle_inbound(stream).await {
                            warn!("Dropped inbound message from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_inbound(&self, mut stream: TcpStream) -> Result<()> {
        let limit = self.config.max_payload_bytes;
        let mut buf = Vec::with_capacity(4096);
        let mut limited = (&mut stream).take(limit as u64 + 1);
        tokio::time::timeout(self.config.read_timeout(), limited.read_to_end(&mut buf))
            .await
            .map_err(|_| HyphaError::Timeout(format!("no EOF within {:?}", self.config.read_timeout())))??;
        if buf.len() > limit {
            return Err(HyphaError::MalformedEnvelope(format!(
                "envelope exceeds {} bytes",
                limit
            )));
        }

        let message = protocol::deserialize(&buf)?;
        self.check_inbound(&message)?;
        debug!("Received {} from {}", message.message_type, message.sender_id);
        self.dispatch(message).await;
        Ok(())
    }

    fn check_inbound(&self, message: &Message) -> Result<()> {
        match self.config.verification {
            VerificationPolicy::SelfCertifying => {
                let key = message
                    .sender_id
                    .parse::<NodeId>()
                    .and_then(|id| id.verifying_key())
                    .map_err(|e| {
                        HyphaError::SignatureInvalid(format!("sender is not a public key: {}", e))
                    })?;
                if verify_message(message, &key) {
                    Ok(())
                } else {
                    Err(HyphaError::SignatureInvalid(format!(
                        "{} from {}",
                        message.message_type, message.sender_id
                    )))
                }
            }
            VerificationPolicy::KnownKeys => {
                let key = self
                    .peers
                    .read()
                    .get(&message.sender_id.to_ascii_lowercase())
                    .and_then(|p| p.key);
                match key {
                    Some(key) if verify_message(message, &key) => Ok(()),
                    Some(_) => Err(HyphaError::SignatureInvalid(format!(
                        "{} from {}",
                        message.message_type, message.sender_id
                    ))),
                    None => {
                        debug!("Accepting unverified message from unknown sender {}", message.sender_id);
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tokio::sync::mpsc;

    fn identity(byte: u8) -> Identity {
        Identity::derive(&[byte; 32]).unwrap()
    }

    fn test_config(verification: VerificationPolicy) -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            read_timeout_seconds: 2,
            connect_timeout_seconds: 2,
            verification,
            ..TransportConfig::default()
        }
    }

    fn ping(from: &Identity) -> Message {
        let mut payload = Map::new();
        payload.insert("nonce".to_string(), json!(7));
        Message::create(MessageType::Ping, from.node_id().to_hex(), "anyone", payload)
    }

    async fn recording_listener(
        id: &Identity,
        verification: VerificationPolicy,
    ) -> (Arc<Transport>, SocketAddr, mpsc::UnboundedReceiver<Message>) {
        let transport = Arc::new(Transport::new(id, test_config(verification)));
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_handler(
            MessageType::Ping,
            handler_fn(move |message| {
                let tx = tx.clone();
                async move {
                    tx.send(message)?;
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );
        let addr = transport.listen("127.0.0.1", 0).await.unwrap();
        (transport, addr, rx)
    }

    async fn expect_nothing(rx: &mut mpsc::UnboundedReceiver<Message>) {
        let got = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(got.is_err(), "handler should not have run");
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = identity(1);
        let signed = sign_message(ping(&alice), alice.signing_key()).unwrap();
        assert_eq!(signed.signature.as_ref().unwrap().len(), 128);
        assert!(verify_message(&signed, &alice.verifying_key()));
        assert!(!verify_message(&signed, &identity(2).verifying_key()));
    }

    #[test]
    fn test_any_mutation_breaks_signature() {
        let alice = identity(1);
        let key = alice.verifying_key();
        let signed = sign_message(ping(&alice), alice.signing_key()).unwrap();

        let mut m = signed.clone();
        m.timestamp += 1;
        assert!(!verify_message(&m, &key));

        let mut m = signed.clone();
        m.recipient_id.push('x');
        assert!(!verify_message(&m, &key));

        let mut m = signed.clone();
        m.message_type = MessageType::Pong;
        assert!(!verify_message(&m, &key));

        let mut m = signed.clone();
        m.payload.insert("nonce".to_string(), json!(8));
        assert!(!verify_message(&m, &key));

        let mut m = signed.clone();
        m.signature = None;
        assert!(!verify_message(&m, &key));

        let mut m = signed;
        m.signature = Some("not hex".to_string());
        assert!(!verify_message(&m, &key));
    }

    #[tokio::test]
    async fn test_outbound_connection_states() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut connection = OutboundConnection::new("127.0.0.1", port);
        assert_eq!(connection.state(), ConnectionState::Idle);

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });
        connection.deliver(b"hello", Duration::from_secs(1)).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(reader.await.unwrap(), b"hello");

        assert!(connection.deliver(b"again", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_send_and_dispatch() {
        let bob = identity(2);
        let (_transport, addr, mut rx) = recording_listener(&bob, VerificationPolicy::SelfCertifying).await;

        let alice = identity(1);
        let sender = Transport::new(&alice, test_config(VerificationPolicy::KnownKeys));
        assert!(sender.send(ping(&alice), "127.0.0.1", addr.port()).await);

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload["nonce"], json!(7));
        assert!(verify_message(&received, &alice.verifying_key()));
    }

    #[tokio::test]
    async fn test_send_to_closed_port_returns_false() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let alice = identity(1);
        let sender = Transport::new(&alice, test_config(VerificationPolicy::KnownKeys));
        assert!(!sender.send(ping(&alice), "127.0.0.1", port).await);
        match sender.try_send(ping(&alice), "127.0.0.1", port).await {
            Err(e) => assert!(e.is_retriable()),
            Ok(()) => panic!("Expected connection failure"),
        }
    }

    #[tokio::test]
    async fn test_tampered_message_from_known_peer_dropped() {
        let bob = identity(2);
        let (transport, addr, mut rx) = recording_listener(&bob, VerificationPolicy::KnownKeys).await;
        let alice = identity(1);
        transport.trust_key(alice.node_id()).unwrap();

        let mut forged = sign_message(ping(&alice), alice.signing_key()).unwrap();
        forged.payload.insert("nonce".to_string(), json!(999));
        let bytes = protocol::serialize(&forged).unwrap();
        OutboundConnection::new("127.0.0.1", addr.port())
            .deliver(&bytes, Duration::from_secs(1))
            .await
            .unwrap();

        expect_nothing(&mut rx).await;
    }

    #[tokio::test]
    async fn test_self_certifying_rejects_unsigned() {
        let bob = identity(2);
        let (_transport, addr, mut rx) = recording_listener(&bob, VerificationPolicy::SelfCertifying).await;
        let bytes = protocol::serialize(&ping(&identity(1))).unwrap();
        OutboundConnection::new("127.0.0.1", addr.port())
            .deliver(&bytes, Duration::from_secs(1))
            .await
            .unwrap();
        expect_nothing(&mut rx).await;
    }

    #[tokio::test]
    async fn test_oversized_and_garbage_input_dropped() {
        let bob = identity(2);
        let (transport, addr, mut rx) = recording_listener(&bob, VerificationPolicy::KnownKeys).await;

        let huge = vec![b'a'; transport.config().max_payload_bytes + 10];
        OutboundConnection::new("127.0.0.1", addr.port())
            .deliver(&huge, Duration::from_secs(1))
            .await
            .ok();
        OutboundConnection::new("127.0.0.1", addr.port())
            .deliver(b"{\"type\":", Duration::from_secs(1))
            .await
            .unwrap();
        expect_nothing(&mut rx).await;

        // listener is still healthy
        let alice = identity(1);
        let sender = Transport::new(&alice, test_config(VerificationPolicy::KnownKeys));
        assert!(sender.send(ping(&alice), "127.0.0.1", addr.port()).await);
        assert!(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let transport = Transport::new(&identity(3), test_config(VerificationPolicy::KnownKeys));
        let alice = identity(1);

        assert!(!transport.dispatch(ping(&alice)).await);

        transport.register_handler(MessageType::Ping, handler_fn(|_| async { Err::<(), _>(anyhow::anyhow!("boom")) }));
        assert!(!transport.dispatch(ping(&alice)).await);

        transport.register_handler(
            MessageType::Ping,
            handler_fn(|_| async {
                if true {
                    panic!("handler bug");
                }
                Ok::<(), anyhow::Error>(())
            }),
        );
        assert!(!transport.dispatch(ping(&alice)).await);

        transport.register_handler(MessageType::Ping, handler_fn(|_| async { Ok::<(), anyhow::Error>(()) }));
        assert!(transport.dispatch(ping(&alice)).await);
    }

    #[tokio::test]
    async fn test_learn_peer_records_endpoint() {
        let transport = Transport::new(&identity(3), test_config(VerificationPolicy::KnownKeys));
        let alice = identity(1);
        let listing = Listing::new(alice.node_id().to_hex(), alice.wallet_address())
            .with_endpoint("127.0.0.1", 9100);
        assert_eq!(transport.learn_peer(&listing).unwrap(), alice.node_id());
        assert_eq!(
            transport.peer_address(&alice.node_id().to_hex().to_uppercase()),
            Some(("127.0.0.1".to_string(), 9100))
        );

        let bogus = Listing::new("1234", "0x0");
        assert!(transport.learn_peer(&bogus).is_err());
    }

    #[tokio::test]
    async fn test_listen_twice_returns_same_address() {
        let transport = Arc::new(Transport::new(&identity(4), test_config(VerificationPolicy::KnownKeys)));
        let first = transport.listen("127.0.0.1", 0).await.unwrap();
        let second = transport.listen("127.0.0.1", 0).await.unwrap();
        assert_eq!(first, second);
        transport.stop();
        assert!(!transport.is_listening());
    }
}
