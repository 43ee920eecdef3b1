//! Envelope protocol: outbound sends, inbound dispatch and RPC handlers
//!
//! - `Json` payloads are encrypted; referenced files travel as resources
//! - `Binary` payloads are delivered as-is
//! - `Invoke` is answered by a registered handler with a `Reply`
//! - `Reply` completes the matching outbound call

use crate::connection::Connection;
use crate::correlation::{CallError, CallOptions, Correlator, DEFAULT_INVOKE_TIMEOUT};
use crate::transport::{EndpointError, TransportError};
use parking_lot::RwLock;
use parley_core::crypto::CryptoError;
use parley_core::resource::{extract_resources, reinject_resources, FileStore, ResourceError};
use parley_core::{now_millis, Body, Envelope, Metadata, Payload, PayloadCipher, PeerId, ResourceMap};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Envelope error: {0}")]
    Core(#[from] parley_core::Error),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Call(#[from] CallError),
}

impl ProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Call(CallError::Timeout(_)))
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::ConnectionClosed)
                | Self::Call(CallError::ConnectionClosed)
        )
    }
}

/// Protocol configuration
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// Default time to wait for a reply
    pub invoke_timeout: Duration,
    /// Encrypt invoke arguments and reply results
    pub seal_rpc: bool,
    /// Event bus capacity
    pub event_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            seal_rpc: true,
            event_capacity: 256,
        }
    }
}

/// Events published to application consumers
#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// Local endpoint registered with the rendezvous service
    ServerOpen { address: String },
    /// Local endpoint failed
    ServerError(EndpointError),
    /// Local endpoint closed
    ServerClosed,
    /// A connection finished opening
    PeerConnected { peer: PeerId, metadata: Metadata },
    /// A connection went away
    PeerDisconnected { peer: PeerId },
    /// Decrypted JSON from a peer
    Json {
        from: PeerId,
        sender: String,
        timestamp: u64,
        data: Value,
    },
    /// Raw bytes from a peer
    Binary {
        from: PeerId,
        sender: String,
        timestamp: u64,
        data: Vec<u8>,
    },
}

/// Boxed future returned by handlers
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// RPC handler: receives the argument list, returns the result
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Method name -> handler
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerTable {
    /// Register a handler, replacing any previous one. Returns true on replace.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |argv: Vec<Value>| -> HandlerFuture {
            Box::pin(handler(argv))
        });
        self.handlers.write().insert(name.into(), handler).is_some()
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Envelope protocol engine shared by every connection of a session
pub struct Protocol {
    /// Local id as sent on the wire
    client_id: String,
    cipher: Arc<PayloadCipher>,
    store: Arc<dyn FileStore>,
    handlers: HandlerTable,
    correlator: Correlator,
    events: broadcast::Sender<PeerEvent>,
    config: ProtocolConfig,
}

impl Protocol {
    pub fn new(
        local_id: PeerId,
        cipher: Arc<PayloadCipher>,
        store: Arc<dyn FileStore>,
        config: ProtocolConfig,
    ) -> Result<Self, ProtocolError> {
        let client_id = cipher.seal_text(local_id.as_str())?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            client_id,
            cipher,
            store,
            handlers: HandlerTable::default(),
            correlator: Correlator::new(config.invoke_timeout),
            events,
            config,
        })
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Subscribe to application events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Publish an event; having no subscribers is fine
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn rpc_cipher(&self) -> Option<&PayloadCipher> {
        self.config.seal_rpc.then(|| self.cipher.as_ref())
    }

    fn envelope(&self, body: Body) -> Envelope {
        Envelope::new(self.client_id.clone(), now_millis(), body)
    }

    /// Recover a sender id from the wire form
    fn open_sender(&self, id: &str) -> String {
        self.cipher.open_text(id).unwrap_or_else(|_| id.to_string())
    }

    async fn send_envelope(
        &self,
        conn: &Connection,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        if !conn.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }
        let bytes = envelope.encode()?;
        debug!(
            "Sending {} envelope to {} ({} bytes)",
            envelope.kind(),
            conn.remote_id(),
            bytes.len()
        );
        conn.send(bytes).await?;
        Ok(())
    }

    /// Send encrypted JSON
    pub async fn send_json(&self, conn: &Connection, data: &Value) -> Result<(), ProtocolError> {
        if !conn.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }
        let resource = extract_resources(self.store.as_ref(), data).await?;
        let sealed = self.cipher.seal_value(data)?;
        let envelope = self.envelope(Body::Json {
            data: sealed,
            resource,
        });
        self.send_envelope(conn, &envelope).await
    }

    /// Send raw bytes
    pub async fn send_binary(&self, conn: &Connection, data: Vec<u8>) -> Result<(), ProtocolError> {
        let envelope = self.envelope(Body::Binary { data });
        self.send_envelope(conn, &envelope).await
    }

    /// Call a remote handler with the default timeout
    pub async fn invoke(
        &self,
        conn: &Connection,
        name: &str,
        argv: Vec<Value>,
    ) -> Result<Value, ProtocolError> {
        self.invoke_with(conn, name, argv, CallOptions::default())
            .await
    }

    /// Call a remote handler
    pub async fn invoke_with(
        &self,
        conn: &Connection,
        name: &str,
        argv: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, ProtocolError> {
        if !conn.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }

        let argv = Value::Array(argv);
        let resource = extract_resources(self.store.as_ref(), &argv).await?;
        let argv = Payload::wrap(&argv, self.rpc_cipher())?;

        let pending = self.correlator.register(conn.id(), options.timeout);
        let envelope = self.envelope(Body::Invoke {
            name: name.to_string(),
            argv,
            reply_id: pending.reply_id().to_string(),
            resource,
        });

        // dropping `pending` on any early return clears the entry
        self.send_envelope(conn, &envelope).await?;
        Ok(self.correlator.wait(pending, options.cancel).await?)
    }

    /// Handle one inbound frame from `conn`
    pub async fn handle_frame(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        bytes: &[u8],
    ) -> Result<(), ProtocolError> {
        if !conn.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }

        let Envelope {
            id,
            timestamp,
            body,
        } = Envelope::decode(bytes)?;
        debug!(
            "Received {} envelope from {} (sent {})",
            body.kind(),
            conn.remote_id(),
            timestamp
        );

        match body {
            Body::Json { data, resource } => {
                let mut data = self.cipher.open_value(&data)?;
                reinject_resources(self.store.as_ref(), &mut data, resource.as_ref()).await?;
                self.emit(PeerEvent::Json {
                    from: conn.remote_id(),
                    sender: self.open_sender(&id),
                    timestamp,
                    data,
                });
            }
            Body::Binary { data } => {
                self.emit(PeerEvent::Binary {
                    from: conn.remote_id(),
                    sender: self.open_sender(&id),
                    timestamp,
                    data,
                });
            }
            Body::Invoke {
                name,
                argv,
                reply_id,
                resource,
            } => {
                // handlers may call back into the same peer, so never block the reader
                let protocol = Arc::clone(self);
                let conn = Arc::clone(conn);
                tokio::spawn(async move {
                    if let Err(e) = protocol
                        .answer_invoke(&conn, name, argv, reply_id, resource)
                        .await
                    {
                        warn!("Failed to answer invoke from {}: {}", conn.remote_id(), e);
                    }
                });
            }
            Body::Reply {
                reply_id,
                result,
                error,
                resource,
            } => {
                self.complete_call(conn, reply_id, result, error, resource)
                    .await;
            }
        }
        Ok(())
    }

    async fn answer_invoke(
        &self,
        conn: &Connection,
        name: String,
        argv: Payload,
        reply_id: String,
        resource: Option<ResourceMap>,
    ) -> Result<(), ProtocolError> {
        let outcome = match self.handlers.get(&name) {
            Some(handler) => self.run_handler(handler, argv, resource).await,
            None => {
                debug!("No handler for {}", name);
                Err(format!("{} handler not found", name))
            }
        };

        let body = match outcome {
            Ok(result) => match self.wrap_result(&result).await {
                Ok((payload, resource)) => Body::Reply {
                    reply_id,
                    result: Some(payload),
                    error: None,
                    resource,
                },
                Err(e) => Body::Reply {
                    reply_id,
                    result: None,
                    error: Some(e.to_string()),
                    resource: None,
                },
            },
            Err(error) => Body::Reply {
                reply_id,
                result: None,
                error: Some(error),
                resource: None,
            },
        };

        self.send_envelope(conn, &self.envelope(body)).await
    }

    async fn run_handler(
        &self,
        handler: Handler,
        argv: Payload,
        resource: Option<ResourceMap>,
    ) -> Result<Value, String> {
        let mut argv = argv.unwrap_with(&self.cipher).map_err(|e| e.to_string())?;
        reinject_resources(self.store.as_ref(), &mut argv, resource.as_ref())
            .await
            .map_err(|e| e.to_string())?;

        let args = match argv {
            Value::Array(items) => items,
            other => vec![other],
        };
        handler(args).await.map_err(|e| format!("{:#}", e))
    }

    async fn wrap_result(
        &self,
        result: &Value,
    ) -> Result<(Payload, Option<ResourceMap>), ProtocolError> {
        let resource = extract_resources(self.store.as_ref(), result).await?;
        let payload = Payload::wrap(result, self.rpc_cipher())?;
        Ok((payload, resource))
    }

    async fn complete_call(
        &self,
        conn: &Connection,
        reply_id: String,
        result: Option<Payload>,
        error: Option<String>,
        resource: Option<ResourceMap>,
    ) {
        match self.correlator.connection_of(&reply_id) {
            Some(sent_on) if sent_on == conn.id() => {}
            Some(_) => {
                warn!(
                    "Dropping reply {} from {}: call was sent on another connection",
                    reply_id,
                    conn.remote_id()
                );
                return;
            }
            None => {
                debug!("Dropping reply {} with no pending call", reply_id);
                return;
            }
        }

        let outcome = match (result, error) {
            (Some(result), None) => self.open_result(result, resource).await,
            (None, Some(error)) => Err(CallError::Remote(error)),
            (Some(_), Some(_)) => Err(CallError::MalformedReply(
                "both result and error set".into(),
            )),
            (None, None) => Err(CallError::MalformedReply(
                "neither result nor error set".into(),
            )),
        };
        self.correlator.resolve(&reply_id, conn.id(), outcome);
    }

    async fn open_result(
        &self,
        result: Payload,
        resource: Option<ResourceMap>,
    ) -> Result<Value, CallError> {
        let mut value = result
            .unwrap_with(&self.cipher)
            .map_err(|e| CallError::MalformedReply(e.to_string()))?;
        reinject_resources(self.store.as_ref(), &mut value, resource.as_ref())
            .await
            .map_err(|e| CallError::Resource(e.to_string()))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DirStore;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const PASSPHRASE: &str = "protocol-tests";

    fn protocol(id: &str, dir: &TempDir, config: ProtocolConfig) -> Arc<Protocol> {
        let cipher = Arc::new(PayloadCipher::with_iterations(PASSPHRASE, 1_000));
        let store: Arc<dyn FileStore> =
            Arc::new(DirStore::new(dir.path().join("store")).with_share_dir(dir.path()));
        Arc::new(Protocol::new(PeerId::from(id), cipher, store, config).unwrap())
    }

    fn open_connection(remote: &str) -> (Arc<Connection>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(PeerId::from(remote), tx));
        conn.mark_open(Metadata::anonymous(remote));
        (conn, rx)
    }

    async fn next_envelope(rx: &mut mpsc::Receiver<Vec<u8>>) -> Envelope {
        Envelope::decode(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_handler_replies_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = protocol("server", &dir, ProtocolConfig::default());
        let (conn, mut rx) = open_connection("client");

        let invoke = Envelope::new(
            "client",
            1,
            Body::Invoke {
                name: "missing".into(),
                argv: Payload::Plain(json!([])),
                reply_id: "r-1".into(),
                resource: None,
            },
        );
        server
            .handle_frame(&conn, &invoke.encode().unwrap())
            .await
            .unwrap();

        let reply = next_envelope(&mut rx).await;
        match reply.body {
            Body::Reply {
                reply_id,
                result,
                error,
                ..
            } => {
                assert_eq!(reply_id, "r-1");
                assert!(result.is_none());
                assert_eq!(error.as_deref(), Some("missing handler not found"));
            }
            other => panic!("expected reply, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_invoke_matches_reply_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let client = protocol("client", &dir, ProtocolConfig::default());
        let (conn, mut rx) = open_connection("server");
        let cipher = PayloadCipher::with_iterations(PASSPHRASE, 1_000);

        let call = {
            let client = client.clone();
            let conn = conn.clone();
            tokio::spawn(async move { client.invoke(&conn, "foo", vec![json!(1), json!(2)]).await })
        };

        let sent = next_envelope(&mut rx).await;
        let Body::Invoke {
            name,
            argv,
            reply_id,
            ..
        } = sent.body
        else {
            panic!("expected invoke");
        };
        assert_eq!(name, "foo");
        assert!(argv.is_sealed());
        assert_eq!(argv.unwrap_with(&cipher).unwrap(), json!([1, 2]));

        // a reply for some other call leaves ours pending
        let stray = Envelope::new(
            "server",
            2,
            Body::Reply {
                reply_id: "not-ours".into(),
                result: Some(Payload::Plain(json!(0))),
                error: None,
                resource: None,
            },
        );
        client
            .handle_frame(&conn, &stray.encode().unwrap())
            .await
            .unwrap();
        assert!(client.correlator().contains(&reply_id));
        assert!(!call.is_finished());

        let reply = Envelope::new(
            "server",
            3,
            Body::Reply {
                reply_id: reply_id.clone(),
                result: Some(Payload::wrap(&json!(42), Some(&cipher)).unwrap()),
                error: None,
                resource: None,
            },
        );
        client
            .handle_frame(&conn, &reply.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!(42));
        assert!(!client.correlator().contains(&reply_id));
    }

    #[tokio::test]
    async fn test_handler_result_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = protocol("server", &dir, ProtocolConfig::default());
        server.handlers().register("add", |argv: Vec<Value>| async move {
            let sum: i64 = argv.iter().filter_map(|v| v.as_i64()).sum();
            Ok(json!(sum))
        });
        server.handlers().register("fail", |_argv: Vec<Value>| async move {
            Err::<Value, _>(anyhow::anyhow!("disk on fire"))
        });
        let (conn, mut rx) = open_connection("client");
        let cipher = PayloadCipher::with_iterations(PASSPHRASE, 1_000);

        for (name, reply_id) in [("add", "r-add"), ("fail", "r-fail")] {
            let invoke = Envelope::new(
                "client",
                1,
                Body::Invoke {
                    name: name.into(),
                    argv: Payload::wrap(&json!([2, 3, 4]), Some(&cipher)).unwrap(),
                    reply_id: reply_id.into(),
                    resource: None,
                },
            );
            server
                .handle_frame(&conn, &invoke.encode().unwrap())
                .await
                .unwrap();

            let Body::Reply {
                reply_id: got,
                result,
                error,
                ..
            } = next_envelope(&mut rx).await.body
            else {
                panic!("expected reply");
            };
            assert_eq!(got, reply_id);
            if name == "add" {
                assert!(error.is_none());
                assert_eq!(result.unwrap().unwrap_with(&cipher).unwrap(), json!(9));
            } else {
                assert!(result.is_none());
                assert_eq!(error.as_deref(), Some("disk on fire"));
            }
        }
    }

    #[tokio::test]
    async fn test_json_with_resource_reaches_subscriber() {
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = protocol("alice", &sender_dir, ProtocolConfig::default());
        let receiver = protocol("bob", &receiver_dir, ProtocolConfig::default());

        let file = sender_dir.path().join("hello.txt");
        tokio::fs::write(&file, b"attached bytes").await.unwrap();
        let original_path = file.to_string_lossy().into_owned();

        let (to_bob, mut wire) = open_connection("bob");
        let (from_alice, _unused) = open_connection("alice");
        let mut events = receiver.subscribe();

        sender
            .send_json(&to_bob, &json!({"text": "hi", "file": original_path}))
            .await
            .unwrap();
        let bytes = wire.recv().await.unwrap();

        let Body::Json { resource, .. } = Envelope::decode(&bytes).unwrap().body else {
            panic!("expected json");
        };
        assert_eq!(resource.unwrap().len(), 1);

        receiver.handle_frame(&from_alice, &bytes).await.unwrap();
        match events.recv().await.unwrap() {
            PeerEvent::Json {
                from, sender, data, ..
            } => {
                assert_eq!(from, PeerId::from("alice"));
                assert_eq!(sender, "alice");
                assert_eq!(data["text"], "hi");
                let local = data["file"].as_str().unwrap();
                assert_ne!(local, original_path);
                assert!(local.starts_with(&*receiver_dir.path().canonicalize().unwrap().to_string_lossy()));
                assert_eq!(tokio::fs::read(local).await.unwrap(), b"attached bytes");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_binary_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let a = protocol("alice", &dir, ProtocolConfig::default());
        let b = protocol("bob", &dir, ProtocolConfig::default());
        let (to_bob, mut wire) = open_connection("bob");
        let (from_alice, _unused) = open_connection("alice");
        let mut events = b.subscribe();

        a.send_binary(&to_bob, vec![0, 159, 146, 150]).await.unwrap();
        b.handle_frame(&from_alice, &wire.recv().await.unwrap())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            PeerEvent::Binary { data, .. } => assert_eq!(data, vec![0, 159, 146, 150]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_rpc_policy() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtocolConfig {
            seal_rpc: false,
            invoke_timeout: Duration::from_millis(50),
            ..ProtocolConfig::default()
        };
        let client = protocol("client", &dir, config);
        let (conn, mut rx) = open_connection("server");

        let result = client.invoke(&conn, "foo", vec![json!("x")]).await;
        let Body::Invoke { argv, .. } = next_envelope(&mut rx).await.body else {
            panic!("expected invoke");
        };
        assert_eq!(argv, Payload::Plain(json!(["x"])));
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(client.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_on_closed_connection() {
        let dir = tempfile::tempdir().unwrap();
        let client = protocol("client", &dir, ProtocolConfig::default());
        let (conn, _rx) = open_connection("server");
        conn.close();

        assert!(client
            .send_json(&conn, &json!({}))
            .await
            .unwrap_err()
            .is_connection_closed());
        assert!(client
            .invoke(&conn, "foo", vec![])
            .await
            .unwrap_err()
            .is_connection_closed());
        assert_eq!(client.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = protocol("bob", &dir, ProtocolConfig::default());
        let (from_alice, _rx) = open_connection("alice");

        let other = PayloadCipher::with_iterations("another-secret", 1_000);
        let envelope = Envelope::new(
            "alice",
            1,
            Body::Json {
                data: other.seal_value(&json!({"a": 1})).unwrap(),
                resource: None,
            },
        );
        let err = receiver
            .handle_frame(&from_alice, &envelope.encode().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Crypto(CryptoError::Decrypt)));
    }

    #[tokio::test]
    async fn test_invoke_and_reply_carry_resources() {
        let client_dir = tempfile::tempdir().unwrap();
        let server_dir = tempfile::tempdir().unwrap();
        let client = protocol("client", &client_dir, ProtocolConfig::default());
        let server = protocol("server", &server_dir, ProtocolConfig::default());

        let input = client_dir.path().join("input.txt");
        tokio::fs::write(&input, b"question").await.unwrap();
        let input = input.to_string_lossy().into_owned();

        let report = server_dir.path().join("report.txt");
        tokio::fs::write(&report, b"answer").await.unwrap();
        let report = report.to_string_lossy().into_owned();

        let (sent, produced) = (input.clone(), report.clone());
        server.handlers().register("inspect", move |argv: Vec<Value>| {
            let (sent, produced) = (sent.clone(), produced.clone());
            async move {
                let seen = argv[0].as_str().unwrap_or_default().to_string();
                let content = tokio::fs::read_to_string(&seen).await?;
                Ok::<_, anyhow::Error>(json!({
                    "moved": seen != sent,
                    "content": content,
                    "report": produced,
                }))
            }
        });

        let (to_server, mut client_wire) = open_connection("server");
        let (to_client, mut server_wire) = open_connection("client");

        let call = {
            let client = client.clone();
            let to_server = to_server.clone();
            let input = input.clone();
            tokio::spawn(async move { client.invoke(&to_server, "inspect", vec![json!(input)]).await })
        };

        let invoke = client_wire.recv().await.unwrap();
        let Body::Invoke { resource, .. } = Envelope::decode(&invoke).unwrap().body else {
            panic!("expected invoke");
        };
        assert!(resource.unwrap().contains_key(&input));

        server.handle_frame(&to_client, &invoke).await.unwrap();
        let reply = server_wire.recv().await.unwrap();
        let Body::Reply { resource, .. } = Envelope::decode(&reply).unwrap().body else {
            panic!("expected reply");
        };
        assert!(resource.unwrap().contains_key(&report));

        client.handle_frame(&to_server, &reply).await.unwrap();
        let result = call.await.unwrap().unwrap();

        assert_eq!(result["moved"], true);
        assert_eq!(result["content"], "question");

        let local = result["report"].as_str().unwrap();
        assert_ne!(local, report);
        let client_store = client_dir.path().join("store").canonicalize().unwrap();
        assert!(Path::new(local).starts_with(&client_store));
        assert_eq!(tokio::fs::read(local).await.unwrap(), b"answer");
    }

    #[tokio::test]
    async fn test_reply_with_both_or_neither_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let client = protocol("client", &dir, ProtocolConfig::default());
        let (conn, mut rx) = open_connection("server");

        let cases = [
            (Some(Payload::Plain(json!(1))), Some("boom".to_string())),
            (None, None),
        ];
        for (result, error) in cases {
            let call = {
                let client = client.clone();
                let conn = conn.clone();
                tokio::spawn(async move { client.invoke(&conn, "foo", vec![]).await })
            };
            let Body::Invoke { reply_id, .. } = next_envelope(&mut rx).await.body else {
                panic!("expected invoke");
            };

            let reply = Envelope::new(
                "server",
                1,
                Body::Reply {
                    reply_id,
                    result,
                    error,
                    resource: None,
                },
            );
            client
                .handle_frame(&conn, &reply.encode().unwrap())
                .await
                .unwrap();

            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                ProtocolError::Call(CallError::MalformedReply(_))
            ));
        }
        assert_eq!(client.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_on_other_connection_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let client = protocol("client", &dir, ProtocolConfig::default());
        let (conn, mut rx) = open_connection("server");
        let (other, _other_rx) = open_connection("mallory");

        let call = {
            let client = client.clone();
            let conn = conn.clone();
            tokio::spawn(async move { client.invoke(&conn, "foo", vec![]).await })
        };
        let Body::Invoke { reply_id, .. } = next_envelope(&mut rx).await.body else {
            panic!("expected invoke");
        };

        let reply = |value: Value| {
            Envelope::new(
                "server",
                1,
                Body::Reply {
                    reply_id: reply_id.clone(),
                    result: Some(Payload::Plain(value)),
                    error: None,
                    resource: None,
                },
            )
            .encode()
            .unwrap()
        };

        client
            .handle_frame(&other, &reply(json!("forged")))
            .await
            .unwrap();
        assert!(client.correlator().contains(&reply_id));
        assert!(!call.is_finished());

        client
            .handle_frame(&conn, &reply(json!("genuine")))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("genuine"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_invoke_leaves_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtocolConfig {
            invoke_timeout: Duration::from_millis(20),
            ..ProtocolConfig::default()
        };
        let client = protocol("client", &dir, config);
        let (conn, _rx) = open_connection("server");

        let gave_up = tokio::time::timeout(
            Duration::from_millis(5),
            client.invoke(&conn, "foo", vec![]),
        )
        .await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_cannot_ship_files_outside_store() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private.txt");
        tokio::fs::write(&private, b"secret key").await.unwrap();

        let cipher = Arc::new(PayloadCipher::with_iterations(PASSPHRASE, 1_000));
        let store: Arc<dyn FileStore> = Arc::new(DirStore::new(dir.path().join("store")));
        let server = Arc::new(
            Protocol::new(PeerId::from("server"), cipher, store, ProtocolConfig::default())
                .unwrap(),
        );
        server
            .handlers()
            .register("echo", |argv: Vec<Value>| async move { Ok(Value::Array(argv)) });
        let (conn, mut rx) = open_connection("client");

        let invoke = Envelope::new(
            "client",
            1,
            Body::Invoke {
                name: "echo".into(),
                argv: Payload::Plain(json!([private.to_string_lossy()])),
                reply_id: "r-echo".into(),
                resource: None,
            },
        );
        server
            .handle_frame(&conn, &invoke.encode().unwrap())
            .await
            .unwrap();

        let Body::Reply {
            result,
            error,
            resource,
            ..
        } = next_envelope(&mut rx).await.body
        else {
            panic!("expected reply");
        };
        assert!(result.is_none());
        assert!(resource.is_none());
        assert!(error.unwrap().contains("outside the store"));
    }

    #[test]
    fn test_handler_table() {
        let table = HandlerTable::default();
        assert!(!table.register("b", |_| async { Ok(Value::Null) }));
        assert!(table.register("b", |_| async { Ok(Value::Null) }));
        table.register("a", |_| async { Ok(Value::Null) });
        assert_eq!(table.names(), vec!["a", "b"]);
        assert!(table.unregister("a"));
        assert!(table.get("a").is_none());
    }
}
