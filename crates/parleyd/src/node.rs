//! parleyd node - session wiring, built-in handlers and event logging

use crate::config::Config;
use parley_core::resource::find_file_references;
use parley_core::{FileStore, PayloadCipher, PeerId};
use parley_net::{
    DirStore, Directory, PeerEvent, Session, SessionConfig, SessionState, TcpTransport, Transport,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A running daemon
pub struct Node {
    session: Arc<Session>,
    dial: Vec<PeerId>,
}

impl Node {
    /// Build a node that talks TCP to the peers listed in `config`
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let book = Arc::new(config.peer_book());
        let transport = Arc::new(TcpTransport::new(config.listen, book.clone()));
        let store = config
            .share_dirs
            .iter()
            .fold(DirStore::new(&config.store_dir), |store, dir| {
                store.with_share_dir(dir)
            });
        let store: Arc<dyn FileStore> = Arc::new(store);
        let cipher = Arc::new(PayloadCipher::new(&config.passphrase));

        let mut node = Self::build(config.session_config(), transport, book, cipher, store)?;
        node.dial = config.dial.iter().map(|p| PeerId::from(p.as_str())).collect();
        Ok(node)
    }

    /// Build a node over any transport
    pub fn build(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
        cipher: Arc<PayloadCipher>,
        store: Arc<dyn FileStore>,
    ) -> anyhow::Result<Self> {
        let session = Session::new(config, transport, directory, cipher, store)?;
        register_builtin_handlers(&session);
        Ok(Self {
            session,
            dial: Vec::new(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run until `shutdown` resolves or the session gives up
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let logger = spawn_event_logger(self.session.subscribe());
        let mut state = self.session.watch_state();
        self.session.start()?;

        let result = tokio::select! {
            _ = shutdown => {
                info!("Received shutdown signal");
                Ok(())
            }
            result = self.supervise(&mut state) => result,
        };

        self.session.destroy().await;
        logger.abort();
        result
    }

    async fn supervise(
        &self,
        state: &mut tokio::sync::watch::Receiver<SessionState>,
    ) -> anyhow::Result<()> {
        let mut dialed = false;
        loop {
            let current = *state.borrow_and_update();
            match current {
                SessionState::Connected if !dialed => {
                    dialed = true;
                    self.ping_all().await;
                }
                SessionState::Error => {
                    anyhow::bail!(
                        "Endpoint failed after {} reconnect attempts",
                        self.session.retry_count()
                    );
                }
                _ => {}
            }
            state.changed().await?;
        }
    }

    /// Ping every configured peer once
    pub async fn ping_all(&self) {
        for peer in &self.dial {
            let started = Instant::now();
            match self.session.invoke(peer, "ping", vec![]).await {
                Ok(reply) => info!("Ping {} -> {} in {:?}", peer, reply, started.elapsed()),
                Err(e) => warn!("Ping {} failed: {}", peer, e),
            }
        }
    }
}

/// Handlers every node answers
pub fn register_builtin_handlers(session: &Session) {
    session.register_handler("ping", |_argv: Vec<Value>| async { Ok(json!("pong")) });

    // echoing a path would make this node read and ship that file back
    session.register_handler("echo", |argv: Vec<Value>| async move {
        let argv = Value::Array(argv);
        if let Some(path) = find_file_references(&argv).into_iter().next() {
            anyhow::bail!("echo does not return file paths: {}", path);
        }
        Ok(argv)
    });

    let profile = session.local().clone();
    session.register_handler("profile", move |_argv: Vec<Value>| {
        let profile = profile.clone();
        async move { Ok::<_, anyhow::Error>(serde_json::to_value(&profile)?) }
    });
}

fn spawn_event_logger(mut events: broadcast::Receiver<PeerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event log fell behind, skipped {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &PeerEvent) {
    match event {
        PeerEvent::ServerOpen { address } => info!("Endpoint open at {}", address),
        PeerEvent::ServerError(e) => error!("Endpoint error: {}", e),
        PeerEvent::ServerClosed => info!("Endpoint closed"),
        PeerEvent::PeerConnected { peer, metadata } => {
            info!("{} connected ({})", peer, metadata.info.name)
        }
        PeerEvent::PeerDisconnected { peer } => info!("{} disconnected", peer),
        PeerEvent::Json {
            from,
            sender,
            timestamp,
            data,
        } => info!("JSON from {} ({}) at {}: {}", from, sender, timestamp, data),
        PeerEvent::Binary {
            from, data, ..
        } => debug!("{} bytes from {}", data.len(), from),
    }
}
