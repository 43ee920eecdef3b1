//! In-process transport
//!
//! A [`LoopbackHub`] plays the rendezvous service for any number of
//! [`LoopbackTransport`]s in the same process. Links are plain channel
//! pairs, so ordering within a link is preserved.

use crate::transport::{
    Directory, EndpointError, EndpointErrorKind, EndpointEvent, Link, LinkEvent, Transport,
    TransportError,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use parley_core::{Metadata, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;
const LINK_CAPACITY: usize = 256;

struct Endpoint {
    metadata: Metadata,
    events: mpsc::Sender<EndpointEvent>,
}

/// Shared switchboard for loopback transports
#[derive(Default)]
pub struct LoopbackHub {
    endpoints: RwLock<HashMap<PeerId, Endpoint>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport attached to this hub
    pub fn transport(self: &Arc<Self>) -> LoopbackTransport {
        LoopbackTransport {
            hub: Arc::clone(self),
            endpoint: Mutex::new(None),
            dial_count: AtomicUsize::new(0),
        }
    }

    /// Ids with an open endpoint
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .endpoints
            .read()
            .iter()
            .filter(|(_, ep)| !ep.events.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Deliver an endpoint error to `peer`. Returns false if it has no endpoint.
    pub async fn inject_error(&self, peer: &PeerId, error: EndpointError) -> bool {
        let events = match self.endpoints.read().get(peer) {
            Some(ep) => ep.events.clone(),
            None => return false,
        };
        events.send(EndpointEvent::Error(error)).await.is_ok()
    }
}

#[async_trait]
impl Directory for LoopbackHub {
    async fn list_reachable_peers(&self) -> Result<Vec<PeerId>, TransportError> {
        Ok(self.peers())
    }
}

/// Transport whose peers live in the same process
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    /// Our registered id and endpoint channel
    endpoint: Mutex<Option<(PeerId, mpsc::Sender<EndpointEvent>)>>,
    dial_count: AtomicUsize,
}

impl LoopbackTransport {
    /// Number of `connect` calls made through this transport
    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    fn local_id(&self) -> Option<PeerId> {
        self.endpoint.lock().as_ref().map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self, local: &Metadata) -> Result<mpsc::Receiver<EndpointEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let ours = self.local_id();

        {
            let mut endpoints = self.hub.endpoints.write();
            if let Some(existing) = endpoints.get(&local.id) {
                if !existing.events.is_closed() && ours.as_ref() != Some(&local.id) {
                    return Err(TransportError::Endpoint(EndpointError::new(
                        EndpointErrorKind::UnavailableId,
                        format!("ID \"{}\" is taken", local.id),
                    )));
                }
            }
            endpoints.insert(
                local.id.clone(),
                Endpoint {
                    metadata: local.clone(),
                    events: tx.clone(),
                },
            );
        }
        *self.endpoint.lock() = Some((local.id.clone(), tx.clone()));

        tx.send(EndpointEvent::Open {
            address: format!("loopback://{}", local.id),
        })
        .await
        .map_err(|_| TransportError::NotOpen)?;

        Ok(rx)
    }

    async fn connect(&self, peer: &PeerId, metadata: &Metadata) -> Result<Link, TransportError> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        let local = self.local_id().ok_or(TransportError::NotOpen)?;

        let (remote, remote_events) = {
            let endpoints = self.hub.endpoints.read();
            let ep = endpoints
                .get(peer)
                .filter(|ep| !ep.events.is_closed())
                .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;
            (ep.metadata.clone(), ep.events.clone())
        };

        debug!("Loopback link {} -> {}", local, peer);
        let (dialer, acceptor) = pipe((peer.clone(), remote), (local, metadata.clone()));

        remote_events
            .send(EndpointEvent::Connection(acceptor))
            .await
            .map_err(|_| TransportError::PeerUnavailable(peer.clone()))?;

        Ok(dialer)
    }

    async fn shutdown(&self) {
        let taken = self.endpoint.lock().take();
        if let Some((id, events)) = taken {
            {
                let mut endpoints = self.hub.endpoints.write();
                if endpoints
                    .get(&id)
                    .map_or(false, |ep| ep.events.same_channel(&events))
                {
                    endpoints.remove(&id);
                }
            }
            let _ = events.send(EndpointEvent::Closed).await;
        }
    }
}

/// Build both ends of a link.
///
/// `remote` is what the dialer sees, `local` is what the acceptor sees.
fn pipe(remote: (PeerId, Metadata), local: (PeerId, Metadata)) -> (Link, Link) {
    let (dialer_out, dialer_out_rx) = mpsc::channel(LINK_CAPACITY);
    let (acceptor_out, acceptor_out_rx) = mpsc::channel(LINK_CAPACITY);
    let (dialer_events, dialer_events_rx) = mpsc::channel(LINK_CAPACITY);
    let (acceptor_events, acceptor_events_rx) = mpsc::channel(LINK_CAPACITY);

    // fresh channels, Open always fits and is always first
    let _ = dialer_events.try_send(LinkEvent::Open(remote.1));
    let _ = acceptor_events.try_send(LinkEvent::Open(local.1));

    tokio::spawn(forward(dialer_out_rx, acceptor_events));
    tokio::spawn(forward(acceptor_out_rx, dialer_events));

    let dialer = Link {
        remote: remote.0,
        outbound: dialer_out,
        events: dialer_events_rx,
    };
    let acceptor = Link {
        remote: local.0,
        outbound: acceptor_out,
        events: acceptor_events_rx,
    };
    (dialer, acceptor)
}

async fn forward(mut outbound: mpsc::Receiver<Vec<u8>>, events: mpsc::Sender<LinkEvent>) {
    while let Some(bytes) = outbound.recv().await {
        if events.send(LinkEvent::Data(bytes)).await.is_err() {
            return;
        }
    }
    let _ = events.send(LinkEvent::Close).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(hub: &Arc<LoopbackHub>, id: &str) -> (LoopbackTransport, mpsc::Receiver<EndpointEvent>) {
        let transport = hub.transport();
        let mut events = transport.open(&Metadata::anonymous(id)).await.unwrap();
        match events.recv().await {
            Some(EndpointEvent::Open { address }) => assert_eq!(address, format!("loopback://{}", id)),
            other => panic!("expected open, got {:?}", other),
        }
        (transport, events)
    }

    #[tokio::test]
    async fn test_link_exchanges_metadata_and_data() {
        let hub = LoopbackHub::new();
        let (alice, _alice_events) = open(&hub, "alice").await;
        let (_bob, mut bob_events) = open(&hub, "bob").await;

        let mut link = alice
            .connect(&PeerId::from("bob"), &Metadata::anonymous("alice-asserted"))
            .await
            .unwrap();
        assert_eq!(alice.dial_count(), 1);

        let Some(EndpointEvent::Connection(mut accepted)) = bob_events.recv().await else {
            panic!("expected inbound connection");
        };
        assert_eq!(accepted.remote, PeerId::from("alice"));

        match link.events.recv().await {
            Some(LinkEvent::Open(meta)) => assert_eq!(meta.id, PeerId::from("bob")),
            other => panic!("unexpected {:?}", other),
        }
        match accepted.events.recv().await {
            Some(LinkEvent::Open(meta)) => assert_eq!(meta.id, PeerId::from("alice-asserted")),
            other => panic!("unexpected {:?}", other),
        }

        link.outbound.send(vec![1, 2, 3]).await.unwrap();
        assert!(matches!(
            accepted.events.recv().await,
            Some(LinkEvent::Data(bytes)) if bytes == vec![1, 2, 3]
        ));

        drop(link.outbound);
        assert!(matches!(accepted.events.recv().await, Some(LinkEvent::Close)));
    }

    #[tokio::test]
    async fn test_unknown_peer_and_taken_id() {
        let hub = LoopbackHub::new();
        let (alice, _events) = open(&hub, "alice").await;

        assert!(matches!(
            alice
                .connect(&PeerId::from("nobody"), &Metadata::anonymous("alice"))
                .await,
            Err(TransportError::PeerUnavailable(_))
        ));

        let imposter = hub.transport();
        match imposter.open(&Metadata::anonymous("alice")).await {
            Err(TransportError::Endpoint(e)) => assert_eq!(e.kind, EndpointErrorKind::UnavailableId),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_directory_and_shutdown() {
        let hub = LoopbackHub::new();
        let (alice, mut alice_events) = open(&hub, "alice").await;
        let (_bob, _bob_events) = open(&hub, "bob").await;

        assert_eq!(
            hub.list_reachable_peers().await.unwrap(),
            vec![PeerId::from("alice"), PeerId::from("bob")]
        );

        alice.shutdown().await;
        assert!(matches!(alice_events.recv().await, Some(EndpointEvent::Closed)));
        assert!(!hub.is_reachable(&PeerId::from("alice")).await.unwrap());
        assert!(hub.is_reachable(&PeerId::from("bob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_inject_error() {
        let hub = LoopbackHub::new();
        let (_alice, mut events) = open(&hub, "alice").await;

        let error = EndpointError::new(EndpointErrorKind::Network, "flap");
        assert!(hub.inject_error(&PeerId::from("alice"), error.clone()).await);
        assert!(matches!(events.recv().await, Some(EndpointEvent::Error(e)) if e == error));
        assert!(!hub.inject_error(&PeerId::from("bob"), error).await);
    }
}
