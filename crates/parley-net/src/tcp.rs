//! TCP transport
//!
//! Each link is one TCP stream carrying [`Frame`]s. Both sides open with a
//! `Hello` frame holding their postcard-encoded [`Metadata`]; envelopes follow
//! as `Envelope` frames and an orderly close sends `Goodbye`.
//!
//! Peers are located through a static [`PeerBook`] of `id -> address`.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::transport::{
    Directory, EndpointError, EndpointErrorKind, EndpointEvent, Link, LinkEvent, Transport,
    TransportError,
};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use parley_core::{Metadata, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;
const LINK_CAPACITY: usize = 256;

/// Default time allowed for the hello exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Known peers and their addresses
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: RwLock<HashMap<PeerId, SocketAddr>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: PeerId, addr: SocketAddr) {
        self.peers.write().insert(id, addr);
    }

    pub fn addr_of(&self, id: &PeerId) -> Option<SocketAddr> {
        self.peers.read().get(id).copied()
    }

    /// Parse an `id=host:port` entry
    pub fn parse_entry(entry: &str) -> Result<(PeerId, SocketAddr), String> {
        let (id, addr) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected id=host:port, got {:?}", entry))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(format!("missing peer id in {:?}", entry));
        }
        let addr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid address in {:?}: {}", entry, e))?;
        Ok((PeerId::from(id), addr))
    }
}

impl FromIterator<(PeerId, SocketAddr)> for PeerBook {
    fn from_iter<I: IntoIterator<Item = (PeerId, SocketAddr)>>(iter: I) -> Self {
        Self {
            peers: RwLock::new(iter.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Directory for PeerBook {
    async fn list_reachable_peers(&self) -> Result<Vec<PeerId>, TransportError> {
        let mut peers: Vec<PeerId> = self.peers.read().keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }
}

struct Endpoint {
    local_addr: SocketAddr,
    events: mpsc::Sender<EndpointEvent>,
    accept: JoinHandle<()>,
}

/// Transport over plain TCP
pub struct TcpTransport {
    listen: SocketAddr,
    book: Arc<PeerBook>,
    handshake_timeout: Duration,
    endpoint: Mutex<Option<Endpoint>>,
}

impl TcpTransport {
    pub fn new(listen: SocketAddr, book: Arc<PeerBook>) -> Self {
        Self {
            listen,
            book,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            endpoint: Mutex::new(None),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn book(&self) -> &Arc<PeerBook> {
        &self.book
    }

    /// Bound address while the endpoint is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.lock().as_ref().map(|ep| ep.local_addr)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, local: &Metadata) -> Result<mpsc::Receiver<EndpointEvent>, TransportError> {
        let previous = self.endpoint.lock().take();
        if let Some(previous) = previous {
            previous.accept.abort();
        }

        let listener = TcpListener::bind(self.listen).await.map_err(|e| {
            TransportError::Endpoint(EndpointError::new(
                EndpointErrorKind::SocketError,
                format!("bind {}: {}", self.listen, e),
            ))
        })?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {} as {}", local_addr, local.id);

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        tx.send(EndpointEvent::Open {
            address: local_addr.to_string(),
        })
        .await
        .map_err(|_| TransportError::NotOpen)?;

        let accept = tokio::spawn(accept_loop(
            listener,
            local.clone(),
            tx.clone(),
            self.handshake_timeout,
        ));
        *self.endpoint.lock() = Some(Endpoint {
            local_addr,
            events: tx,
            accept,
        });

        Ok(rx)
    }

    async fn connect(&self, peer: &PeerId, metadata: &Metadata) -> Result<Link, TransportError> {
        let addr = self
            .book
            .addr_of(peer)
            .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;

        debug!("Dialing {} at {}", peer, addr);
        let handshake = async {
            let stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            let (reader, mut writer) = stream.into_split();
            let mut reader = FrameReader::new(reader);

            write_frame(&mut writer, Frame::hello(encode_hello(metadata)?)).await?;
            let remote = read_hello(&mut reader).await?;
            Ok::<_, TransportError>(spawn_link(peer.clone(), remote, reader, writer))
        };

        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::OpenTimeout(peer.clone()))?
    }

    async fn shutdown(&self) {
        let taken = self.endpoint.lock().take();
        if let Some(endpoint) = taken {
            endpoint.accept.abort();
            let _ = endpoint.events.send(EndpointEvent::Closed).await;
            info!("Stopped listening on {}", endpoint.local_addr);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: Metadata,
    events: mpsc::Sender<EndpointEvent>,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                let local = local.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(handshake_timeout, accept_handshake(stream, &local))
                        .await
                    {
                        Ok(Ok(link)) => {
                            let _ = events.send(EndpointEvent::Connection(link)).await;
                        }
                        Ok(Err(e)) => warn!("Handshake with {} failed: {}", addr, e),
                        Err(_) => warn!("Handshake with {} timed out", addr),
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                let event = EndpointEvent::Error(EndpointError::new(
                    EndpointErrorKind::Network,
                    e.to_string(),
                ));
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn accept_handshake(stream: TcpStream, local: &Metadata) -> Result<Link, TransportError> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(reader);

    let remote = read_hello(&mut reader).await?;
    write_frame(&mut writer, Frame::hello(encode_hello(local)?)).await?;

    Ok(spawn_link(remote.id.clone(), remote, reader, writer))
}

fn encode_hello(metadata: &Metadata) -> Result<Vec<u8>, TransportError> {
    postcard::to_allocvec(metadata).map_err(|e| TransportError::Handshake(e.to_string()))
}

async fn read_hello(reader: &mut FrameReader) -> Result<Metadata, TransportError> {
    match reader.next().await? {
        Some(Frame {
            frame_type: FrameType::Hello,
            payload,
        }) => postcard::from_bytes(&payload).map_err(|e| TransportError::Handshake(e.to_string())),
        Some(frame) => Err(TransportError::Handshake(format!(
            "expected hello, got {:?}",
            frame.frame_type
        ))),
        None => Err(TransportError::ConnectionClosed),
    }
}

/// Buffered frame reader over the read half of a stream
struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    codec: FrameCodec,
}

impl FrameReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            buf: BytesMut::with_capacity(8 * 1024),
            codec: FrameCodec::new(),
        }
    }

    /// Next frame, or `None` on a clean end of stream
    async fn next(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.half.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: Frame) -> Result<(), FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

fn spawn_link(
    peer: PeerId,
    remote: Metadata,
    reader: FrameReader,
    writer: OwnedWriteHalf,
) -> Link {
    let (outbound, outbound_rx) = mpsc::channel(LINK_CAPACITY);
    let (events_tx, events) = mpsc::channel(LINK_CAPACITY);

    // fresh channel, Open always fits and is always first
    let _ = events_tx.try_send(LinkEvent::Open(remote));

    tokio::spawn(write_loop(peer.clone(), writer, outbound_rx));
    tokio::spawn(read_loop(peer.clone(), reader, events_tx));

    Link {
        remote: peer,
        outbound,
        events,
    }
}

async fn write_loop(peer: PeerId, mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, Frame::envelope(bytes)).await {
            warn!("Write to {} failed: {}", peer, e);
            return;
        }
    }

    debug!("Closing link to {}", peer);
    let _ = write_frame(&mut writer, Frame::goodbye()).await;
    let _ = writer.shutdown().await;
}

async fn read_loop(peer: PeerId, mut reader: FrameReader, events: mpsc::Sender<LinkEvent>) {
    loop {
        let event = match reader.next().await {
            Ok(Some(frame)) => match frame.frame_type {
                FrameType::Envelope => LinkEvent::Data(frame.payload),
                FrameType::Goodbye => LinkEvent::Close,
                FrameType::Hello => {
                    debug!("Ignoring repeated hello from {}", peer);
                    continue;
                }
            },
            Ok(None) => LinkEvent::Close,
            Err(e) => LinkEvent::Error(e.to_string()),
        };

        let done = !matches!(event, LinkEvent::Data(_));
        if events.send(event).await.is_err() || done {
            return;
        }
    }
}
