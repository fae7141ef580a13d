use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, Magic, ServiceFlags};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::services::adapter::{AdapterContext, AdapterError, ChainAdapter};
use crate::services::endpoint::NodeEndpoint;
use crate::services::event::{BlockEvent, BlockHash, Chain, Transport};
use crate::services::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Oldest protocol version we will talk to
const MIN_PROTOCOL_VERSION: u32 = 70015;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Supervisor cadence for replacing dead peer connections
const PEER_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);
/// A requested block not delivered within this window counts as a failure
const BLOCK_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-peer circuit: 3 failed deliveries opens it for 5 minutes
const PEER_FAILURE_THRESHOLD: u32 = 3;
const PEER_OPEN_DURATION: Duration = Duration::from_secs(300);
/// Keepalive ping cadence; the pong doubles as a latency sample
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// Sanity cap on wire payloads; blocks stay well under this
const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Live peer connection state shared with the routing side
struct PeerState {
    endpoint_id: String,
    writer: mpsc::Sender<NetworkMessage>,
    breaker: CircuitBreaker,
    /// Outstanding full-block requests and when they were issued
    pending_blocks: Mutex<HashMap<bitcoin::BlockHash, Instant>>,
    /// Outstanding keepalive ping, nonce and send time
    last_ping: Mutex<Option<(u64, Instant)>>,
}

impl PeerState {
    fn accepts_requests(&self) -> bool {
        self.breaker.state() != CircuitState::Open
    }
}

/// Bitcoin P2P adapter.
///
/// Keeps a pool of persistent peer connections (up to the tier's
/// `max_peers`), speaks the header-first fast path, and routes full-block
/// requests to the best-scored peer whose delivery circuit is closed.
pub struct BitcoinAdapter {
    max_peers: usize,
    magic: Magic,
    peers: RwLock<HashMap<String, Arc<PeerState>>>,
}

impl BitcoinAdapter {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers: max_peers.max(1),
            magic: Magic::BITCOIN,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Route a full-block request to the best-scored connected peer whose
    /// circuit admits it. The announcing peer is only used as a last resort.
    async fn request_block(
        &self,
        ctx: &AdapterContext,
        hash: bitcoin::BlockHash,
        announced_by: &str,
    ) {
        let mut statuses: Vec<_> = ctx
            .manager
            .endpoint_statuses(Chain::Bitcoin)
            .into_iter()
            .filter(|s| s.is_healthy)
            .collect();
        statuses.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let ranked: Vec<String> = statuses.into_iter().map(|s| s.id).collect();

        let target = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            ranked
                .iter()
                .filter_map(|id| peers.get(id))
                .find(|peer| peer.accepts_requests())
                .or_else(|| {
                    peers
                        .get(announced_by)
                        .filter(|peer| peer.accepts_requests())
                })
                .cloned()
        };

        let Some(peer) = target else {
            tracing::warn!(block = %hash, "No peer available for block request");
            return;
        };

        peer.pending_blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash, Instant::now());

        let getdata = NetworkMessage::GetData(vec![Inventory::WitnessBlock(hash)]);
        if peer.writer.send(getdata).await.is_err() {
            tracing::debug!(peer = %peer.endpoint_id, "Peer writer gone; block request dropped");
        }
    }

    /// Expire overdue block requests; each one is a delivery failure for the
    /// peer that accepted it
    fn expire_block_requests(&self, ctx: &AdapterContext) {
        let peers: Vec<Arc<PeerState>> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        for peer in peers {
            let expired: Vec<bitcoin::BlockHash> = {
                let mut pending = peer
                    .pending_blocks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let overdue: Vec<_> = pending
                    .iter()
                    .filter(|(_, requested)| requested.elapsed() > BLOCK_DELIVERY_TIMEOUT)
                    .map(|(hash, _)| *hash)
                    .collect();
                for hash in &overdue {
                    pending.remove(hash);
                }
                overdue
            };
            for hash in expired {
                tracing::debug!(peer = %peer.endpoint_id, block = %hash, "Block delivery timed out");
                peer.breaker.record_failure();
                ctx.manager
                    .report_result(&peer.endpoint_id, BLOCK_DELIVERY_TIMEOUT, false);
            }
        }
    }

    async fn maintain_peers(self: Arc<Self>, ctx: &AdapterContext) {
        let connected: Vec<String> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.keys().cloned().collect()
        };
        if connected.len() >= self.max_peers {
            return;
        }

        let candidates: Vec<Arc<NodeEndpoint>> = ctx
            .manager
            .registry()
            .for_chain_transport(Chain::Bitcoin, Transport::P2p)
            .into_iter()
            .filter(|ep| ctx.manager.is_healthy(&ep.id) && !connected.contains(&ep.id))
            .take(self.max_peers - connected.len())
            .collect();

        for endpoint in candidates {
            let adapter = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(err) = adapter.run_peer(&ctx, endpoint.clone()).await {
                    tracing::debug!(peer = %endpoint.id, error = %err, "Peer session ended");
                }
                adapter
                    .peers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&endpoint.id);
            });
        }
    }

    /// One peer session: connect, handshake, then serve the message loop
    /// until error, unhealth, or shutdown
    async fn run_peer(
        &self,
        ctx: &AdapterContext,
        endpoint: Arc<NodeEndpoint>,
    ) -> Result<(), AdapterError> {
        let started = Instant::now();
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint.url)).await {
            Ok(Ok(stream)) => {
                ctx.manager.report_result(&endpoint.id, started.elapsed(), true);
                stream
            }
            Ok(Err(err)) => {
                ctx.manager.report_result(&endpoint.id, started.elapsed(), false);
                return Err(AdapterError::Transport(err.to_string()));
            }
            Err(_) => {
                ctx.manager.report_result(&endpoint.id, started.elapsed(), false);
                return Err(AdapterError::Transport("connect timeout".into()));
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let peer_addr = stream
            .peer_addr()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        let (mut reader, mut writer) = stream.into_split();

        let version = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.handshake(&mut reader, &mut writer, peer_addr, local_addr),
        )
        .await
        .map_err(|_| AdapterError::Handshake("handshake timeout".into()))??;

        tracing::info!(
            peer = %endpoint.id,
            version = version.version,
            services = %version.services,
            user_agent = %version.user_agent,
            "Bitcoin peer connected"
        );

        // Prefer headers announcements over bare invs where supported
        self.send(&mut writer, NetworkMessage::SendHeaders).await?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<NetworkMessage>(64);
        let state = Arc::new(PeerState {
            endpoint_id: endpoint.id.clone(),
            writer: writer_tx,
            breaker: CircuitBreaker::new(
                format!("peer:{}", endpoint.id),
                CircuitBreakerConfig {
                    failure_threshold: PEER_FAILURE_THRESHOLD,
                    open_duration: PEER_OPEN_DURATION,
                    half_open_probe_limit: 1,
                },
            ),
            pending_blocks: Mutex::new(HashMap::new()),
            last_ping: Mutex::new(None),
        });
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.id.clone(), state.clone());

        let magic = self.magic;
        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let bytes = encode::serialize(&RawNetworkMessage::new(magic, message));
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let result = self.message_loop(ctx, &endpoint, reader, &state).await;
        writer_task.abort();
        result
    }

    async fn message_loop(
        &self,
        ctx: &AdapterContext,
        endpoint: &Arc<NodeEndpoint>,
        mut reader: OwnedReadHalf,
        state: &Arc<PeerState>,
    ) -> Result<(), AdapterError> {
        let mut shutdown = ctx.shutdown_signal();
        let mut transitions = ctx.manager.transitions();
        let mut maintenance = tokio::time::interval(PEER_MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Frames are read on a dedicated task: cancelling a read mid-frame
        // would desynchronize the stream
        let (frame_tx, mut frames) = mpsc::channel::<Result<NetworkMessage, AdapterError>>(64);
        let magic = self.magic;
        let reader_task = tokio::spawn(async move {
            loop {
                let result = read_message(&mut reader, magic).await;
                let failed = result.is_err();
                if frame_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = loop {
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Some(Ok(message)) => {
                            self.handle_message(ctx, endpoint, state, message).await;
                            ctx.ingestor.cooperative_backoff().await;
                        }
                        Some(Err(err)) => break Err(err),
                        None => break Err(AdapterError::Transport("peer stream closed".into())),
                    }
                }
                transition = transitions.recv() => {
                    if let Ok(t) = transition {
                        if t.endpoint_id == endpoint.id && !t.is_healthy {
                            break Err(AdapterError::Transport("endpoint marked unhealthy".into()));
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.expire_block_requests(ctx);
                }
                _ = keepalive.tick() => {
                    let nonce = rand::rng().random::<u64>();
                    *state.last_ping.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some((nonce, Instant::now()));
                    let _ = state.writer.send(NetworkMessage::Ping(nonce)).await;
                }
                _ = shutdown.recv() => break Ok(()),
            }
        };
        reader_task.abort();
        result
    }

    async fn handle_message(
        &self,
        ctx: &AdapterContext,
        endpoint: &Arc<NodeEndpoint>,
        state: &Arc<PeerState>,
        message: NetworkMessage,
    ) {
        match message {
            NetworkMessage::Inv(inventory) => {
                let announced: Vec<bitcoin::BlockHash> = inventory
                    .iter()
                    .filter_map(|inv| match inv {
                        Inventory::Block(hash) | Inventory::WitnessBlock(hash) => Some(*hash),
                        _ => None,
                    })
                    .collect();
                if announced.is_empty() {
                    return;
                }
                // Header-first: ask for headers immediately, then fetch the
                // full blocks from the best peer
                for hash in &announced {
                    let getheaders = NetworkMessage::GetHeaders(GetHeadersMessage::new(
                        Vec::new(),
                        *hash,
                    ));
                    let _ = state.writer.send(getheaders).await;
                }
                for hash in announced {
                    self.request_block(ctx, hash, &endpoint.id).await;
                }
            }
            NetworkMessage::Headers(headers) => {
                for header in headers {
                    let hash = header.block_hash();
                    // Low-latency announce before the body arrives
                    let event = header_event(&header, &endpoint.id);
                    ctx.ingestor.submit(event);
                    self.request_block(ctx, hash, &endpoint.id).await;
                }
            }
            NetworkMessage::Block(block) => {
                let hash = block.block_hash();
                let delivered_here = state
                    .pending_blocks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&hash)
                    .is_some();
                if delivered_here {
                    state.breaker.record_success();
                }
                let event = block_event(&block, &endpoint.id);
                ctx.ingestor.submit(event);
            }
            NetworkMessage::Ping(nonce) => {
                let _ = state.writer.send(NetworkMessage::Pong(nonce)).await;
            }
            NetworkMessage::Pong(nonce) => {
                let matched = {
                    let mut last = state.last_ping.lock().unwrap_or_else(|e| e.into_inner());
                    match last.take() {
                        Some((expected, sent_at)) if expected == nonce => Some(sent_at.elapsed()),
                        other => {
                            *last = other;
                            None
                        }
                    }
                };
                if let Some(latency) = matched {
                    ctx.manager.report_result(&endpoint.id, latency, true);
                }
            }
            NetworkMessage::Version(_) | NetworkMessage::Verack => {}
            other => {
                tracing::trace!(command = %other.command(), "Ignored peer message");
            }
        }
    }

    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<VersionMessage, AdapterError> {
        let version = build_version_message(peer_addr, local_addr);
        self.send(writer, NetworkMessage::Version(version)).await?;

        let mut their_version: Option<VersionMessage> = None;
        let mut got_verack = false;

        while their_version.is_none() || !got_verack {
            match read_message(reader, self.magic).await? {
                NetworkMessage::Version(v) => {
                    validate_peer_version(&v)?;
                    self.send(writer, NetworkMessage::Verack).await?;
                    their_version = Some(v);
                }
                NetworkMessage::Verack => got_verack = true,
                // Anything else before the handshake completes is a
                // protocol violation
                other => {
                    return Err(AdapterError::Handshake(format!(
                        "unexpected {} during handshake",
                        other.command()
                    )))
                }
            }
        }

        Ok(their_version.unwrap_or_else(|| unreachable_version()))
    }

    async fn send(
        &self,
        writer: &mut OwnedWriteHalf,
        message: NetworkMessage,
    ) -> Result<(), AdapterError> {
        let bytes = encode::serialize(&RawNetworkMessage::new(self.magic, message));
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    fn name(&self) -> &'static str {
        "bitcoin"
    }

    async fn run(self: Arc<Self>, ctx: AdapterContext) {
        let mut shutdown = ctx.shutdown_signal();
        let mut tick = tokio::time::interval(PEER_MAINTENANCE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.clone().maintain_peers(&ctx).await;
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Bitcoin adapter stopped");
    }
}

/// Reject peers that cannot serve blocks: they must advertise NODE_NETWORK
/// or NODE_NETWORK_LIMITED plus NODE_WITNESS, and speak a recent protocol
fn validate_peer_version(version: &VersionMessage) -> Result<(), AdapterError> {
    if version.version < MIN_PROTOCOL_VERSION {
        return Err(AdapterError::Handshake(format!(
            "protocol version {} below minimum {}",
            version.version, MIN_PROTOCOL_VERSION
        )));
    }
    let serves_blocks = version.services.has(ServiceFlags::NETWORK)
        || version.services.has(ServiceFlags::NETWORK_LIMITED);
    if !serves_blocks {
        return Err(AdapterError::Handshake("peer does not serve blocks".into()));
    }
    if !version.services.has(ServiceFlags::WITNESS) {
        return Err(AdapterError::Handshake("peer lacks witness support".into()));
    }
    Ok(())
}

fn build_version_message(peer_addr: SocketAddr, local_addr: SocketAddr) -> VersionMessage {
    let mut rng = rand::rng();
    VersionMessage::new(
        ServiceFlags::NONE,
        Utc::now().timestamp(),
        Address::new(&peer_addr, ServiceFlags::NONE),
        Address::new(&local_addr, ServiceFlags::NONE),
        rng.random::<u64>(),
        format!("/block-relay:{}/", env!("CARGO_PKG_VERSION")),
        0,
    )
}

fn unreachable_version() -> VersionMessage {
    // The handshake loop cannot exit without a version; this satisfies the
    // type without panicking in release builds
    build_version_message(
        SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::from(([0, 0, 0, 0], 0)),
    )
}

/// Header-only fast-path event. Height is unknown until the body arrives.
fn header_event(header: &bitcoin::block::Header, source_id: &str) -> BlockEvent {
    let hash = BlockHash::new(header.block_hash().to_byte_array().to_vec());
    let mut event = BlockEvent::new(Chain::Bitcoin, hash, 0, source_id).header_only();
    if let Some(ts) = DateTime::<Utc>::from_timestamp(header.time as i64, 0) {
        event = event.with_timestamp(ts);
    }
    event
}

fn block_event(block: &bitcoin::Block, source_id: &str) -> BlockEvent {
    let hash = BlockHash::new(block.block_hash().to_byte_array().to_vec());
    let height = block.bip34_block_height().unwrap_or(0);
    let mut event = BlockEvent::new(Chain::Bitcoin, hash, height, source_id)
        .with_size(block.total_size() as u64);
    if let Some(ts) = DateTime::<Utc>::from_timestamp(block.header.time as i64, 0) {
        event = event.with_timestamp(ts);
    }
    event
}

/// Read one length-delimited wire message. The 24-byte header carries magic,
/// command, payload length and checksum; the payload follows.
async fn read_message(
    reader: &mut OwnedReadHalf,
    magic: Magic,
) -> Result<NetworkMessage, AdapterError> {
    let mut header = [0u8; 24];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    if header[0..4] != magic.to_bytes() {
        return Err(AdapterError::Parse("bad network magic".into()));
    }
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_BYTES {
        return Err(AdapterError::Parse(format!("payload of {} bytes too large", length)));
    }

    let mut frame = Vec::with_capacity(24 + length);
    frame.extend_from_slice(&header);
    frame.resize(24 + length, 0);
    reader
        .read_exact(&mut frame[24..])
        .await
        .map_err(|e| AdapterError::Transport(e.to_string()))?;

    let raw: RawNetworkMessage =
        encode::deserialize(&frame).map_err(|e| AdapterError::Parse(e.to_string()))?;
    Ok(raw.payload().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_with(services: ServiceFlags, version: u32) -> VersionMessage {
        let mut v = build_version_message(
            SocketAddr::from(([127, 0, 0, 1], 8333)),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        );
        v.services = services;
        v.version = version;
        v
    }

    #[test]
    fn test_accepts_full_node_with_witness() {
        let v = version_with(ServiceFlags::NETWORK | ServiceFlags::WITNESS, 70016);
        assert!(validate_peer_version(&v).is_ok());
    }

    #[test]
    fn test_accepts_pruned_node_with_witness() {
        let v = version_with(
            ServiceFlags::NETWORK_LIMITED | ServiceFlags::WITNESS,
            70016,
        );
        assert!(validate_peer_version(&v).is_ok());
    }

    #[test]
    fn test_rejects_peer_without_block_service() {
        let v = version_with(ServiceFlags::WITNESS, 70016);
        assert!(matches!(
            validate_peer_version(&v),
            Err(AdapterError::Handshake(_))
        ));
    }

    #[test]
    fn test_rejects_peer_without_witness() {
        let v = version_with(ServiceFlags::NETWORK, 70016);
        assert!(validate_peer_version(&v).is_err());
    }

    #[test]
    fn test_rejects_old_protocol_version() {
        let v = version_with(ServiceFlags::NETWORK | ServiceFlags::WITNESS, 70001);
        assert!(validate_peer_version(&v).is_err());
    }

    #[tokio::test]
    async fn test_wire_round_trip() {
        // Serialize a ping, stream it through a socket pair, read it back
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (_client_read, mut client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        let bytes = encode::serialize(&RawNetworkMessage::new(
            Magic::BITCOIN,
            NetworkMessage::Ping(7),
        ));
        client_write.write_all(&bytes).await.unwrap();

        let message = read_message(&mut server_read, Magic::BITCOIN).await.unwrap();
        assert!(matches!(message, NetworkMessage::Ping(7)));
    }

    #[tokio::test]
    async fn test_read_rejects_wrong_magic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (_client_read, mut client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        let bytes = encode::serialize(&RawNetworkMessage::new(
            Magic::TESTNET,
            NetworkMessage::Ping(1),
        ));
        client_write.write_all(&bytes).await.unwrap();

        assert!(matches!(
            read_message(&mut server_read, Magic::BITCOIN).await,
            Err(AdapterError::Parse(_))
        ));
    }

    #[test]
    fn test_header_event_is_header_only() {
        use bitcoin::block::{Header, Version};
        use bitcoin::pow::CompactTarget;
        use bitcoin::TxMerkleNode;

        let header = Header {
            version: Version::from_consensus(4),
            prev_blockhash: bitcoin::BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 0,
        };
        let event = header_event(&header, "peer:1");
        assert!(event.is_header_only);
        assert_eq!(event.chain, Chain::Bitcoin);
        assert_eq!(event.hash.len(), 32);
        assert_eq!(event.height, 0);
        assert!(event.validate().is_ok());
    }
}
