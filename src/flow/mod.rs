//! Per-flow state
//!
//! A flow is one end-to-end user session through the tunnel, identified by
//! a 128-bit connection ID. The record co-owns the ingress socket (held by
//! its pump task) and the egress write half (held here, behind a mutex
//! shared with the packet queue so that preamble, queued bytes, and live
//! bytes stay strictly ordered on every fresh egress).

use crate::proxy_protocol::{self, Detection, ProxyInfo, ProxyProtocolError, ProxyVersion};
use bytes::Bytes;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Bounded packet queue capacity; overflow drops the oldest entry
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Base reconnect delay
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Once this many bytes are buffered, an undecided PROXY header is an error
const PROXY_DECIDE_LIMIT: usize = 512;

/// Generate a fresh connection ID: 16 random bytes, hex-encoded
pub fn generate_connection_id() -> String {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .expect("system RNG unavailable");
    hex::encode(bytes)
}

/// Capped exponential backoff: 1s, 2s, 4s, 8s, 16s, then 30s forever
pub fn reconnect_delay(attempts: u32) -> Duration {
    let shift = attempts.min(5);
    let delay = BASE_RECONNECT_DELAY * (1u32 << shift);
    delay.min(MAX_RECONNECT_DELAY)
}

/// Ingress connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    AwaitingId,
    AwaitingHeader,
    Relaying,
    Disconnected,
}

/// Egress write half plus the queue that bridges reconnect windows.
/// One lock for both: whoever installs a writer drains the queue before
/// anyone else can write.
struct EgressState {
    writer: Option<OwnedWriteHalf>,
    queue: VecDeque<Bytes>,
}

impl EgressState {
    fn enqueue(&mut self, data: &[u8]) {
        if self.queue.len() >= MAX_QUEUE_SIZE {
            self.queue.pop_front();
        }
        self.queue.push_back(Bytes::copy_from_slice(data));
    }

    /// Drain the queue into `writer` in FIFO order
    async fn flush_queue(&mut self, writer: &mut OwnedWriteHalf) -> std::io::Result<()> {
        while let Some(packet) = self.queue.pop_front() {
            writer.write_all(&packet).await?;
        }
        Ok(())
    }
}

/// A live user session
pub struct Flow {
    pub connection_id: String,
    pub route_id: String,

    egress: Mutex<EgressState>,

    connected: AtomicBool,
    ingress_open: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_reconnect_at: std::sync::Mutex<Option<Instant>>,

    proxy_info: std::sync::Mutex<Option<ProxyInfo>>,
    state: std::sync::Mutex<FlowState>,

    close_signal: Notify,
    close_requested: AtomicBool,
}

impl Flow {
    /// Create a flow for a freshly accepted user connection (public entry).
    /// The connection ID is generated here; the client-address tuple is
    /// inferred from the socket when no PROXY header supplies one.
    pub fn accept(route_id: &str, peer: SocketAddr, local: SocketAddr) -> Self {
        let inferred = ProxyInfo::new(
            peer.ip(),
            peer.port(),
            local.ip(),
            local.port(),
            ProxyVersion::V1,
        );
        Self::build(
            generate_connection_id(),
            route_id,
            Some(inferred),
            FlowState::Relaying,
        )
    }

    /// Create a flow for a tunnel connection that identified itself
    /// (tunnel entry)
    pub fn identified(
        connection_id: String,
        route_id: &str,
        proxy_info: Option<ProxyInfo>,
    ) -> Self {
        Self::build(connection_id, route_id, proxy_info, FlowState::Relaying)
    }

    fn build(
        connection_id: String,
        route_id: &str,
        proxy_info: Option<ProxyInfo>,
        state: FlowState,
    ) -> Self {
        Self {
            connection_id,
            route_id: route_id.to_string(),
            egress: Mutex::new(EgressState {
                writer: None,
                queue: VecDeque::new(),
            }),
            connected: AtomicBool::new(false),
            ingress_open: AtomicBool::new(true),
            reconnect_attempts: AtomicU32::new(0),
            last_reconnect_at: std::sync::Mutex::new(None),
            proxy_info: std::sync::Mutex::new(proxy_info),
            state: std::sync::Mutex::new(state),
            close_signal: Notify::new(),
            close_requested: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_ingress_open(&self) -> bool {
        self.ingress_open.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn last_reconnect_at(&self) -> Option<Instant> {
        *self.last_reconnect_at.lock().unwrap()
    }

    pub fn proxy_info(&self) -> Option<ProxyInfo> {
        self.proxy_info.lock().unwrap().clone()
    }

    pub fn set_proxy_info(&self, info: ProxyInfo) {
        *self.proxy_info.lock().unwrap() = Some(info);
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: FlowState) {
        *self.state.lock().unwrap() = state;
    }

    /// Write ingress bytes to the egress if one is attached, otherwise
    /// queue them for the next flush. Returns whether the bytes went out
    /// live.
    pub async fn forward_or_queue(&self, data: &[u8]) -> bool {
        let mut egress = self.egress.lock().await;

        if let Some(writer) = egress.writer.as_mut() {
            match writer.write_all(data).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(
                        connection_id = %self.connection_id,
                        "Egress write failed, queueing: {}", e
                    );
                    egress.writer = None;
                    self.connected.store(false, Ordering::SeqCst);
                }
            }
        }

        egress.enqueue(data);
        false
    }

    /// Queue bytes without attempting a live write
    pub async fn queue_packet(&self, data: &[u8]) {
        self.egress.lock().await.enqueue(data);
    }

    /// Number of queued packets
    pub async fn queue_len(&self) -> usize {
        self.egress.lock().await.queue.len()
    }

    /// Install a freshly dialed egress. `prefix` (preamble or PROXY
    /// header) is written first, then the queue is drained, then the
    /// writer becomes visible to the ingress pump. All under one lock, so
    /// no live byte can overtake the prefix or the backlog.
    pub async fn attach_egress(
        &self,
        mut writer: OwnedWriteHalf,
        prefix: &[u8],
    ) -> std::io::Result<()> {
        let mut egress = self.egress.lock().await;

        if !prefix.is_empty() {
            writer.write_all(prefix).await?;
        }
        egress.flush_queue(&mut writer).await?;

        egress.writer = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the egress writer after the far side went away
    pub async fn detach_egress(&self) {
        let mut egress = self.egress.lock().await;
        egress.writer = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Best-effort shutdown of the egress socket
    pub async fn shutdown_egress(&self) {
        let writer = {
            let mut egress = self.egress.lock().await;
            self.connected.store(false, Ordering::SeqCst);
            egress.writer.take()
        };
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Record an attempt about to be made and return how long to wait
    /// before it
    pub fn begin_reconnect_attempt(&self) -> Duration {
        let delay = reconnect_delay(self.reconnect_attempts.load(Ordering::SeqCst));
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_reconnect_at.lock().unwrap() = Some(Instant::now());
        delay
    }

    /// Mark the ingress gone. Any reconnect task observes this on its next
    /// tick and abandons.
    pub fn mark_ingress_closed(&self) {
        self.ingress_open.store(false, Ordering::SeqCst);
        self.set_state(FlowState::Disconnected);
    }

    /// Ask the ingress pump to tear the flow down (used when the egress
    /// closes on the tunnel side). `notify_one` stores a permit, so the
    /// signal is not lost if the pump is between polls.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.close_signal.notify_one();
    }

    /// Wait until `request_close` is called
    pub async fn closed(&self) {
        while !self.close_requested.load(Ordering::SeqCst) {
            self.close_signal.notified().await;
        }
    }
}

/// Assembles an optional PROXY header from the front of an inbound stream.
///
/// Non-PROXY traffic passes through untouched once enough bytes have
/// arrived to decide (5). A detected header is stripped and its tuple
/// returned with the first payload bytes.
#[derive(Default)]
pub struct ProxyHeaderDecoder {
    pending: Vec<u8>,
    processed: bool,
}

/// One decoded step of the inbound stream
pub struct DecodedInbound {
    /// Tuple parsed from a stripped header, if this chunk completed one
    pub proxy_info: Option<ProxyInfo>,
    /// Bytes ready to forward downstream
    pub payload: Bytes,
}

impl ProxyHeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed inbound bytes. `Ok(None)` means the header is still
    /// undecidable and more bytes are needed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<DecodedInbound>, ProxyProtocolError> {
        if self.processed {
            return Ok(Some(DecodedInbound {
                proxy_info: None,
                payload: Bytes::copy_from_slice(data),
            }));
        }

        self.pending.extend_from_slice(data);
        if self.pending.len() < 5 {
            return Ok(None);
        }

        let parsed = match proxy_protocol::detect(&self.pending) {
            Detection::NeedMore => return Ok(None),
            Detection::NotProxy => {
                self.processed = true;
                let payload = Bytes::from(std::mem::take(&mut self.pending));
                return Ok(Some(DecodedInbound {
                    proxy_info: None,
                    payload,
                }));
            }
            Detection::V1 => proxy_protocol::parse_v1(&self.pending),
            Detection::V2 => proxy_protocol::parse_v2(&self.pending),
        };

        match parsed {
            Ok((info, header_len)) => {
                self.processed = true;
                let rest = Bytes::copy_from_slice(&self.pending[header_len..]);
                self.pending.clear();
                Ok(Some(DecodedInbound {
                    proxy_info: Some(info),
                    payload: rest,
                }))
            }
            Err(ProxyProtocolError::Incomplete) if self.pending.len() < PROXY_DECIDE_LIMIT => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Server-side mapping `connection_id -> flow`
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, Arc<Flow>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow under its connection ID. Refuses an ID that is
    /// already live.
    pub fn register(&self, flow: Arc<Flow>) -> bool {
        let mut flows = self.flows.write().unwrap();
        if flows.contains_key(&flow.connection_id) {
            warn!(
                connection_id = %flow.connection_id,
                "Refusing duplicate connection ID registration"
            );
            return false;
        }
        info!(connection_id = %flow.connection_id, "Registered connection");
        flows.insert(flow.connection_id.clone(), flow);
        true
    }

    /// Remove a flow; returns it if it was present
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Flow>> {
        let removed = self.flows.write().unwrap().remove(connection_id);
        if removed.is_some() {
            info!(connection_id = %connection_id, "Unregistered connection");
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Flow>> {
        self.flows.read().unwrap().get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.read().unwrap().is_empty()
    }
}
