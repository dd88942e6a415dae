//! Per-connection traffic recording.
//!
//! Every connection owns its own packet buffers, one per capture layer, each
//! behind its own mutex. Appending assigns the sequence number and pushes the
//! packet under that mutex, so concurrent reads and writes on one connection
//! get a strict order while unrelated connections never contend. The lock is
//! never held across I/O.
//!
//! Packets are only kept while at least one capture session is open or
//! capture is globally enabled. When the last session ends, packets no
//! remaining session can see are dropped.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::grouping::{group, GroupedTraffic};
use super::identity::{ConnectionId, ConnectionIdentity, RemoteEndpoint, TransportKind};
use super::packet::{Direction, NetworkPacket, TrafficLayer};
use super::query::TrafficQuery;
use super::session::CaptureSession;
use super::stats::{ConnectionStats, SocketStats};
use super::tap::Tap;
use super::trace::{ThreadMetadata, TraceContext};
use crate::sync::{lock, read, write};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Time range on the recorder's monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Window {
    pub(crate) from: Option<Instant>,
    pub(crate) until: Option<Instant>,
}

impl Window {
    pub(crate) fn unbounded() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, at: Instant) -> bool {
        self.from.is_none_or(|from| at >= from) && self.until.is_none_or(|until| at < until)
    }
}

#[derive(Default)]
struct LayerLog {
    next_sequence: u64,
    packets: Vec<NetworkPacket>,
}

/// Packet buffers of one connection.
pub struct ConnectionLog {
    identity: Arc<ConnectionIdentity>,
    opened: Instant,
    wire: Mutex<LayerLog>,
    plaintext: Mutex<LayerLog>,
    closed: AtomicBool,
}

impl ConnectionLog {
    fn new(identity: ConnectionIdentity) -> Self {
        Self {
            identity: Arc::new(identity),
            opened: Instant::now(),
            wire: Mutex::new(LayerLog::default()),
            plaintext: Mutex::new(LayerLog::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Identity of the connection.
    pub fn identity(&self) -> &Arc<ConnectionIdentity> {
        &self.identity
    }

    /// Whether the connection handle was dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn layer(&self, layer: TrafficLayer) -> &Mutex<LayerLog> {
        match layer {
            TrafficLayer::Wire => &self.wire,
            TrafficLayer::Plaintext => &self.plaintext,
        }
    }

    fn append(&self, layer: TrafficLayer, direction: Direction, payload: &[u8], elapsed: Duration) {
        let payload = Bytes::copy_from_slice(payload);
        let thread = ThreadMetadata::current();
        let timestamp = Utc::now();

        let mut log = lock(self.layer(layer));
        let sequence = log.next_sequence;
        log.next_sequence += 1;
        log.packets.push(NetworkPacket {
            connection: self.identity.id(),
            direction,
            payload,
            timestamp,
            recorded_at: Instant::now(),
            sequence,
            thread,
            elapsed,
        });
    }

    fn packets(&self, layer: TrafficLayer, window: Window, query: &TrafficQuery) -> Vec<NetworkPacket> {
        lock(self.layer(layer))
            .packets
            .iter()
            .filter(|p| window.contains(p.recorded_at()) && query.thread_scope.includes(p))
            .cloned()
            .collect()
    }

    fn has_packets_in(&self, window: Window) -> bool {
        [TrafficLayer::Wire, TrafficLayer::Plaintext]
            .into_iter()
            .any(|layer| {
                lock(self.layer(layer))
                    .packets
                    .iter()
                    .any(|p| window.contains(p.recorded_at()))
            })
    }

    /// Drop packets recorded before `horizon`, returning how many remain.
    fn retain_since(&self, horizon: Instant) -> usize {
        [TrafficLayer::Wire, TrafficLayer::Plaintext]
            .into_iter()
            .map(|layer| {
                let mut log = lock(self.layer(layer));
                log.packets.retain(|p| p.recorded_at() >= horizon);
                log.packets.len()
            })
            .sum()
    }
}

/// Records traffic of intercepted connections.
pub struct TrafficRecorder {
    connections: RwLock<BTreeMap<ConnectionId, Arc<ConnectionLog>>>,
    sessions: Mutex<HashMap<Uuid, Instant>>,
    active_sessions: AtomicUsize,
    capture_enabled: AtomicBool,
    next_connection_id: AtomicU64,
    merge_window: Option<Duration>,
    audit: Arc<AuditLogger>,
}

impl TrafficRecorder {
    /// Recorder with capture off until a session starts.
    pub fn new() -> Self {
        Self::with_audit(Arc::new(AuditLogger::new_null()))
    }

    /// Recorder that audits session boundaries.
    pub fn with_audit(audit: Arc<AuditLogger>) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            active_sessions: AtomicUsize::new(0),
            capture_enabled: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            merge_window: None,
            audit,
        }
    }

    /// Merge adjacent same-direction packets recorded within `window` when
    /// grouping.
    pub fn with_merge_window(mut self, window: Option<Duration>) -> Self {
        self.merge_window = window.filter(|w| !w.is_zero());
        self
    }

    /// Keep packets regardless of sessions.
    pub fn set_capture_enabled(&self, enabled: bool) {
        self.capture_enabled.store(enabled, Ordering::Release);
        debug!("Global capture {}", if enabled { "enabled" } else { "disabled" });
        if !enabled {
            self.purge();
        }
    }

    /// Whether capture is globally enabled.
    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::Acquire)
    }

    /// Whether packets recorded now are kept.
    pub fn is_capturing(&self) -> bool {
        self.capture_enabled() || self.active_sessions.load(Ordering::Acquire) > 0
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Number of connections currently tracked.
    pub fn connection_count(&self) -> usize {
        read(&self.connections).len()
    }

    /// Register an established (or simulated) connection.
    pub fn open_connection(
        self: &Arc<Self>,
        remote: RemoteEndpoint,
        local: Option<SocketAddr>,
        transport: TransportKind,
        context: TraceContext,
        discarded: bool,
    ) -> Tap {
        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let identity = ConnectionIdentity::new(id, local, remote, transport, context, discarded);
        trace!("Registered connection {}", identity);

        let log = Arc::new(ConnectionLog::new(identity));
        write(&self.connections).insert(id, Arc::clone(&log));
        Tap::new(log, Arc::clone(self))
    }

    /// Append a packet to a connection if capture is active.
    pub fn record(
        &self,
        log: &ConnectionLog,
        layer: TrafficLayer,
        direction: Direction,
        payload: &[u8],
        elapsed: Duration,
    ) {
        if payload.is_empty() || !self.is_capturing() {
            return;
        }
        log.append(layer, direction, payload, elapsed);
    }

    /// Open a capture session.
    pub fn start_session(self: &Arc<Self>) -> CaptureSession {
        let id = Uuid::new_v4();
        let start = {
            let mut sessions = lock(&self.sessions);
            self.active_sessions.fetch_add(1, Ordering::AcqRel);
            let start = Instant::now();
            sessions.insert(id, start);
            start
        };

        debug!("Capture session {} started", id);
        self.audit.log(AuditEvent::SessionStart { session_id: id });
        CaptureSession::new(id, start, Arc::clone(self))
    }

    pub(crate) fn end_session(&self, id: Uuid, duration: Duration) {
        let removed = {
            let mut sessions = lock(&self.sessions);
            let removed = sessions.remove(&id).is_some();
            if removed {
                self.active_sessions.fetch_sub(1, Ordering::AcqRel);
            }
            removed
        };
        if !removed {
            return;
        }

        debug!("Capture session {} ended after {:?}", id, duration);
        self.audit.log(AuditEvent::SessionEnd {
            session_id: id,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
        self.purge();
    }

    /// Called when the last handle of a connection is dropped.
    pub(crate) fn release(&self, id: ConnectionId) {
        let Some(log) = read(&self.connections).get(&id).cloned() else {
            return;
        };
        log.closed.store(true, Ordering::Release);
        if !self.is_capturing() {
            write(&self.connections).remove(&id);
        }
        trace!("Released connection {}", id);
    }

    /// Grouped view of every retained packet.
    pub fn traffic(&self, query: &TrafficQuery) -> GroupedTraffic {
        self.traffic_in(Window::unbounded(), query)
    }

    /// Statistics of every retained packet.
    pub fn socket_stats(&self, query: &TrafficQuery) -> Vec<ConnectionStats> {
        self.stats_in(Window::unbounded(), query)
    }

    pub(crate) fn traffic_in(&self, window: Window, query: &TrafficQuery) -> GroupedTraffic {
        group(self.collect(window, query), &query.grouping, self.merge_window)
    }

    pub(crate) fn stats_in(&self, window: Window, query: &TrafficQuery) -> Vec<ConnectionStats> {
        self.collect(window, query)
            .into_iter()
            .map(|(identity, packets)| ConnectionStats {
                identity,
                stats: SocketStats::from_packets(&packets),
            })
            .collect()
    }

    pub(crate) fn connections_in(&self, window: Window) -> Vec<Arc<ConnectionIdentity>> {
        self.logs()
            .into_iter()
            .filter(|log| window.contains(log.opened) || log.has_packets_in(window))
            .map(|log| Arc::clone(log.identity()))
            .collect()
    }

    fn collect(&self, window: Window, query: &TrafficQuery) -> Vec<(Arc<ConnectionIdentity>, Vec<NetworkPacket>)> {
        self.logs()
            .into_iter()
            .filter(|log| query.address.matches(log.identity().remote()))
            .filter_map(|log| {
                let packets = log.packets(query.layer, window, query);
                (!packets.is_empty()).then(|| (Arc::clone(log.identity()), packets))
            })
            .collect()
    }

    fn logs(&self) -> Vec<Arc<ConnectionLog>> {
        read(&self.connections).values().cloned().collect()
    }

    fn purge(&self) {
        if self.capture_enabled() {
            return;
        }

        // Taken under the sessions lock so a session starting concurrently
        // always starts at or after the horizon.
        let horizon = {
            let sessions = lock(&self.sessions);
            sessions.values().min().copied().unwrap_or_else(Instant::now)
        };

        let drained: Vec<ConnectionId> = self
            .logs()
            .into_iter()
            .filter(|log| log.retain_since(horizon) == 0 && log.is_closed())
            .map(|log| log.identity().id())
            .collect();

        if !drained.is_empty() {
            let mut connections = write(&self.connections);
            for id in &drained {
                connections.remove(id);
            }
        }
        debug!("Purged capture buffers ({} closed connections dropped)", drained.len());
    }
}

impl Default for TrafficRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrafficRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficRecorder")
            .field("connections", &self.connection_count())
            .field("active_sessions", &self.active_sessions())
            .field("capture_enabled", &self.capture_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::grouping::GroupingOptions;
    use crate::capture::query::{AddressFilter, ThreadScope};
    use crate::capture::trace::TraceAttributor;
    use std::thread;

    fn open(recorder: &Arc<TrafficRecorder>, host: &str) -> Tap {
        recorder.open_connection(
            RemoteEndpoint::new(host, 80, None),
            None,
            TransportKind::Blocking,
            TraceAttributor::new(false).capture_context(),
            false,
        )
    }

    #[test]
    fn test_not_retained_without_session() {
        let recorder = Arc::new(TrafficRecorder::new());
        let tap = open(&recorder, "a.local");
        tap.record(TrafficLayer::Wire, Direction::Sent, b"ping", Duration::ZERO);

        assert!(recorder.traffic(&TrafficQuery::new()).is_empty());
    }

    #[test]
    fn test_retained_during_session() {
        let recorder = Arc::new(TrafficRecorder::new());
        let tap = open(&recorder, "a.local");
        let session = recorder.start_session();

        tap.record(TrafficLayer::Wire, Direction::Sent, b"ping", Duration::ZERO);
        tap.record(TrafficLayer::Wire, Direction::Received, b"pong", Duration::ZERO);
        // Empty reads are not packets
        tap.record(TrafficLayer::Wire, Direction::Received, b"", Duration::ZERO);

        let grouped = session.captured_traffic(&TrafficQuery::new());
        assert_eq!(grouped.len(), 1);
        let packets = &grouped.iter().next().unwrap().packets;
        let sequences: Vec<u64> = packets.iter().map(|p| p.sequence()).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[test]
    fn test_global_capture() {
        let recorder = Arc::new(TrafficRecorder::new());
        recorder.set_capture_enabled(true);
        let tap = open(&recorder, "a.local");
        tap.record(TrafficLayer::Wire, Direction::Sent, b"ping", Duration::ZERO);
        assert_eq!(recorder.traffic(&TrafficQuery::new()).packet_count(), 1);

        recorder.set_capture_enabled(false);
        assert!(recorder.traffic(&TrafficQuery::new()).is_empty());
    }

    #[test]
    fn test_layers_sequenced_independently() {
        let recorder = Arc::new(TrafficRecorder::new());
        recorder.set_capture_enabled(true);
        let tap = open(&recorder, "a.local");

        tap.record(TrafficLayer::Wire, Direction::Sent, b"\x16\x03\x01", Duration::ZERO);
        tap.record(TrafficLayer::Wire, Direction::Received, b"\x16\x03\x03", Duration::ZERO);
        tap.record(TrafficLayer::Plaintext, Direction::Sent, b"GET /", Duration::ZERO);

        let plain = recorder.traffic(&TrafficQuery::new().plaintext());
        let packet = &plain.iter().next().unwrap().packets[0];
        assert_eq!(packet.sequence(), 0);
        assert_eq!(packet.payload().as_ref(), b"GET /");
        assert_eq!(recorder.traffic(&TrafficQuery::new()).packet_count(), 2);
    }

    #[test]
    fn test_session_window_excludes_earlier_packets() {
        let recorder = Arc::new(TrafficRecorder::new());
        let tap = open(&recorder, "a.local");

        let first = recorder.start_session();
        tap.record(TrafficLayer::Wire, Direction::Sent, b"one", Duration::ZERO);

        let second = recorder.start_session();
        tap.record(TrafficLayer::Wire, Direction::Sent, b"two", Duration::ZERO);

        assert_eq!(first.captured_traffic(&TrafficQuery::new()).packet_count(), 2);
        let seen: Vec<Bytes> = second
            .captured_traffic(&TrafficQuery::new())
            .iter()
            .flat_map(|b| b.packets.iter().map(|p| p.payload().clone()))
            .collect();
        assert_eq!(seen, vec![Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_end_of_last_session_purges() {
        let recorder = Arc::new(TrafficRecorder::new());
        let tap = open(&recorder, "a.local");
        let session = recorder.start_session();
        tap.record(TrafficLayer::Wire, Direction::Sent, b"ping", Duration::ZERO);
        drop(tap);
        assert_eq!(recorder.connection_count(), 1);

        session.end();
        assert_eq!(recorder.active_sessions(), 0);
        assert_eq!(recorder.connection_count(), 0);
        assert!(recorder.traffic(&TrafficQuery::new()).is_empty());
    }

    #[test]
    fn test_closed_connection_released_when_idle() {
        let recorder = Arc::new(TrafficRecorder::new());
        let tap = open(&recorder, "a.local");
        let clone = tap.clone();
        drop(tap);
        assert_eq!(recorder.connection_count(), 1);
        drop(clone);
        assert_eq!(recorder.connection_count(), 0);
    }

    #[test]
    fn test_address_filter_and_stats() {
        let recorder = Arc::new(TrafficRecorder::new());
        recorder.set_capture_enabled(true);
        let a = open(&recorder, "a.local");
        let b = open(&recorder, "b.local");
        a.record(TrafficLayer::Wire, Direction::Sent, b"12345", Duration::ZERO);
        b.record(TrafficLayer::Wire, Direction::Received, b"123", Duration::ZERO);

        let query = TrafficQuery::new().address(AddressFilter::parse("b.local:80").unwrap());
        let grouped = recorder.traffic(&query);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped.keys().next().unwrap().remote().host(), "b.local");

        let stats = recorder.socket_stats(&TrafficQuery::new());
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].stats.bytes_up, 5);
        assert_eq!(stats[1].stats.bytes_down, 3);
    }

    #[test]
    fn test_full_duplex_sequencing() {
        let recorder = Arc::new(TrafficRecorder::new());
        recorder.set_capture_enabled(true);
        let tap = open(&recorder, "a.local");

        let writers: Vec<_> = [Direction::Sent, Direction::Received]
            .into_iter()
            .map(|direction| {
                let tap = tap.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        tap.record(TrafficLayer::Wire, direction, b"x", Duration::ZERO);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let grouped = recorder.traffic(&TrafficQuery::new());
        let packets = &grouped.iter().next().unwrap().packets;
        assert_eq!(packets.len(), 400);
        for (i, pair) in packets.windows(2).enumerate() {
            assert_eq!(pair[0].sequence(), i as u64);
            assert!(pair[0].recorded_at() <= pair[1].recorded_at());
        }
    }

    #[test]
    fn test_current_thread_scope() {
        let recorder = Arc::new(TrafficRecorder::new());
        recorder.set_capture_enabled(true);
        let tap = open(&recorder, "a.local");
        tap.record(TrafficLayer::Wire, Direction::Sent, b"mine", Duration::ZERO);

        let other = tap.clone();
        thread::spawn(move || {
            other.record(TrafficLayer::Wire, Direction::Sent, b"theirs", Duration::ZERO);
        })
        .join()
        .unwrap();

        let query = TrafficQuery {
            thread_scope: ThreadScope::Current,
            grouping: GroupingOptions::collapsed(),
            ..TrafficQuery::new()
        };
        assert_eq!(recorder.traffic(&query).packet_count(), 1);
        assert_eq!(recorder.traffic(&TrafficQuery::new()).packet_count(), 2);
    }
}
