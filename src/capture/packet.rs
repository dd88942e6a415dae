//! Captured packets.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use super::identity::ConnectionId;
use super::trace::ThreadMetadata;

/// Direction of a packet relative to the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Written by the process.
    Sent,
    /// Read by the process.
    Received,
}

/// Where on the connection the bytes were observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLayer {
    /// Bytes as they cross the socket.
    #[default]
    Wire,
    /// Bytes at the TLS boundary (before encryption, after decryption).
    Plaintext,
}

/// One observed read or write.
#[derive(Debug, Clone)]
pub struct NetworkPacket {
    pub(crate) connection: ConnectionId,
    pub(crate) direction: Direction,
    pub(crate) payload: Bytes,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) recorded_at: Instant,
    pub(crate) sequence: u64,
    pub(crate) thread: ThreadMetadata,
    pub(crate) elapsed: Duration,
}

impl NetworkPacket {
    /// Connection the packet belongs to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the process wrote this packet.
    pub fn is_sent(&self) -> bool {
        self.direction == Direction::Sent
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Wall-clock time of the I/O call.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Position within the connection (per capture layer), starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Thread that performed the I/O.
    pub fn thread(&self) -> &ThreadMetadata {
        &self.thread
    }

    /// Time spent inside the underlying I/O call.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub(crate) fn recorded_at(&self) -> Instant {
        self.recorded_at
    }

    /// Append `next` to this packet if both go the same way and `next` was
    /// recorded within `window` of this one.
    pub(crate) fn merge(&mut self, next: &NetworkPacket, window: Duration, same_thread: bool) -> bool {
        if self.direction != next.direction || (same_thread && self.thread != next.thread) {
            return false;
        }
        if next.recorded_at.saturating_duration_since(self.recorded_at) > window {
            return false;
        }

        let mut merged = BytesMut::with_capacity(self.payload.len() + next.payload.len());
        merged.extend_from_slice(&self.payload);
        merged.extend_from_slice(&next.payload);
        self.payload = merged.freeze();
        self.elapsed += next.elapsed;
        true
    }
}

/// Render packets as text, one direction marker per packet.
///
/// Printable ASCII is kept, everything else is escaped.
pub fn render_packets(packets: &[NetworkPacket]) -> String {
    let mut out = String::new();
    for packet in packets {
        let marker = match packet.direction {
            Direction::Sent => ">>",
            Direction::Received => "<<",
        };
        let _ = write!(out, "{} [{}] {} bytes: ", marker, packet.sequence, packet.len());
        for byte in packet.payload.iter() {
            match byte {
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                b'\t' => out.push_str("\\t"),
                0x20..=0x7e => out.push(char::from(*byte)),
                other => {
                    let _ = write!(out, "\\x{:02x}", other);
                }
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
pub(crate) fn test_packet(connection: u64, direction: Direction, payload: &'static [u8], sequence: u64) -> NetworkPacket {
    NetworkPacket {
        connection: ConnectionId::new(connection),
        direction,
        payload: Bytes::from_static(payload),
        timestamp: Utc::now(),
        recorded_at: Instant::now(),
        sequence,
        thread: ThreadMetadata::current(),
        elapsed: Duration::from_micros(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_same_direction_within_window() {
        let mut first = test_packet(1, Direction::Sent, b"GET / ", 0);
        let second = test_packet(1, Direction::Sent, b"HTTP/1.1", 1);

        assert!(first.merge(&second, Duration::from_secs(1), true));
        assert_eq!(first.payload().as_ref(), b"GET / HTTP/1.1");
        assert_eq!(first.elapsed(), Duration::from_micros(20));
        assert_eq!(first.sequence(), 0);
    }

    #[test]
    fn test_merge_refuses_direction_change() {
        let mut first = test_packet(1, Direction::Sent, b"ping", 0);
        let reply = test_packet(1, Direction::Received, b"pong", 1);
        assert!(!first.merge(&reply, Duration::from_secs(1), true));
        assert_eq!(first.payload().as_ref(), b"ping");
    }

    #[test]
    fn test_merge_refuses_outside_window() {
        let mut first = test_packet(1, Direction::Sent, b"a", 0);
        let mut late = test_packet(1, Direction::Sent, b"b", 1);
        late.recorded_at = first.recorded_at + Duration::from_millis(50);
        assert!(!first.merge(&late, Duration::from_millis(10), true));
        assert!(first.merge(&late, Duration::from_millis(50), true));
    }

    #[test]
    fn test_render_packets() {
        let packets = vec![
            test_packet(1, Direction::Sent, b"ping\n", 0),
            test_packet(1, Direction::Received, b"\x00ok", 1),
        ];
        let text = render_packets(&packets);
        assert_eq!(text, ">> [0] 5 bytes: ping\\n\n<< [1] 3 bytes: \\x00ok\n");
    }
}
