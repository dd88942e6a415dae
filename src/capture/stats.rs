//! Per-connection socket statistics.

use std::sync::Arc;
use std::time::Duration;

use super::identity::ConnectionIdentity;
use super::packet::{Direction, NetworkPacket};

/// Byte and timing totals of a set of packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketStats {
    /// Bytes written.
    pub bytes_up: u64,
    /// Bytes read.
    pub bytes_down: u64,
    /// Number of writes.
    pub packets_sent: u64,
    /// Number of reads that returned data.
    pub packets_received: u64,
    /// Time spent inside I/O calls.
    pub elapsed: Duration,
}

impl SocketStats {
    /// Totals of the given packets.
    pub fn from_packets<'a>(packets: impl IntoIterator<Item = &'a NetworkPacket>) -> Self {
        let mut stats = Self::default();
        for packet in packets {
            stats.accumulate(packet);
        }
        stats
    }

    /// Add one packet.
    pub fn accumulate(&mut self, packet: &NetworkPacket) {
        let len = packet.len() as u64;
        match packet.direction() {
            Direction::Sent => {
                self.bytes_up += len;
                self.packets_sent += 1;
            }
            Direction::Received => {
                self.bytes_down += len;
                self.packets_received += 1;
            }
        }
        self.elapsed += packet.elapsed();
    }

    /// Add another set of totals.
    pub fn merge(&mut self, other: &SocketStats) {
        self.bytes_up += other.bytes_up;
        self.bytes_down += other.bytes_down;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.elapsed += other.elapsed;
    }
}

/// Statistics of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// The connection.
    pub identity: Arc<ConnectionIdentity>,
    /// Its totals.
    pub stats: SocketStats,
}
