//! Grouping of captured packets.
//!
//! The connection a packet belongs to is always part of its key: packets of
//! different connections never share a bucket. The options add detail on
//! top of that:
//!
//! - `group_by_connection`: the key carries the full [`ConnectionIdentity`]
//! - `group_by_thread`: packets are split by the thread that did the I/O
//! - `group_by_stack_trace`: the key carries the call stack that opened the
//!   connection
//!
//! With every option disabled all packets of a connection land in one bucket.
//! Within a bucket packets keep their recording order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::identity::{ConnectionId, ConnectionIdentity, RemoteEndpoint};
use super::packet::NetworkPacket;
use super::trace::{CallStack, ThreadMetadata};

/// Which dimensions participate in the grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupingOptions {
    /// Key carries the full connection identity.
    pub group_by_connection: bool,
    /// Split by I/O thread.
    pub group_by_thread: bool,
    /// Key carries the opening call stack.
    pub group_by_stack_trace: bool,
}

impl GroupingOptions {
    /// Every option disabled.
    pub fn collapsed() -> Self {
        Self::default()
    }

    /// Every option enabled.
    pub fn all() -> Self {
        Self {
            group_by_connection: true,
            group_by_thread: true,
            group_by_stack_trace: true,
        }
    }

    /// Set `group_by_connection`.
    pub fn by_connection(mut self, enabled: bool) -> Self {
        self.group_by_connection = enabled;
        self
    }

    /// Set `group_by_thread`.
    pub fn by_thread(mut self, enabled: bool) -> Self {
        self.group_by_thread = enabled;
        self
    }

    /// Set `group_by_stack_trace`.
    pub fn by_stack_trace(mut self, enabled: bool) -> Self {
        self.group_by_stack_trace = enabled;
        self
    }
}

/// Key of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingKey {
    connection: ConnectionId,
    remote: RemoteEndpoint,
    identity: Option<Arc<ConnectionIdentity>>,
    thread: Option<ThreadMetadata>,
    stack: Option<CallStack>,
}

impl GroupingKey {
    /// Connection the bucket belongs to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Remote endpoint of the connection.
    pub fn remote(&self) -> &RemoteEndpoint {
        &self.remote
    }

    /// Full identity, when grouped by connection.
    pub fn identity(&self) -> Option<&Arc<ConnectionIdentity>> {
        self.identity.as_ref()
    }

    /// I/O thread, when grouped by thread.
    pub fn thread(&self) -> Option<&ThreadMetadata> {
        self.thread.as_ref()
    }

    /// Opening call stack, when grouped by stack trace and captured.
    pub fn stack(&self) -> Option<&CallStack> {
        self.stack.as_ref()
    }
}

/// One bucket of grouped packets.
#[derive(Debug, Clone)]
pub struct TrafficBucket {
    /// Bucket key.
    pub key: GroupingKey,
    /// Packets in recording order.
    pub packets: Vec<NetworkPacket>,
}

/// Grouped view of captured traffic.
///
/// Buckets are ordered by connection, then by first appearance.
#[derive(Debug, Clone, Default)]
pub struct GroupedTraffic {
    buckets: Vec<TrafficBucket>,
    index: HashMap<GroupingKey, usize>,
}

impl GroupedTraffic {
    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether there are no buckets.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Packets of one bucket.
    pub fn get(&self, key: &GroupingKey) -> Option<&[NetworkPacket]> {
        self.index
            .get(key)
            .map(|&i| self.buckets[i].packets.as_slice())
    }

    /// Iterate over buckets.
    pub fn iter(&self) -> impl Iterator<Item = &TrafficBucket> {
        self.buckets.iter()
    }

    /// Bucket keys.
    pub fn keys(&self) -> impl Iterator<Item = &GroupingKey> {
        self.buckets.iter().map(|b| &b.key)
    }

    /// Buckets of one connection.
    pub fn for_connection(&self, connection: ConnectionId) -> impl Iterator<Item = &TrafficBucket> {
        self.buckets
            .iter()
            .filter(move |b| b.key.connection == connection)
    }

    /// Total number of packets.
    pub fn packet_count(&self) -> usize {
        self.buckets.iter().map(|b| b.packets.len()).sum()
    }

    /// Consume into buckets.
    pub fn into_buckets(self) -> Vec<TrafficBucket> {
        self.buckets
    }

    fn push(&mut self, key: GroupingKey, packet: NetworkPacket, merge: Option<(Duration, bool)>) {
        match self.index.get(&key) {
            Some(&i) => {
                let packets = &mut self.buckets[i].packets;
                if let (Some((window, same_thread)), Some(last)) = (merge, packets.last_mut())
                    && last.merge(&packet, window, same_thread)
                {
                    return;
                }
                packets.push(packet);
            }
            None => {
                self.index.insert(key.clone(), self.buckets.len());
                self.buckets.push(TrafficBucket {
                    key,
                    packets: vec![packet],
                });
            }
        }
    }
}

/// Group packets per connection.
///
/// Each item pairs a connection with its packets in recording order.
/// `merge_window` merges adjacent same-direction packets of a bucket that
/// were recorded within the window of each other.
pub fn group<I>(traffic: I, options: &GroupingOptions, merge_window: Option<Duration>) -> GroupedTraffic
where
    I: IntoIterator<Item = (Arc<ConnectionIdentity>, Vec<NetworkPacket>)>,
{
    let mut traffic: Vec<_> = traffic.into_iter().collect();
    traffic.sort_by_key(|(identity, _)| identity.id());

    let merge = merge_window.map(|window| (window, options.group_by_thread));
    let mut grouped = GroupedTraffic::default();

    for (identity, packets) in traffic {
        let stack = if options.group_by_stack_trace {
            identity.opening_stack().cloned()
        } else {
            None
        };
        for packet in packets {
            let key = GroupingKey {
                connection: identity.id(),
                remote: identity.remote().clone(),
                identity: options.group_by_connection.then(|| Arc::clone(&identity)),
                thread: options.group_by_thread.then(|| packet.thread().clone()),
                stack: stack.clone(),
            };
            grouped.push(key, packet, merge);
        }
    }

    grouped
}
