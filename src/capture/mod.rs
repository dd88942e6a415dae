//! Traffic capture.
//!
//! Intercepted connections report every read and write to the
//! [`TrafficRecorder`] through a [`Tap`]. Packets are kept per connection,
//! in I/O order, while a [`CaptureSession`] is open (or capture is globally
//! enabled), and are retrieved grouped by connection, thread and opening
//! call stack.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::capture::{GroupingOptions, TrafficQuery};
//!
//! let session = wiretap.start_session();
//! // ... exercise code that talks to the network ...
//! let traffic = session.captured_traffic(
//!     &TrafficQuery::new().grouping(GroupingOptions::collapsed().by_thread(true)),
//! );
//! for bucket in traffic.iter() {
//!     println!("{}: {} packets", bucket.key.remote(), bucket.packets.len());
//! }
//! ```

mod grouping;
mod identity;
mod packet;
mod query;
mod recorder;
mod session;
mod stats;
mod tap;
mod trace;

pub use grouping::{group, GroupedTraffic, GroupingKey, GroupingOptions, TrafficBucket};
pub use identity::{ConnectionId, ConnectionIdentity, RemoteEndpoint, TransportKind};
pub use packet::{render_packets, Direction, NetworkPacket, TrafficLayer};
pub use query::{AddressFilter, ThreadScope, TrafficQuery};
pub use recorder::{ConnectionLog, TrafficRecorder};
pub use session::CaptureSession;
pub use stats::{ConnectionStats, SocketStats};
pub use tap::Tap;
pub use trace::{CallStack, ThreadMetadata, TraceAttributor, TraceContext, MAX_STACK_TRACE_LEN};
