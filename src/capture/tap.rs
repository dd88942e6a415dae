//! Recording handle held by connection streams.

use std::sync::Arc;
use std::time::Duration;

use super::identity::ConnectionIdentity;
use super::packet::{Direction, TrafficLayer};
use super::recorder::{ConnectionLog, TrafficRecorder};

/// Handle through which a stream reports its I/O.
///
/// Clones share one connection; when the last clone is dropped the
/// connection is marked closed.
#[derive(Clone)]
pub struct Tap {
    inner: Arc<TapInner>,
}

struct TapInner {
    log: Arc<ConnectionLog>,
    recorder: Arc<TrafficRecorder>,
}

impl Tap {
    pub(crate) fn new(log: Arc<ConnectionLog>, recorder: Arc<TrafficRecorder>) -> Self {
        Self {
            inner: Arc::new(TapInner { log, recorder }),
        }
    }

    /// Identity of the connection.
    pub fn identity(&self) -> &Arc<ConnectionIdentity> {
        self.inner.log.identity()
    }

    /// Report bytes that crossed the given layer.
    pub fn record(&self, layer: TrafficLayer, direction: Direction, payload: &[u8], elapsed: Duration) {
        self.inner
            .recorder
            .record(&self.inner.log, layer, direction, payload, elapsed);
    }
}

impl Drop for TapInner {
    fn drop(&mut self) {
        self.recorder.release(self.log.identity().id());
    }
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tap")
            .field("connection", &self.identity().id())
            .finish()
    }
}
