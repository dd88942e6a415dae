//! Capture sessions.
//!
//! A session bounds what a caller can see: only packets recorded while it was
//! open. Sessions end explicitly with [`CaptureSession::end`] or when dropped.
//! Query a session before ending it; once the last session ends the recorder
//! is free to drop the packets.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use super::grouping::GroupedTraffic;
use super::identity::ConnectionIdentity;
use super::query::TrafficQuery;
use super::recorder::{TrafficRecorder, Window};
use super::stats::ConnectionStats;
use crate::sync::lock;

/// An open (or ended) capture window.
pub struct CaptureSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    start: Instant,
    end: Mutex<Option<Instant>>,
    recorder: Arc<TrafficRecorder>,
}

impl CaptureSession {
    pub(crate) fn new(id: Uuid, start: Instant, recorder: Arc<TrafficRecorder>) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            start,
            end: Mutex::new(None),
            recorder,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the session has not ended yet.
    pub fn is_open(&self) -> bool {
        lock(&self.end).is_none()
    }

    /// Packets recorded during the session, grouped per the query.
    pub fn captured_traffic(&self, query: &TrafficQuery) -> GroupedTraffic {
        self.recorder.traffic_in(self.window(), query)
    }

    /// Per-connection statistics for the session.
    pub fn socket_stats(&self, query: &TrafficQuery) -> Vec<ConnectionStats> {
        self.recorder.stats_in(self.window(), query)
    }

    /// Connections opened or active during the session.
    pub fn connections(&self) -> Vec<Arc<ConnectionIdentity>> {
        self.recorder.connections_in(self.window())
    }

    /// End the session. Idempotent.
    pub fn end(&self) {
        {
            let mut end = lock(&self.end);
            if end.is_some() {
                return;
            }
            *end = Some(Instant::now());
        }
        self.recorder.end_session(self.id, self.start.elapsed());
    }

    fn window(&self) -> Window {
        Window {
            from: Some(self.start),
            until: *lock(&self.end),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("open", &self.is_open())
            .finish()
    }
}
