// Relay counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stream_core::StreamError;

#[derive(Debug, Clone)]
pub struct RelayMetrics {
    started_at: Instant,
    pub connections: Arc<AtomicU64>,
    pub sessions_started: Arc<AtomicU64>,
    pub sessions_completed: Arc<AtomicU64>,
    pub sessions_failed: Arc<AtomicU64>,
    pub frames_relayed: Arc<AtomicU64>,
    pub bytes_relayed: Arc<AtomicU64>,
    pub overflow_trips: Arc<AtomicU64>,
    pub delivery_failures: Arc<AtomicU64>,
    pub tokens_issued: Arc<AtomicU64>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections: Arc::new(AtomicU64::new(0)),
            sessions_started: Arc::new(AtomicU64::new(0)),
            sessions_completed: Arc::new(AtomicU64::new(0)),
            sessions_failed: Arc::new(AtomicU64::new(0)),
            frames_relayed: Arc::new(AtomicU64::new(0)),
            bytes_relayed: Arc::new(AtomicU64::new(0)),
            overflow_trips: Arc::new(AtomicU64::new(0)),
            delivery_failures: Arc::new(AtomicU64::new(0)),
            tokens_issued: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed session, classifying the cause.
    pub fn record_session_failed(&self, err: &StreamError) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        match err {
            StreamError::QueueOverflow { .. } => {
                self.overflow_trips.fetch_add(1, Ordering::Relaxed);
            }
            StreamError::DeliveryFailed(_) => {
                self.delivery_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_frame(&self, bytes: usize) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_token_issued(&self) {
        self.tokens_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_sessions: usize) -> MetricsResponse {
        MetricsResponse {
            timestamp: Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_sessions,
            connections: self.connections.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            overflow_trips: self.overflow_trips.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub connections: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub overflow_trips: u64,
    pub delivery_failures: u64,
    pub tokens_issued: u64,
}
