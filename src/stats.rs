use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::info;

/// Lock-free counters shared by every request issued through one client.
#[derive(Debug, Default)]
pub struct ClientStats {
    active_requests: AtomicU32,
    requests_dispatched: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub active_requests: u32,
    pub requests_dispatched: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self, succeeded: bool) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        let counter = if succeeded {
            &self.requests_succeeded
        } else {
            &self.requests_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_requests: self.active_requests.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            active = s.active_requests,
            dispatched = s.requests_dispatched,
            succeeded = s.requests_succeeded,
            failed = s.requests_failed,
            open_connections = s.connections_opened.saturating_sub(s.connections_closed),
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            "proxy client stats"
        );
    }
}
