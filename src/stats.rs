use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by every connection handler.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_failed: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_stores: AtomicU64,
    pub tunnels_total: AtomicU64,
    pub bytes_relayed: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // saturating: never wrap below zero
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_store(&self) {
        self.cache_stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.tunnels_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_stores: self.cache_stores.load(Ordering::Relaxed),
            tunnels_total: self.tunnels_total.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stores: u64,
    pub tunnels_total: u64,
    pub bytes_relayed: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "connections={} active={} failed={} cache_hits={} cache_misses={} cache_stores={} tunnels={} bytes={}",
            self.connections_total,
            self.connections_active,
            self.connections_failed,
            self.cache_hits,
            self.cache_misses,
            self.cache_stores,
            self.tunnels_total,
            self.bytes_relayed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connections_never_underflow() {
        let stats = ProxyStats::new();
        stats.connection_closed();
        assert_eq!(stats.snapshot().connections_active, 0);

        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = ProxyStats::new();
        stats.cache_hit();
        stats.record_bytes(512);
        let line = stats.snapshot().to_string();
        assert!(line.contains("cache_hits=1"));
        assert!(line.contains("bytes=512"));
    }
}
