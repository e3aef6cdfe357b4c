//! Call counters for remote transports.

use std::sync::atomic::{AtomicU64, Ordering};

/// Network calls made by a transport. Shared between the handles a factory
/// creates so an operator (or a test) can observe transport activity.
#[derive(Debug, Default)]
pub struct TransportStats {
    connects: AtomicU64,
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub connects: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
}

impl TransportStatsSnapshot {
    pub fn network_calls(&self) -> u64 {
        self.connects + self.uploads + self.downloads + self.deletes
    }
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_add_up() {
        let stats = TransportStats::new();
        assert_eq!(stats.snapshot().network_calls(), 0);

        stats.record_connect();
        stats.record_connect();
        stats.record_upload();
        stats.record_delete();

        let snap = stats.snapshot();
        assert_eq!(snap.connects, 2);
        assert_eq!(snap.uploads, 1);
        assert_eq!(snap.downloads, 0);
        assert_eq!(snap.network_calls(), 4);
    }
}
