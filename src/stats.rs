use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Statistics for a single exposed port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    /// Exposed port
    pub port: u16,
    /// Total number of user connections
    pub total_connections: u64,
    /// Currently active user connections
    pub active_connections: u64,
    /// Total bytes received from users
    pub bytes_received: u64,
    /// Total bytes sent to users
    pub bytes_sent: u64,
    /// Timestamp when the port was first tracked (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker for a single exposed port
#[derive(Debug, Clone)]
pub struct PortStatsTracker {
    port: u16,
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    start_time: u64,
}

impl PortStatsTracker {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Increment active connections (called when a user connection is accepted)
    pub fn connection_started(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections (called when a user connection ends)
    pub fn connection_ended(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Add bytes read from the user
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes written to the user
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> PortStats {
        PortStats {
            port: self.port,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

/// RAII guard to automatically decrement active connections count
pub struct ConnectionGuard {
    tracker: PortStatsTracker,
}

impl ConnectionGuard {
    pub fn new(tracker: PortStatsTracker) -> Self {
        tracker.connection_started();
        Self { tracker }
    }

    pub fn tracker(&self) -> &PortStatsTracker {
        &self.tracker
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.connection_ended();
    }
}

/// Global statistics manager
#[derive(Debug, Clone, Default)]
pub struct StatsManager {
    ports: Arc<Mutex<HashMap<u16, PortStatsTracker>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the tracker for a port, creating it on first use
    pub fn tracker(&self, port: u16) -> PortStatsTracker {
        self.ports
            .lock()
            .entry(port)
            .or_insert_with(|| PortStatsTracker::new(port))
            .clone()
    }

    /// Get stats for all ports, sorted by port
    pub fn get_all_stats(&self) -> Vec<PortStats> {
        let mut stats: Vec<PortStats> = self
            .ports
            .lock()
            .values()
            .map(|tracker| tracker.get_stats())
            .collect();
        stats.sort_by_key(|s| s.port);
        stats
    }

    /// Get stats for a specific port
    pub fn get_port_stats(&self, port: u16) -> Option<PortStats> {
        self.ports.lock().get(&port).map(|tracker| tracker.get_stats())
    }

    /// Clear all stats
    pub fn clear(&self) {
        self.ports.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts() {
        let manager = StatsManager::new();
        let tracker = manager.tracker(50022);
        tracker.add_bytes_received(10);
        tracker.add_bytes_sent(20);

        {
            let _guard = ConnectionGuard::new(manager.tracker(50022));
            let stats = manager.get_port_stats(50022).unwrap();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.total_connections, 1);
        }

        let stats = manager.get_port_stats(50022).unwrap();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.bytes_received, 10);
        assert_eq!(stats.bytes_sent, 20);
    }

    #[test]
    fn test_active_never_underflows() {
        let tracker = PortStatsTracker::new(1);
        tracker.connection_ended();
        assert_eq!(tracker.get_stats().active_connections, 0);
    }

    #[test]
    fn test_get_all_sorted() {
        let manager = StatsManager::new();
        manager.tracker(3);
        manager.tracker(1);
        let ports: Vec<u16> = manager.get_all_stats().iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![1, 3]);
        manager.clear();
        assert!(manager.get_all_stats().is_empty());
    }
}
