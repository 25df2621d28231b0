use crate::mapping::DefinitionSource;
use crate::store::StoreInfo;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub connections_active: u64,
    pub connections_total: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub transitions_detected: u64,
    pub occurrences_opened: u64,
    pub occurrences_resolved: u64,
    pub store_errors: u64,
    pub definitions_loaded: usize,
    pub definition_source: DefinitionSource,
    pub store: StoreInfo,
    pub memory_usage_mb: f32,
}

#[derive(Debug, Default)]
struct Counters {
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
    transitions: AtomicU64,
    opened: AtomicU64,
    resolved: AtomicU64,
    store_errors: AtomicU64,
}

/// Compteurs partagés par le serveur TCP, le pipeline et le tracker
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now(), counters: Arc::new(Counters::default()) }
    }

    pub fn connection_opened(&self) {
        self.counters.connections_active.fetch_add(1, Ordering::Relaxed);
        self.counters.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // jamais sous zéro, même si close est appelé deux fois
        let _ = self
            .counters
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn frame_received(&self, bytes: usize) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn transitions_detected(&self, count: usize) {
        self.counters.transitions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn occurrence_opened(&self) {
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn occurrences_resolved(&self, count: usize) {
        self.counters.resolved.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn store_error(&self) {
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.counters.connections_active.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, definitions_loaded: usize, definition_source: DefinitionSource, store: StoreInfo) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connections_active: c.connections_active.load(Ordering::Relaxed),
            connections_total: c.connections_total.load(Ordering::Relaxed),
            frames_received: c.frames.load(Ordering::Relaxed),
            bytes_received: c.bytes.load(Ordering::Relaxed),
            transitions_detected: c.transitions.load(Ordering::Relaxed),
            occurrences_opened: c.opened.load(Ordering::Relaxed),
            occurrences_resolved: c.resolved.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            definitions_loaded,
            definition_source,
            store,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|s| s.parse::<u64>().ok()) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }

    0.0
}
