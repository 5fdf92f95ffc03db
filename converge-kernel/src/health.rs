use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Rapport exposé par GET /health/system
#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u64,
    pub events: EventCounters,
    pub dispatches: DispatchCounters,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventCounters {
    pub processed: u64,
    pub duplicate: u64,
    pub malformed: u64,
    /// Abandonnés après épuisement des tentatives locales
    pub abandoned: u64,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchCounters {
    pub sent: u64,
    pub acked: u64,
    pub retried: u64,
    pub failed: u64,
    pub acks_ignored: u64,
}

#[derive(Default)]
struct Counters {
    events_processed: AtomicU64,
    events_duplicate: AtomicU64,
    events_malformed: AtomicU64,
    events_abandoned: AtomicU64,
    dispatches_sent: AtomicU64,
    dispatches_acked: AtomicU64,
    dispatches_retried: AtomicU64,
    dispatches_failed: AtomicU64,
    acks_ignored: AtomicU64,
    mqtt_reconnects: AtomicU64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        bump(&self.counters.mqtt_reconnects);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn event_processed(&self) {
        bump(&self.counters.events_processed);
    }

    pub fn event_duplicate(&self) {
        bump(&self.counters.events_duplicate);
    }

    pub fn event_malformed(&self) {
        bump(&self.counters.events_malformed);
    }

    pub fn event_abandoned(&self) {
        bump(&self.counters.events_abandoned);
    }

    pub fn dispatch_sent(&self) {
        bump(&self.counters.dispatches_sent);
    }

    pub fn dispatch_acked(&self) {
        bump(&self.counters.dispatches_acked);
    }

    pub fn dispatch_retried(&self) {
        bump(&self.counters.dispatches_retried);
    }

    /// Échec terminal (plus de retry)
    pub fn dispatch_failed(&self) {
        bump(&self.counters.dispatches_failed);
    }

    pub fn ack_ignored(&self) {
        bump(&self.counters.acks_ignored);
    }

    pub fn get_health(&self) -> KernelHealth {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: load(&c.mqtt_reconnects),
            events: EventCounters {
                processed: load(&c.events_processed),
                duplicate: load(&c.events_duplicate),
                malformed: load(&c.events_malformed),
                abandoned: load(&c.events_abandoned),
            },
            dispatches: DispatchCounters {
                sent: load(&c.dispatches_sent),
                acked: load(&c.dispatches_acked),
                retried: load(&c.dispatches_retried),
                failed: load(&c.dispatches_failed),
                acks_ignored: load(&c.acks_ignored),
            },
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}
