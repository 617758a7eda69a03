#![forbid(unsafe_code)]

// Service metrics: lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket boundaries in microseconds.
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    5_000_000,
];

const BUCKET_LABELS: [&str; 10] = [
    "0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5",
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Service-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServiceMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_torn_down_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    worker_deaths_total: AtomicU64,
    worker_respawns_total: AtomicU64,

    connections_active: AtomicU64,

    message_handling: Histogram,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_dropped_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                rooms_torn_down_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                worker_deaths_total: AtomicU64::new(0),
                worker_respawns_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    // --- Counters ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    /// Outbound message dropped because the recipient's queue was full
    pub fn inc_messages_dropped(&self) {
        self.inner.messages_dropped_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_torn_down(&self) {
        self.inner.rooms_torn_down_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_worker_deaths(&self) {
        self.inner.worker_deaths_total.fetch_add(1, Relaxed);
    }

    pub fn inc_worker_respawns(&self) {
        self.inner.worker_respawns_total.fetch_add(1, Relaxed);
    }

    pub fn worker_deaths(&self) -> u64 {
        self.inner.worker_deaths_total.load(Relaxed)
    }

    pub fn worker_respawns(&self) -> u64 {
        self.inner.worker_respawns_total.load(Relaxed)
    }

    // --- Gauge ---

    /// Increments connections_active and returns a guard that decrements it on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// Room, router, and worker gauges are sampled by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, routers_active: usize, workers_live: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "voice_service_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "voice_service_messages_received_total", "Total messages received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "voice_service_messages_dropped_total", "Outbound messages dropped on full queues", i.messages_dropped_total.load(Relaxed));
        render_counter(&mut out, "voice_service_errors_total", "Total signaling errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "voice_service_rooms_created_total", "Total channel routers created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "voice_service_rooms_torn_down_total", "Total rooms torn down after the grace period", i.rooms_torn_down_total.load(Relaxed));
        render_counter(&mut out, "voice_service_joins_total", "Total channel joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "voice_service_leaves_total", "Total channel leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "voice_service_producers_created_total", "Total producers created", i.producers_created_total.load(Relaxed));
        render_counter(&mut out, "voice_service_consumers_created_total", "Total consumers created", i.consumers_created_total.load(Relaxed));
        render_counter(&mut out, "voice_service_worker_deaths_total", "Total unexpected worker exits", i.worker_deaths_total.load(Relaxed));
        render_counter(&mut out, "voice_service_worker_respawns_total", "Total workers respawned", i.worker_respawns_total.load(Relaxed));

        render_gauge(&mut out, "voice_service_connections_active", "Currently open WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "voice_service_rooms_active", "Rooms with a live router or pending teardown", rooms_active as u64);
        render_gauge(&mut out, "voice_service_routers_active", "Live channel routers", routers_active as u64);
        render_gauge(&mut out, "voice_service_workers_live", "Live media workers", workers_live as u64);

        i.message_handling.render(
            "voice_service_message_handling_seconds",
            "Signaling message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
