//! Process-wide debugging-session counters. Plain atomics back
//! [`snapshot`]; the same samples feed prometheus collectors once
//! [`register_metrics`] hands them to a registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub events: u64,
    pub command_success: u64,
    pub command_failures: u64,
    pub evaluation_failures: u64,
    pub command_latency_total_us: u64,
}

#[derive(Clone, Copy)]
enum Slot {
    Commands,
    Events,
    CommandSuccess,
    CommandFailures,
    EvaluationFailures,
    LatencyMicros,
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);
static SLOTS: [AtomicU64; 6] = [ZERO; 6];

fn bump(slot: Slot, by: u64) {
    SLOTS[slot as usize].fetch_add(by, Ordering::Relaxed);
}

fn read(slot: Slot) -> u64 {
    SLOTS[slot as usize].load(Ordering::Relaxed)
}

struct Collectors {
    commands: IntCounterVec,
    failures: IntCounterVec,
    latency: HistogramVec,
    events: IntCounter,
    evaluation_failures: IntCounter,
}

impl Collectors {
    fn build() -> prometheus::Result<Self> {
        Ok(Self {
            commands: IntCounterVec::new(
                opts!("feedtap_cdp_commands_total", "Debugging commands sent, by method"),
                &["method"],
            )?,
            failures: IntCounterVec::new(
                opts!(
                    "feedtap_cdp_command_failures_total",
                    "Debugging commands that failed or timed out, by method"
                ),
                &["method"],
            )?,
            latency: HistogramVec::new(
                histogram_opts!(
                    "feedtap_cdp_command_duration_seconds",
                    "Round trip of successful debugging commands",
                    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
                ),
                &["method"],
            )?,
            events: IntCounter::new(
                "feedtap_cdp_events_total",
                "Page-session notifications received",
            )?,
            evaluation_failures: IntCounter::new(
                "feedtap_cdp_evaluation_failures_total",
                "Script evaluations that raised in the page or never reached it",
            )?,
        })
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.commands.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.latency.clone()))?;
        registry.register(Box::new(self.events.clone()))?;
        registry.register(Box::new(self.evaluation_failures.clone()))
    }
}

lazy_static! {
    static ref COLLECTORS: Option<Collectors> = match Collectors::build() {
        Ok(collectors) => Some(collectors),
        Err(err) => {
            error!(target: "cdp-metrics", %err, "invalid metric definition; prometheus export disabled");
            None
        }
    };
}

/// Exposes the session collectors on `registry`. Registering twice is
/// reported and otherwise ignored.
pub fn register_metrics(registry: &Registry) {
    let Some(collectors) = COLLECTORS.as_ref() else {
        return;
    };
    match collectors.register(registry) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
        Err(err) => error!(target: "cdp-metrics", %err, "failed to register session metrics"),
    }
}

pub fn record_command(method: &str) {
    bump(Slot::Commands, 1);
    if let Some(c) = COLLECTORS.as_ref() {
        c.commands.with_label_values(&[method]).inc();
    }
}

pub fn record_command_success(method: &str, elapsed: Duration) {
    bump(Slot::CommandSuccess, 1);
    bump(
        Slot::LatencyMicros,
        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
    );
    if let Some(c) = COLLECTORS.as_ref() {
        c.latency
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }
}

pub fn record_command_failure(method: &str) {
    bump(Slot::CommandFailures, 1);
    if let Some(c) = COLLECTORS.as_ref() {
        c.failures.with_label_values(&[method]).inc();
    }
}

pub fn record_event() {
    bump(Slot::Events, 1);
    if let Some(c) = COLLECTORS.as_ref() {
        c.events.inc();
    }
}

pub fn record_evaluation_failure() {
    bump(Slot::EvaluationFailures, 1);
    if let Some(c) = COLLECTORS.as_ref() {
        c.evaluation_failures.inc();
    }
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        commands: read(Slot::Commands),
        events: read(Slot::Events),
        command_success: read(Slot::CommandSuccess),
        command_failures: read(Slot::CommandFailures),
        evaluation_failures: read(Slot::EvaluationFailures),
        command_latency_total_us: read(Slot::LatencyMicros),
    }
}

/// Zeroes the snapshot counters. Prometheus collectors are monotonic and
/// keep their values.
pub fn reset() {
    for slot in &SLOTS {
        slot.store(0, Ordering::Relaxed);
    }
}
