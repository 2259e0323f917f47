//! # Stage: Homeostasis Monitor
//!
//! ## Responsibility
//! Samples the kernel's operational health (pipeline latency, memory
//! saturation, cumulative API spend) on a fixed interval and publishes the
//! result as a [`SystemMetabolism`] snapshot.
//!
//! ## Guarantees
//! - Atomic publication: each tick replaces the snapshot wholesale through a
//!   `watch` channel; readers get a copy, never a partially updated value
//! - Non-blocking: `record_*` methods only touch a short-lived accumulator lock
//! - Degrading: a failed resource read keeps the previous snapshot and logs
//! - Monotonic cost: `api_cost` never decreases
//!
//! ## NOT Responsible For
//! - Acting on the metabolism (the planner forwards it to the generator)

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HomeostasisConfig;
use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// SystemMetabolism
// ---------------------------------------------------------------------------

/// Point-in-time operational health.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemMetabolism {
    /// Mean pipeline latency over the rolling window.
    pub latency: Duration,
    /// Resident memory as a percentage of total memory.
    pub memory_saturation: f64,
    /// Cumulative API spend in USD since startup.
    pub api_cost: f64,
}

// ---------------------------------------------------------------------------
// Resource probes
// ---------------------------------------------------------------------------

/// Source of the memory reading. Swappable so tests can simulate failures.
pub trait ResourceProbe: Send + Sync {
    fn memory_saturation(&self) -> Result<f64>;
}

/// Reads `VmRSS` from `/proc/self/status` and `MemTotal` from `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct ProcMemoryProbe;

impl ProcMemoryProbe {
    fn read_kb(path: &str, key: &str) -> Result<f64> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Telemetry(format!("{path}: {e}")))?;
        parse_kb_field(&raw, key)
            .ok_or_else(|| KernelError::Telemetry(format!("{key} missing from {path}")))
    }
}

impl ResourceProbe for ProcMemoryProbe {
    fn memory_saturation(&self) -> Result<f64> {
        let rss = Self::read_kb("/proc/self/status", "VmRSS:")?;
        let total = Self::read_kb("/proc/meminfo", "MemTotal:")?;
        if total <= 0.0 {
            return Err(KernelError::Telemetry("MemTotal is zero".into()));
        }
        Ok(rss / total * 100.0)
    }
}

/// Parse a `Key:   12345 kB` line.
fn parse_kb_field(raw: &str, key: &str) -> Option<f64> {
    raw.lines()
        .find(|l| l.starts_with(key))
        .and_then(|l| l[key.len()..].split_whitespace().next())
        .and_then(|v| v.parse::<f64>().ok())
}

/// Constant reading. Useful where `/proc` is unavailable and in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub f64);

impl ResourceProbe for FixedProbe {
    fn memory_saturation(&self) -> Result<f64> {
        Ok(self.0)
    }
}

// ---------------------------------------------------------------------------
// Rolling ring buffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer of `f64` samples. Evicts the oldest when full.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<f64>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0.0; capacity.max(1)], head: 0, len: 0 }
    }

    pub fn push(&mut self, value: f64) {
        let cap = self.buf.len();
        self.buf[self.head] = value;
        self.head = (self.head + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let cap = self.buf.len();
        let start = if self.len == cap { self.head } else { 0 };
        (0..self.len).map(move |i| self.buf[(start + i) % cap])
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.iter().sum::<f64>() / self.len as f64)
    }

    pub fn p95(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let mut v: Vec<f64> = self.iter().collect();
        v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((v.len() as f64 * 0.95).ceil() as usize).saturating_sub(1).min(v.len() - 1);
        Some(v[idx])
    }
}

// ---------------------------------------------------------------------------
// Per-interval accumulator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Accumulator {
    latency_sum_us: u64,
    latency_count: u64,
    cost_usd: f64,
}

impl Accumulator {
    fn avg_latency_us(&self) -> Option<f64> {
        (self.latency_count > 0).then(|| self.latency_sum_us as f64 / self.latency_count as f64)
    }

    fn reset(&mut self) -> Accumulator {
        std::mem::take(self)
    }
}

// ---------------------------------------------------------------------------
// HomeostasisMonitor
// ---------------------------------------------------------------------------

struct MonitorState {
    cfg: HomeostasisConfig,
    probe: Box<dyn ResourceProbe>,
    window: Mutex<RingBuffer>,
    accumulator: Mutex<Accumulator>,
    tx: watch::Sender<SystemMetabolism>,
}

/// Clone freely; all clones share the same state.
#[derive(Clone)]
pub struct HomeostasisMonitor {
    inner: Arc<MonitorState>,
}

impl HomeostasisMonitor {
    pub fn new(cfg: HomeostasisConfig, probe: Box<dyn ResourceProbe>) -> Self {
        let (tx, _) = watch::channel(SystemMetabolism::default());
        let window = Mutex::new(RingBuffer::new(cfg.latency_window));
        Self {
            inner: Arc::new(MonitorState {
                cfg,
                probe,
                window,
                accumulator: Mutex::new(Accumulator::default()),
                tx,
            }),
        }
    }

    /// Latest published snapshot, by value.
    pub fn current(&self) -> SystemMetabolism {
        *self.inner.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemMetabolism> {
        self.inner.tx.subscribe()
    }

    /// Report the wall-clock latency of one pipeline run.
    pub fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut acc = self.inner.accumulator.lock().unwrap_or_else(PoisonError::into_inner);
        acc.latency_sum_us = acc.latency_sum_us.saturating_add(micros);
        acc.latency_count += 1;
    }

    /// Report spend on the generation service. Negative or non-finite amounts are dropped.
    pub fn record_api_cost(&self, usd: f64) {
        if !usd.is_finite() || usd < 0.0 {
            tracing::warn!(target: "kernel::homeostasis", usd, "ignoring invalid api cost");
            return;
        }
        let mut acc = self.inner.accumulator.lock().unwrap_or_else(PoisonError::into_inner);
        acc.cost_usd += usd;
    }

    /// p95 of the rolling latency window.
    pub fn latency_p95(&self) -> Option<Duration> {
        let window = self.inner.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.p95().map(|us| Duration::from_micros(us as u64))
    }

    /// Take one sample and publish it. On a failed resource read the previous
    /// snapshot stays published and accumulated reports carry over.
    pub fn sample_once(&self) -> SystemMetabolism {
        let prev = self.current();
        let memory = match self.inner.probe.memory_saturation() {
            Ok(v) if v.is_finite() && v >= 0.0 => v,
            Ok(v) => {
                tracing::warn!(target: "kernel::homeostasis", value = v, "implausible memory reading; keeping previous snapshot");
                return prev;
            }
            Err(e) => {
                tracing::warn!(target: "kernel::homeostasis", error = %e, "resource read failed; keeping previous snapshot");
                return prev;
            }
        };

        let acc = self.inner.accumulator.lock().unwrap_or_else(PoisonError::into_inner).reset();
        let latency = {
            let mut window = self.inner.window.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(avg) = acc.avg_latency_us() {
                window.push(avg);
            }
            window.mean().map(|us| Duration::from_micros(us as u64)).unwrap_or(prev.latency)
        };

        let next = SystemMetabolism {
            latency,
            memory_saturation: memory,
            api_cost: prev.api_cost + acc.cost_usd,
        };
        self.inner.tx.send_replace(next);
        tracing::debug!(
            target: "kernel::homeostasis",
            latency_ms = next.latency.as_millis() as u64,
            memory_saturation = next.memory_saturation,
            api_cost = next.api_cost,
            "metabolism sampled"
        );
        next
    }

    /// Spawn the sampling loop. Call once after construction.
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(autonomic_sensor(monitor))
    }
}

async fn autonomic_sensor(monitor: HomeostasisMonitor) {
    let mut interval = tokio::time::interval(monitor.inner.cfg.sample_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        monitor.sample_once();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyProbe {
        fail: AtomicBool,
    }

    impl ResourceProbe for FlakyProbe {
        fn memory_saturation(&self) -> Result<f64> {
            if self.fail.load(Ordering::SeqCst) {
                Err(KernelError::Telemetry("probe offline".into()))
            } else {
                Ok(42.0)
            }
        }
    }

    fn monitor(probe: Box<dyn ResourceProbe>) -> HomeostasisMonitor {
        HomeostasisMonitor::new(
            HomeostasisConfig { sample_interval_secs: 1, latency_window: 4 },
            probe,
        )
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut rb = RingBuffer::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            rb.push(v);
        }
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(rb.mean(), Some(3.0));
    }

    #[test]
    fn test_ring_buffer_p95_and_empty() {
        let mut rb = RingBuffer::new(100);
        assert!(rb.p95().is_none());
        for i in 1..=100 {
            rb.push(i as f64);
        }
        assert_eq!(rb.p95(), Some(95.0));
    }

    #[test]
    fn test_zero_capacity_ring_buffer_is_usable() {
        let mut rb = RingBuffer::new(0);
        rb.push(5.0);
        assert_eq!(rb.mean(), Some(5.0));
    }

    #[test]
    fn test_parse_kb_field() {
        let raw = "Name:\tkernel\nVmRSS:\t   20480 kB\nThreads: 4\n";
        assert_eq!(parse_kb_field(raw, "VmRSS:"), Some(20480.0));
        assert_eq!(parse_kb_field(raw, "MemTotal:"), None);
    }

    #[test]
    fn test_initial_snapshot_is_zero() {
        let m = monitor(Box::new(FixedProbe(10.0)));
        assert_eq!(m.current(), SystemMetabolism::default());
    }

    #[test]
    fn test_sample_publishes_latency_memory_and_cost() {
        let m = monitor(Box::new(FixedProbe(12.5)));
        m.record_latency(Duration::from_millis(100));
        m.record_latency(Duration::from_millis(300));
        m.record_api_cost(0.01);
        let s = m.sample_once();
        assert_eq!(s.latency, Duration::from_millis(200));
        assert_eq!(s.memory_saturation, 12.5);
        assert!((s.api_cost - 0.01).abs() < 1e-12);
        assert_eq!(m.current(), s);
    }

    #[test]
    fn test_api_cost_is_monotonic() {
        let m = monitor(Box::new(FixedProbe(1.0)));
        m.record_api_cost(0.5);
        let a = m.sample_once().api_cost;
        m.record_api_cost(-3.0);
        m.record_api_cost(f64::NAN);
        let b = m.sample_once().api_cost;
        m.record_api_cost(0.25);
        let c = m.sample_once().api_cost;
        assert!(a <= b && b <= c);
        assert!((c - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_latency_retained_when_no_runs_reported() {
        let m = monitor(Box::new(FixedProbe(1.0)));
        m.record_latency(Duration::from_millis(50));
        let first = m.sample_once();
        let second = m.sample_once();
        assert_eq!(first.latency, second.latency);
    }

    #[test]
    fn test_probe_failure_keeps_previous_snapshot() {
        let probe = Arc::new(FlakyProbe { fail: AtomicBool::new(false) });
        struct Shared(Arc<FlakyProbe>);
        impl ResourceProbe for Shared {
            fn memory_saturation(&self) -> Result<f64> {
                self.0.memory_saturation()
            }
        }
        let m = monitor(Box::new(Shared(Arc::clone(&probe))));
        m.record_api_cost(1.0);
        let good = m.sample_once();

        probe.fail.store(true, Ordering::SeqCst);
        m.record_api_cost(2.0);
        let degraded = m.sample_once();
        assert_eq!(degraded, good);

        // cost reported during the outage is not lost
        probe.fail.store(false, Ordering::SeqCst);
        let recovered = m.sample_once();
        assert!((recovered.api_cost - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_implausible_reading_keeps_previous_snapshot() {
        let m = monitor(Box::new(FixedProbe(f64::NAN)));
        assert_eq!(m.sample_once(), SystemMetabolism::default());
    }

    #[test]
    fn test_latency_p95_tracks_window() {
        let m = monitor(Box::new(FixedProbe(1.0)));
        assert!(m.latency_p95().is_none());
        m.record_latency(Duration::from_millis(10));
        m.sample_once();
        assert_eq!(m.latency_p95(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_subscriber_sees_published_snapshot() {
        let m = monitor(Box::new(FixedProbe(7.0)));
        let mut rx = m.subscribe();
        m.sample_once();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().memory_saturation, 7.0);
    }

    #[tokio::test]
    async fn test_sensor_loop_samples_on_first_tick() {
        let m = monitor(Box::new(FixedProbe(3.0)));
        let handle = m.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert_eq!(m.current().memory_saturation, 3.0);
    }
}
