// SPDX-License-Identifier: MIT
//
// QKey Dispenser: Quantum Key Provisioning Service
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara
//
// https://github.com/vbocan/qrng-data-diode

//! Metrics collection and reporting

use crate::context::ContextStatus;
use parking_lot::RwLock;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAX_LATENCY_SAMPLES: usize = 10_000;

/// Request-side counters for the key gateway
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    keys_dispensed: AtomicU64,
    keys_retrieved: AtomicU64,
    retrieval_misses: AtomicU64,
    requests_failed: AtomicU64,

    // Dispense latency (microseconds)
    dispense_latencies: RwLock<Vec<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                keys_dispensed: AtomicU64::new(0),
                keys_retrieved: AtomicU64::new(0),
                retrieval_misses: AtomicU64::new(0),
                requests_failed: AtomicU64::new(0),
                dispense_latencies: RwLock::new(Vec::with_capacity(MAX_LATENCY_SAMPLES)),
            }),
        }
    }

    pub fn record_dispense(&self, latency_micros: u64) {
        self.inner.keys_dispensed.fetch_add(1, Ordering::Relaxed);

        let mut latencies = self.inner.dispense_latencies.write();
        latencies.push(latency_micros);
        if latencies.len() > MAX_LATENCY_SAMPLES {
            latencies.drain(0..MAX_LATENCY_SAMPLES / 2);
        }
    }

    pub fn record_retrieval(&self) {
        self.inner.keys_retrieved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retrieval_miss(&self) {
        self.inner.retrieval_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keys_dispensed(&self) -> u64 {
        self.inner.keys_dispensed.load(Ordering::Relaxed)
    }

    pub fn keys_retrieved(&self) -> u64 {
        self.inner.keys_retrieved.load(Ordering::Relaxed)
    }

    pub fn retrieval_misses(&self) -> u64 {
        self.inner.retrieval_misses.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.inner.requests_failed.load(Ordering::Relaxed)
    }

    /// Successful key requests of either kind
    pub fn requests_total(&self) -> u64 {
        self.keys_dispensed() + self.keys_retrieved()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn requests_per_second(&self) -> f64 {
        let uptime = self.uptime_seconds() as f64;
        if uptime > 0.0 {
            self.requests_total() as f64 / uptime
        } else {
            0.0
        }
    }

    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let latencies = self.inner.dispense_latencies.read();
        if latencies.is_empty() {
            return None;
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn latency_p50(&self) -> Option<u64> {
        self.latency_percentile(0.50)
    }

    pub fn latency_p99(&self) -> Option<u64> {
        self.latency_percentile(0.99)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn prometheus_format(&self, status: &ContextStatus) -> String {
        let mut output = String::new();

        push_metric(&mut output, "qkey_keys_dispensed_total", "counter", "Keys dispensed", self.keys_dispensed());
        push_metric(&mut output, "qkey_keys_retrieved_total", "counter", "Previously issued keys retrieved", self.keys_retrieved());
        push_metric(&mut output, "qkey_retrieval_misses_total", "counter", "Retrievals for unknown key ids", self.retrieval_misses());
        push_metric(&mut output, "qkey_requests_failed_total", "counter", "Key requests that failed", self.requests_failed());
        push_metric(&mut output, "qkey_uptime_seconds", "gauge", "Service uptime in seconds", self.uptime_seconds());

        push_metric(&mut output, "qkey_context_running", "gauge", "1 if the key context is started", u8::from(status.running));
        push_metric(&mut output, "qkey_loader_failed", "gauge", "1 if the key loader stopped on an I/O error", u8::from(status.loader_failed()));
        push_metric(&mut output, "qkey_tokens_loaded", "gauge", "Tokens read from the key source this session", status.tokens_loaded);
        push_metric(&mut output, "qkey_buffered_keys", "gauge", "Keys waiting in the buffer", status.buffered_keys);
        push_metric(&mut output, "qkey_buffer_capacity", "gauge", "Key buffer capacity", status.buffer_capacity);
        push_metric(&mut output, "qkey_buffer_fill_percent", "gauge", "Key buffer fill percentage", status.buffer_fill_percent);
        push_metric(&mut output, "qkey_tokens_consumed", "gauge", "Tokens taken from the buffer this session", status.tokens_consumed);
        push_metric(&mut output, "qkey_records_retained", "gauge", "Served keys available for retrieval", status.records_retained);
        push_metric(&mut output, "qkey_records_evicted", "gauge", "Served keys dropped by the retention policy", status.records_evicted);

        if let Some(p50) = self.latency_p50() {
            push_metric(&mut output, "qkey_dispense_latency_p50_microseconds", "gauge", "Dispense latency 50th percentile", p50);
        }

        if let Some(p99) = self.latency_p99() {
            push_metric(&mut output, "qkey_dispense_latency_p99_microseconds", "gauge", "Dispense latency 99th percentile", p99);
        }

        output
    }
}

fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    // Writing into a String cannot fail
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
    let _ = writeln!(output, "{} {}", name, value);
}
