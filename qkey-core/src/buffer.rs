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

//! Bounded FIFO of key tokens shared between the loader and the context
//!
//! The buffer is the only structure touched by both the loader thread and
//! request threads. It wraps a `crossbeam` bounded channel, so pushes block
//! while the buffer is full and pops block while it is empty.

use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Thread-safe bounded key buffer with FIFO semantics
///
/// # Design
///
/// - Capacity is fixed at construction and never resized
/// - Cloning yields another handle onto the same queue
/// - The buffer holds both channel ends, so it never disconnects while a
///   handle is alive
#[derive(Clone)]
pub struct KeyBuffer {
    tx: Sender<String>,
    rx: Receiver<String>,
    capacity: usize,
    stats: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    total_pushes: AtomicU64,
    total_pops: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub total_pushes: u64,
    pub total_pops: u64,
}

/// Buffer watermark levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkLevel {
    Low,      // < 10%
    Medium,   // 10-80%
    High,     // 80-95%
    Critical, // > 95%
}

impl KeyBuffer {
    /// Create a new buffer holding at most `capacity` tokens
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("buffer capacity must be > 0".to_string()));
        }

        let (tx, rx) = channel::bounded(capacity);
        Ok(Self {
            tx,
            rx,
            capacity,
            stats: Arc::new(StatsInner::default()),
        })
    }

    /// Append a token, blocking while the buffer is full
    pub fn push(&self, token: impl Into<String>) -> Result<()> {
        self.tx
            .send(token.into())
            .map_err(|_| Error::Internal("key buffer disconnected".to_string()))?;
        self.stats.total_pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append a token, waiting at most `timeout` for space
    ///
    /// On timeout the token is handed back so the caller can retry.
    pub fn push_timeout(
        &self,
        token: String,
        timeout: Duration,
    ) -> std::result::Result<(), String> {
        match self.tx.send_timeout(token, timeout) {
            Ok(()) => {
                self.stats.total_pushes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(token)) | Err(SendTimeoutError::Disconnected(token)) => {
                Err(token)
            }
        }
    }

    /// Remove the oldest token, blocking until one is present
    pub fn pop(&self) -> Option<String> {
        let token = self.rx.recv().ok()?;
        self.stats.total_pops.fetch_add(1, Ordering::Relaxed);
        Some(token)
    }

    /// Remove the oldest token, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(token) => {
                self.stats.total_pops.fetch_add(1, Ordering::Relaxed);
                Some(token)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Remove the oldest token if one is immediately available
    pub fn try_pop(&self) -> Option<String> {
        let token = self.rx.try_recv().ok()?;
        self.stats.total_pops.fetch_add(1, Ordering::Relaxed);
        Some(token)
    }

    /// Number of buffered tokens
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill percentage (0.0 - 100.0)
    pub fn fill_percent(&self) -> f64 {
        (self.len() as f64 / self.capacity as f64) * 100.0
    }

    /// Get current watermark level
    pub fn watermark(&self) -> WatermarkLevel {
        match self.fill_percent() {
            p if p < 10.0 => WatermarkLevel::Low,
            p if p < 80.0 => WatermarkLevel::Medium,
            p if p < 95.0 => WatermarkLevel::High,
            _ => WatermarkLevel::Critical,
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_pushes: self.stats.total_pushes.load(Ordering::Relaxed),
            total_pops: self.stats.total_pops.load(Ordering::Relaxed),
        }
    }
}
