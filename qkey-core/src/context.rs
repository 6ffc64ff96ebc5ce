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

//! Key provisioning context
//!
//! The context owns one loader session at a time and hands out key records
//! on demand.
//!
//! # Dispense policy
//!
//! The current-key cell always holds the token the *next* dispense will
//! return. When the buffer has a token, dispense swaps it into the cell and
//! returns the previous cell value; when the buffer is empty, the cell value
//! is returned again. Callers therefore always get a key promptly, at the
//! cost of identical token material under different ids while the source
//! is depleted.
//!
//! Buffer advance, id allocation and record insertion happen under a single
//! lock, so ids are gap-free and follow dispense order even with many
//! concurrent callers.

use crate::{
    buffer::{KeyBuffer, WatermarkLevel},
    config::ContextConfig,
    loader::{KeyLoader, LoaderState},
    record::{KeyRecord, RecordTable, RetentionPolicy},
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Granularity of the startup wait, so a failed loader ends it early
const FIRST_TOKEN_POLL: Duration = Duration::from_millis(20);

/// Hands out quantum keys read from a continuously growing key file
///
/// Construct once at process start and share it behind an `Arc`; every
/// operation takes `&self`.
pub struct KeyContext {
    config: RwLock<ContextConfig>,
    lifecycle: Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

/// Everything that lives from `start` to `stop`
struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    source_path: PathBuf,
    stop_timeout: Duration,
    buffer: KeyBuffer,
    loader: Mutex<KeyLoader>,
    ledger: Mutex<Ledger>,
}

/// Current-key cell, id counter and record table, guarded together
struct Ledger {
    current: String,
    next_id: u64,
    records: RecordTable,
}

impl Ledger {
    fn new(first: String, retention: RetentionPolicy) -> Self {
        Self {
            current: first,
            next_id: 0,
            records: RecordTable::new(retention),
        }
    }

    fn dispense(&mut self, buffer: &KeyBuffer) -> KeyRecord {
        let token = match buffer.try_pop() {
            Some(next) => std::mem::replace(&mut self.current, next),
            None => self.current.clone(),
        };

        let record = KeyRecord::new(self.next_id, token);
        self.next_id += 1;
        self.records.insert(record.clone());
        record
    }
}

/// Point-in-time view of the context for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStatus {
    pub running: bool,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub source_path: PathBuf,
    pub loader_state: Option<LoaderState>,
    pub loader_error: Option<String>,
    pub tokens_loaded: u64,
    pub buffered_keys: usize,
    pub buffer_capacity: usize,
    pub buffer_fill_percent: f64,
    pub buffer_watermark: Option<WatermarkLevel>,
    /// Tokens taken out of the buffer, including the startup seed
    pub tokens_consumed: u64,
    pub keys_dispensed: u64,
    pub records_retained: usize,
    /// Records dropped by the retention policy
    pub records_evicted: u64,
}

impl ContextStatus {
    /// True when dispense is repeating the last key instead of advancing
    pub fn is_stale(&self) -> bool {
        self.running && self.buffered_keys == 0
    }

    pub fn loader_failed(&self) -> bool {
        self.loader_state == Some(LoaderState::Failed)
    }
}

impl KeyContext {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config: RwLock::new(config),
            lifecycle: Mutex::new(()),
            session: RwLock::new(None),
        }
    }

    /// Replace the configuration; only allowed while the context is stopped
    pub fn configure(&self, config: ContextConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        if self.session.read().is_some() {
            return Err(Error::Config(
                "configuration cannot change after the context is started".to_string(),
            ));
        }

        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn config(&self) -> ContextConfig {
        self.config.read().clone()
    }

    /// Launch the loader and wait for the first key
    ///
    /// Blocks for at most the configured startup timeout. If no key shows
    /// up in time the loader is shut down again and the context stays
    /// unusable.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        if self.session.read().is_some() {
            return Err(Error::InvalidState("context already started".to_string()));
        }

        let config = self.config.read().clone();
        config.validate()?;

        let buffer = KeyBuffer::new(config.buffer_capacity)?;
        let loader = KeyLoader::new(&config.source_path, buffer.clone(), config.idle_backoff());
        self.launch(&config, buffer, loader)
    }

    /// Run `loader`, wait for its first token and install the new session
    ///
    /// Callers hold the lifecycle lock and have checked that no session is
    /// active.
    fn launch(&self, config: &ContextConfig, buffer: KeyBuffer, mut loader: KeyLoader) -> Result<()> {
        loader.start()?;

        let Some(first) = await_first_token(&buffer, &loader, config.startup_timeout()) else {
            loader.stop(config.stop_timeout());
            warn!(
                "No key loaded from {} within {:?}",
                loader.source_path().display(),
                config.startup_timeout()
            );
            return Err(Error::StartupTimeout(config.startup_timeout()));
        };

        let session = Session {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            source_path: loader.source_path().to_path_buf(),
            stop_timeout: config.stop_timeout(),
            buffer,
            loader: Mutex::new(loader),
            ledger: Mutex::new(Ledger::new(first, config.retention())),
        };

        info!(
            "Key context {} started on {} (buffer capacity {})",
            session.id,
            session.source_path.display(),
            session.buffer.capacity()
        );

        *self.session.write() = Some(Arc::new(session));
        Ok(())
    }

    /// Stop the loader and discard the buffer and served-key table
    ///
    /// Safe to call on a context that is already stopped or never started.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();

        let Some(session) = self.session.write().take() else {
            debug!("Key context already stopped");
            return;
        };

        let exited = session.loader.lock().stop(session.stop_timeout);
        let dispensed = session.ledger.lock().next_id;
        info!(
            "Key context {} stopped after dispensing {} keys (loader exited: {})",
            session.id, dispensed, exited
        );
    }

    pub fn is_running(&self) -> bool {
        self.session.read().is_some()
    }

    /// Issue the next key record
    ///
    /// Never waits on the loader. Fails only when the context is not
    /// started.
    pub fn dispense(&self) -> Result<KeyRecord> {
        let session = self.session()?;
        let record = session.ledger.lock().dispense(&session.buffer);
        Ok(record)
    }

    /// Fetch a previously dispensed record
    ///
    /// Negative ids, ids never dispensed and ids dropped by the retention
    /// policy all yield `None`.
    pub fn retrieve(&self, id: i64) -> Option<KeyRecord> {
        let session = self.session().ok()?;
        let ledger = session.ledger.lock();
        ledger.records.get(id)
    }

    /// Number of tokens waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.session
            .read()
            .as_ref()
            .map_or(0, |session| session.buffer.len())
    }

    pub fn status(&self) -> ContextStatus {
        let Ok(session) = self.session() else {
            let config = self.config.read();
            return ContextStatus {
                running: false,
                session_id: None,
                started_at: None,
                source_path: config.source_path.clone(),
                loader_state: None,
                loader_error: None,
                tokens_loaded: 0,
                buffered_keys: 0,
                buffer_capacity: config.buffer_capacity,
                buffer_fill_percent: 0.0,
                buffer_watermark: None,
                tokens_consumed: 0,
                keys_dispensed: 0,
                records_retained: 0,
                records_evicted: 0,
            };
        };

        let (loader_state, loader_error, tokens_loaded) = {
            let loader = session.loader.lock();
            (loader.state(), loader.last_error(), loader.tokens_loaded())
        };
        let (keys_dispensed, records_retained, table_stats) = {
            let ledger = session.ledger.lock();
            (ledger.next_id, ledger.records.len(), ledger.records.stats())
        };

        ContextStatus {
            running: true,
            session_id: Some(session.id),
            started_at: Some(session.started_at),
            source_path: session.source_path.clone(),
            loader_state: Some(loader_state),
            loader_error,
            tokens_loaded,
            buffered_keys: session.buffer.len(),
            buffer_capacity: session.buffer.capacity(),
            buffer_fill_percent: session.buffer.fill_percent(),
            buffer_watermark: Some(session.buffer.watermark()),
            tokens_consumed: session.buffer.stats().total_pops,
            keys_dispensed,
            records_retained,
            records_evicted: table_stats.evictions_capacity + table_stats.evictions_ttl,
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidState("key context is not started".to_string()))
    }
}

impl Default for KeyContext {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl Drop for KeyContext {
    fn drop(&mut self) {
        self.stop();
    }
}

fn await_first_token(buffer: &KeyBuffer, loader: &KeyLoader, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return buffer.try_pop();
        }

        if let Some(token) = buffer.pop_timeout(remaining.min(FIRST_TOKEN_POLL)) {
            return Some(token);
        }

        if loader.state() == LoaderState::Failed {
            return buffer.try_pop();
        }
    }
}
