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

//! Background task tailing the key source into the key buffer
//!
//! The loader opens the source once and keeps its read cursor, so content
//! that was already read is never scanned again. When it reaches the end of
//! what the QKD device has written so far it sleeps for the idle backoff and
//! tries again. A partially written last line is held back until its newline
//! arrives.
//!
//! Lines are opaque tokens. Bytes that are not valid UTF-8 are replaced
//! rather than treated as a source failure.
//!
//! Lifecycle: `Idle -> Running -> (Stopped | Failed)`. Both end states are
//! terminal; a new loader must be built to resume ingestion.

use crate::{buffer::KeyBuffer, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Loader lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderState {
    Idle,
    Running,
    Stopped,
    Failed,
}

/// Where the loader thread reads lines from
enum KeySource {
    File(PathBuf),
    Reader(Box<dyn BufRead + Send>),
}

impl KeySource {
    fn open(self) -> io::Result<Box<dyn BufRead + Send>> {
        match self {
            KeySource::File(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            KeySource::Reader(reader) => Ok(reader),
        }
    }
}

/// Handle on the single producer feeding a [`KeyBuffer`]
pub struct KeyLoader {
    source_path: PathBuf,
    source: Option<KeySource>,
    buffer: KeyBuffer,
    idle_backoff: Duration,
    shared: Arc<LoaderShared>,
    handle: Option<JoinHandle<()>>,
}

struct LoaderShared {
    running: AtomicBool,
    state: Mutex<LoaderState>,
    tokens_loaded: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl KeyLoader {
    /// Loader tailing the file at `source_path`
    pub fn new(source_path: impl Into<PathBuf>, buffer: KeyBuffer, idle_backoff: Duration) -> Self {
        let source_path = source_path.into();
        let source = KeySource::File(source_path.clone());
        Self::with_source(source_path, source, buffer, idle_backoff)
    }

    /// Loader tailing an already opened stream; `label` names it in logs
    pub fn with_reader(
        label: impl Into<PathBuf>,
        reader: impl BufRead + Send + 'static,
        buffer: KeyBuffer,
        idle_backoff: Duration,
    ) -> Self {
        let source = KeySource::Reader(Box::new(reader));
        Self::with_source(label.into(), source, buffer, idle_backoff)
    }

    fn with_source(
        source_path: PathBuf,
        source: KeySource,
        buffer: KeyBuffer,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            source_path,
            source: Some(source),
            buffer,
            idle_backoff,
            shared: Arc::new(LoaderShared {
                running: AtomicBool::new(false),
                state: Mutex::new(LoaderState::Idle),
                tokens_loaded: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            handle: None,
        }
    }

    /// Launch the background thread
    pub fn start(&mut self) -> Result<()> {
        let source = {
            let mut state = self.shared.state.lock();
            let source = match (*state, self.source.take()) {
                (LoaderState::Idle, Some(source)) => source,
                (current, _) => {
                    return Err(Error::InvalidState(format!(
                        "loader cannot be started from state {:?}",
                        current
                    )))
                }
            };
            *state = LoaderState::Running;
            source
        };
        self.shared.running.store(true, Ordering::SeqCst);

        let worker = TailWorker {
            source_path: self.source_path.clone(),
            buffer: self.buffer.clone(),
            idle_backoff: self.idle_backoff,
            shared: Arc::clone(&self.shared),
        };

        let spawned = thread::Builder::new()
            .name("key-loader".to_string())
            .spawn(move || worker.run(source));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                *self.shared.state.lock() = LoaderState::Failed;
                Err(Error::Io(e))
            }
        }
    }

    /// Ask the loader to finish and wait at most `timeout` for it
    ///
    /// Returns `true` if the thread exited within the bound. A thread that
    /// does not exit in time is detached; it still observes the cleared
    /// running flag on its next poll.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.shared.running.store(false, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            let mut state = self.shared.state.lock();
            if *state == LoaderState::Idle {
                *state = LoaderState::Stopped;
            }
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Key loader did not exit within {:?}, detaching it",
                    timeout
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1).min(self.idle_backoff));
        }

        if handle.join().is_err() {
            error!("Key loader thread panicked");
            *self.shared.state.lock() = LoaderState::Failed;
        }
        true
    }

    pub fn state(&self) -> LoaderState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of tokens pushed into the buffer so far
    pub fn tokens_loaded(&self) -> u64 {
        self.shared.tokens_loaded.load(Ordering::Relaxed)
    }

    /// Description of the I/O failure that ended the loader, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }
}

impl Drop for KeyLoader {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// State moved onto the loader thread
struct TailWorker {
    source_path: PathBuf,
    buffer: KeyBuffer,
    idle_backoff: Duration,
    shared: Arc<LoaderShared>,
}

impl TailWorker {
    fn run(self, source: KeySource) {
        info!("Key loader reading {}", self.source_path.display());

        match self.tail(source) {
            Ok(()) => {
                *self.shared.state.lock() = LoaderState::Stopped;
                info!(
                    "Key loader stopped after {} tokens",
                    self.shared.tokens_loaded.load(Ordering::Relaxed)
                );
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                *self.shared.last_error.lock() = Some(e.to_string());
                *self.shared.state.lock() = LoaderState::Failed;
                error!(
                    "Key loader failed on {}: {}",
                    self.source_path.display(),
                    e
                );
            }
        }
    }

    fn tail(&self, source: KeySource) -> Result<()> {
        let mut reader = source.open()?;
        let mut line = Vec::new();

        while self.shared.running.load(Ordering::SeqCst) {
            let read = reader.read_until(b'\n', &mut line)?;

            if read == 0 || line.last() != Some(&b'\n') {
                // Nothing new, or the writer is mid-line; keep what we have
                thread::sleep(self.idle_backoff);
                continue;
            }

            let token = {
                let text = String::from_utf8_lossy(&line);
                if matches!(text, Cow::Owned(_)) {
                    warn!("Key source line is not valid UTF-8, replacing invalid bytes");
                }
                text.trim_end_matches(['\n', '\r']).to_string()
            };
            line.clear();

            if token.is_empty() {
                debug!("Skipping blank line in key source");
            } else if !self.offer(token) {
                break;
            }
        }

        Ok(())
    }

    /// Push a token, re-checking the running flag while the buffer is full
    fn offer(&self, mut token: String) -> bool {
        loop {
            match self.buffer.push_timeout(token, self.idle_backoff) {
                Ok(()) => {
                    self.shared.tokens_loaded.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(rejected) => {
                    if !self.shared.running.load(Ordering::SeqCst) {
                        return false;
                    }
                    token = rejected;
                }
            }
        }
    }
}
