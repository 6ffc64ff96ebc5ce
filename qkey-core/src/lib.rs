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

//! QKey Core Library
//!
//! This crate provides the key provisioning engine behind the QKey gateway.
//! A QKD device appends secret keys to a file; a background loader tails that
//! file into a bounded buffer, and a provisioning context hands keys out one at
//! a time while remembering every served key so it can be retrieved again by id.
//!
//! # Architecture
//!
//! - `buffer`: Bounded FIFO of key tokens shared by loader and context
//! - `loader`: Background thread tailing the key file into the buffer
//! - `record`: Served keys and the retention table that indexes them
//! - `context`: Lifecycle (configure/start/stop), dispense and retrieval
//! - `keylog`: Preprocessing of raw device key logs into one key per line
//! - `config`: Configuration management with validation
//! - `protocol`: Wire types shared by gateway and client
//! - `client`: HTTP client for the gateway's key endpoints
//! - `metrics`: Request counters and Prometheus text output
//! - `error`: Unified error types
//!
//! # Example
//!
//! ```no_run
//! use qkey_core::{ContextConfig, KeyContext};
//!
//! # fn main() -> qkey_core::Result<()> {
//! let context = KeyContext::new(ContextConfig::new("keyDB.txt"));
//! context.start()?;
//! let key = context.dispense()?;
//! assert_eq!(context.retrieve(key.id() as i64), Some(key));
//! context.stop();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod keylog;
pub mod loader;
pub mod metrics;
pub mod protocol;
pub mod record;
pub mod retry;

pub use config::{ContextConfig, GatewayConfig};
pub use context::{ContextStatus, KeyContext};
pub use error::{Error, Result};
pub use record::{KeyRecord, RetentionPolicy};

/// Library version for protocol compatibility
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of keys held ahead of dispensing
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Default key length, in bits, when chunking device key logs
pub const DEFAULT_CHUNK_WIDTH: usize = 767;
