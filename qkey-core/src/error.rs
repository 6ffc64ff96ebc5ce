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

//! Error types for the key provisioning system
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for key provisioning operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration missing, invalid, or supplied after start
    #[error("Configuration error: {0}")]
    Config(String),

    /// No key became available before the startup deadline
    #[error("No key became available within {0:?}; do not use this context")]
    StartupTimeout(Duration),

    /// Operation not permitted in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Network communication failed
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is transient and retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => !e.is_status() || e.status().is_some_and(|s| s.is_server_error()),
            Error::Timeout => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Error::Config(format!("Failed to parse environment variables: {}", e))
    }
}
