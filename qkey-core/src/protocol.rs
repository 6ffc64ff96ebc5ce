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

//! Wire types exchanged between the key gateway and its clients

use crate::{
    buffer::WatermarkLevel, context::ContextStatus, loader::LoaderState, record::KeyRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A key as served over HTTP
///
/// Ids are never negative for real keys; `-1` marks the absent key returned
/// alongside a 404.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResponse {
    pub id: i64,
    pub key: String,
}

impl KeyResponse {
    pub const INVALID_ID: i64 = -1;

    pub fn invalid() -> Self {
        Self {
            id: Self::INVALID_ID,
            key: String::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id >= 0
    }
}

impl From<KeyRecord> for KeyResponse {
    fn from(record: KeyRecord) -> Self {
        Self {
            id: record.id() as i64,
            key: record.into_token(),
        }
    }
}

/// Health status for system monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Derive health from a context snapshot
    ///
    /// A failed loader or an empty buffer still serves keys, but repeats the
    /// last one, so both count as degraded.
    pub fn assess(status: &ContextStatus) -> Self {
        if !status.running {
            HealthStatus::Unhealthy
        } else if status.loader_failed() || status.is_stale() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Gateway status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Overall health status
    pub status: HealthStatus,

    /// Identifier of the current context session; ids restart with each session
    pub session_id: Option<Uuid>,

    pub started_at: Option<DateTime<Utc>>,

    pub loader_state: Option<LoaderState>,

    /// Keys waiting in the buffer
    pub buffered_keys: usize,

    /// Buffer fill percentage (0-100)
    pub buffer_fill_percent: f64,

    /// Tokens read from the key source this session
    pub tokens_loaded: u64,

    /// Keys dispensed this session
    pub keys_dispensed: u64,

    /// Served keys still available for retrieval
    pub records_retained: usize,

    /// Served keys dropped by the retention policy
    pub records_evicted: u64,

    /// Service uptime in seconds
    pub uptime_seconds: u64,

    /// Total successful key requests
    pub total_requests_served: u64,

    pub requests_per_second: f64,

    /// Any warnings or issues
    pub warnings: Vec<String>,
}

impl GatewayStatus {
    pub fn from_context(
        status: &ContextStatus,
        uptime_seconds: u64,
        total_requests_served: u64,
        requests_per_second: f64,
    ) -> Self {
        let mut warnings = Vec::new();
        if !status.running {
            warnings.push("Key context is not running".to_string());
        }
        if let Some(error) = &status.loader_error {
            warnings.push(format!("Key loader failed: {}", error));
        }
        if status.is_stale() {
            warnings.push("Key buffer empty, repeating the last key".to_string());
        } else if status.buffer_watermark == Some(WatermarkLevel::Low) {
            warnings.push(format!(
                "Key buffer low ({:.1}%)",
                status.buffer_fill_percent
            ));
        }

        Self {
            status: HealthStatus::assess(status),
            session_id: status.session_id,
            started_at: status.started_at,
            loader_state: status.loader_state,
            buffered_keys: status.buffered_keys,
            buffer_fill_percent: status.buffer_fill_percent,
            tokens_loaded: status.tokens_loaded,
            keys_dispensed: status.keys_dispensed,
            records_retained: status.records_retained,
            records_evicted: status.records_evicted,
            uptime_seconds,
            total_requests_served,
            requests_per_second,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn running_status(buffered: usize, loader: LoaderState) -> ContextStatus {
        let buffer_fill_percent = buffered as f64 / 20.0 * 100.0;
        ContextStatus {
            running: true,
            session_id: Some(Uuid::new_v4()),
            started_at: Some(Utc::now()),
            source_path: PathBuf::from("keys.txt"),
            loader_state: Some(loader),
            loader_error: (loader == LoaderState::Failed).then(|| "I/O error: gone".to_string()),
            tokens_loaded: 10,
            buffered_keys: buffered,
            buffer_capacity: 20,
            buffer_fill_percent,
            buffer_watermark: Some(if buffer_fill_percent < 10.0 {
                WatermarkLevel::Low
            } else {
                WatermarkLevel::Medium
            }),
            tokens_consumed: 5,
            keys_dispensed: 4,
            records_retained: 4,
            records_evicted: 0,
        }
    }

    #[test]
    fn test_key_response_json() {
        let response = KeyResponse::from(KeyRecord::new(7, "0101".to_string()));
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"id":7,"key":"0101"}"#);
        assert!(response.is_valid());
    }

    #[test]
    fn test_invalid_key() {
        let invalid = KeyResponse::invalid();
        assert_eq!(invalid.id, -1);
        assert!(!invalid.is_valid());
    }

    #[test]
    fn test_health_assessment() {
        assert_eq!(
            HealthStatus::assess(&running_status(5, LoaderState::Running)),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::assess(&running_status(0, LoaderState::Running)),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::assess(&running_status(5, LoaderState::Failed)),
            HealthStatus::Degraded
        );

        let mut stopped = running_status(0, LoaderState::Stopped);
        stopped.running = false;
        assert_eq!(HealthStatus::assess(&stopped), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_gateway_status_warnings() {
        let status = GatewayStatus::from_context(&running_status(0, LoaderState::Failed), 60, 4, 0.1);
        assert_eq!(status.status, HealthStatus::Degraded);
        assert_eq!(status.warnings.len(), 2);
        assert_eq!(status.buffer_fill_percent, 0.0);

        let status = GatewayStatus::from_context(&running_status(5, LoaderState::Running), 60, 4, 0.1);
        assert!(status.warnings.is_empty());
        assert_eq!(status.buffer_fill_percent, 25.0);

        let status = GatewayStatus::from_context(&running_status(1, LoaderState::Running), 60, 4, 0.1);
        assert_eq!(status.status, HealthStatus::Healthy);
        assert_eq!(status.warnings, vec!["Key buffer low (5.0%)".to_string()]);
    }
}
