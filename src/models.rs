//! Persisted record types shared by the fetcher, the stores and the UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The outcome of checking one concrete URL of an endpoint.
///
/// The body bytes are carried in memory for the duration of the fetch
/// (validators and the body store need them) but are never part of the
/// serialized record; only the body-store version identifier is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointResult {
    pub app_key: String,
    pub endpoint_key: String,
    pub url: String,
    pub check_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub size: i64,
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(skip)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub body_version: String,
    #[serde(default)]
    pub body_changed: bool,
    pub validation_results: Vec<ValidationResult>,
}

impl EndpointResult {
    /// True only if every validator in the chain reported valid.
    pub fn valid(&self) -> bool {
        self.validation_results.iter().all(|vr| vr.valid)
    }

    /// A copy without the in-memory body, for handing to the channels.
    pub fn without_body(&self) -> EndpointResult {
        let mut er = self.clone();
        er.body = Vec::new();
        er
    }
}

/// The result of running a single validator against an [`EndpointResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub name: String,
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new(name: &str) -> Self {
        ValidationResult {
            name: name.to_string(),
            valid: false,
            errors: Vec::new(),
        }
    }
}

/// The value of a performance log entry. Duration is in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub duration: i64,
    pub size: i64,
}

/// A performance entry joined with its time key, as returned by reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub check_time: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: PerformanceEntry,
}
