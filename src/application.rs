//! Applications and endpoints: the configured, mutable monitoring state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::models::ValidationResult;
use crate::notifications::senders::Notifier;
use crate::validators::Validator;

/// Aggregate validity of an endpoint's most recent check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Unknown,
    Ok,
    Fail,
}

/// One monitored HTTP resource. For dynamic endpoints `url` is a template
/// and `current_urls` holds its most recent expansion.
pub struct Endpoint {
    pub key: String,
    pub name: String,
    pub url: String,
    pub method: String,
    pub request_body: String,
    pub headers: HashMap<String, String>,
    pub dynamic: bool,
    pub ignore_redirects: bool,
    pub check_interval: Duration,
    pub validators: Vec<Arc<dyn Validator>>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub current_urls: Vec<String>,
    pub current_status: EndpointStatus,
    pub current_validation: Vec<ValidationResult>,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: DateTime<Utc>,
}

impl Endpoint {
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_check
    }

    /// Advances the schedule before work is dispatched, so a slow fetch
    /// never re-fires on the next tick. Nominal slots step by the interval;
    /// after a stall the next slot clamps to `now` rather than accumulating
    /// backlog.
    pub fn advance_schedule(&mut self, now: DateTime<Utc>) {
        match self.last_check {
            None => {
                self.last_check = Some(now);
                self.next_check = now + self.check_interval;
            }
            Some(_) => {
                let last = self.next_check;
                self.last_check = Some(last);
                self.next_check = last + self.check_interval;
                if self.next_check < now {
                    self.next_check = now;
                }
            }
        }
    }

    /// An immutable copy of the fields the fetcher needs, so no lock is
    /// held across HTTP I/O for static endpoints.
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            key: self.key.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            request_body: self.request_body.clone(),
            headers: self.headers.clone(),
            dynamic: self.dynamic,
            ignore_redirects: self.ignore_redirects,
            validators: self.validators.clone(),
            notifiers: self.notifiers.clone(),
        }
    }
}

/// The fetch-relevant view of an endpoint at dispatch time.
#[derive(Clone)]
pub struct EndpointSnapshot {
    pub key: String,
    pub name: String,
    pub url: String,
    pub method: String,
    pub request_body: String,
    pub headers: HashMap<String, String>,
    pub dynamic: bool,
    pub ignore_redirects: bool,
    pub validators: Vec<Arc<dyn Validator>>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
}

/// A named bundle of endpoints loaded from one configuration file.
///
/// The endpoint set and per-endpoint mutable fields are guarded by one
/// read/write lock: monitors iterate under shared mode, hot reload and
/// dynamic dispatch take exclusive mode, the UI reads shared. The
/// cancellation token is the shutdown latch observed by the monitor.
pub struct Application {
    pub key: String,
    pub name: String,
    pub file_name: PathBuf,
    pub last_modified: Option<SystemTime>,
    pub cancel: CancellationToken,
    pub endpoints: RwLock<Vec<Endpoint>>,
}

impl Application {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn endpoint_snapshot(&self, key: &str) -> Option<EndpointSnapshot> {
        self.endpoints
            .read()
            .await
            .iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .map(Endpoint::snapshot)
    }
}
