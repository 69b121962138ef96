//! Notification sinks.
//!
//! A notifier is constructed from its configured type tag and options map,
//! and delivers on a best-effort basis: failures are logged by the engine
//! and never retried. New variants are added to [`build_notifier`] only.

pub mod hipchat;
pub mod stderr;
pub mod teams;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use super::Notification;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &Notification) -> Result<(), NotifierError>;
}

/// Creates a notifier from its configured type tag and options map.
pub fn build_notifier(
    kind: &str,
    name: &str,
    options: &Value,
    web_root: &str,
) -> Result<Arc<dyn Notifier>, ConfigError> {
    match kind {
        "stderr" => Ok(Arc::new(stderr::StderrNotifier::new(name))),
        "hipchat" => Ok(Arc::new(hipchat::HipchatNotifier::from_options(
            name, options, web_root,
        )?)),
        "teams" => Ok(Arc::new(teams::TeamsNotifier::from_options(
            name, options, web_root,
        )?)),
        other => Err(ConfigError::UnknownNotifierType(other.to_string())),
    }
}

pub(crate) fn required_string_option(
    kind: &str,
    name: &str,
    options: &Value,
    key: &str,
) -> Result<String, ConfigError> {
    options
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidNotifierOptions {
            name: name.to_string(),
            reason: format!("{kind} notifier requires a {key} option"),
        })
}

/// The dashboard link included in outbound notifications.
pub(crate) fn dashboard_url(web_root: &str, n: &Notification) -> String {
    format!(
        "{}/app/{}/{}/",
        web_root.trim_end_matches('/'),
        n.app_key,
        n.endpoint_key
    )
}

/// The error lines of every failed validator, as (validator, message) pairs.
pub(crate) fn failure_lines(n: &Notification) -> Vec<(String, String)> {
    let mut lines = Vec::new();
    for vr in &n.result.validation_results {
        if vr.valid {
            continue;
        }
        for error in &vr.errors {
            lines.push((vr.name.clone(), error.clone()));
        }
    }
    lines
}
