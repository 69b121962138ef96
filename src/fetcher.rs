//! The fetch pipeline: one HTTP round-trip against one concrete URL,
//! followed by validation, body-store persistence and channel fan-out.

use chrono::Utc;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::application::{EndpointSnapshot, EndpointStatus};
use crate::expander::render_template;
use crate::models::{EndpointResult, ValidationResult};
use crate::notifications::Notification;
use crate::store::bodies::BodyStoreCache;

/// What a completed fetch hands back to the monitor: the context entry to
/// publish under the endpoint key, plus the endpoint state to record.
pub struct FetchOutcome {
    pub context: Value,
    pub status: EndpointStatus,
    pub validation: Vec<ValidationResult>,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    client_no_redirect: Client,
    bodies: BodyStoreCache,
    results: mpsc::Sender<EndpointResult>,
    notifications: mpsc::Sender<Notification>,
}

impl Fetcher {
    pub fn new(
        bodies: BodyStoreCache,
        results: mpsc::Sender<EndpointResult>,
        notifications: mpsc::Sender<Notification>,
    ) -> Result<Fetcher, reqwest::Error> {
        Ok(Fetcher {
            client: Client::builder().build()?,
            client_no_redirect: Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()?,
            bodies,
            results,
            notifications,
        })
    }

    /// Fetches one URL of an endpoint. Transport errors are logged and
    /// yield `None`: no result, no notification, no context entry. The
    /// schedule was already advanced by the caller.
    pub async fn fetch_endpoint(
        &self,
        app_key: &str,
        app_name: &str,
        endpoint: &EndpointSnapshot,
        url: &str,
        data: &HashMap<String, Value>,
    ) -> Option<FetchOutcome> {
        debug!(app = app_key, endpoint = %endpoint.key, url, "fetching endpoint");

        let method = match Method::from_bytes(endpoint.method.as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                error!(endpoint = %endpoint.key, method = %endpoint.method, error = %e,
                       "invalid HTTP method");
                return None;
            }
        };

        let client = if endpoint.ignore_redirects {
            &self.client_no_redirect
        } else {
            &self.client
        };

        let mut request = client.request(method, url);
        for (name, value) in &endpoint.headers {
            let name = render_or_raw(name, data);
            let value = render_or_raw(value, data);
            request = request.header(name.as_str(), value.as_str());
        }
        if !endpoint.request_body.is_empty() {
            request = request.body(render_or_raw(&endpoint.request_body, data));
        }

        let check_time = Utc::now();
        let start = Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(endpoint = %endpoint.key, url, error = %e,
                      "error performing endpoint query");
                return None;
            }
        };
        let duration_ms = start.elapsed().as_millis() as i64;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let body = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                warn!(endpoint = %endpoint.key, url, error = %e,
                      "error reading response body");
                return None;
            }
        };

        let size = match content_length {
            Some(len) => len as i64,
            None => {
                debug!("no Content-Length set, defaulting to body length");
                body.len() as i64
            }
        };

        info!(endpoint = %endpoint.key, url, duration_ms, status, size,
              "fetched result");

        let mut er = EndpointResult {
            app_key: app_key.to_string(),
            endpoint_key: endpoint.key.clone(),
            url: url.to_string(),
            check_time,
            duration_ms,
            size,
            status,
            headers,
            body,
            body_version: String::new(),
            body_changed: false,
            validation_results: Vec::new(),
        };

        let mut result_data: Map<String, Value> = Map::new();
        let mut validation = Vec::new();
        for validator in &endpoint.validators {
            let (cont, res) = validator.validate(endpoint, &er, &mut result_data);
            if !res.valid {
                info!(validator = %res.name, errors = ?res.errors,
                      "validation failed");
            }
            validation.push(res);
            if !cont {
                break;
            }
        }
        er.validation_results = validation.clone();

        match self
            .bodies
            .open(app_key, &endpoint.key, url)
            .and_then(|store| store.update_feed(&er.body, &er.check_time))
        {
            Ok((version, changed)) => {
                er.body_version = version;
                er.body_changed = changed;
            }
            Err(e) => {
                error!(endpoint = %endpoint.key, url, error = %e,
                       "error updating body store");
            }
        }

        // The result is enqueued before its notification so the engine's
        // strictly-earlier predecessor query stays correct either way the
        // writer is scheduled.
        if let Err(e) = self.results.send(er.without_body()).await {
            warn!(error = %e, "result log channel closed");
        }
        let notification = Notification {
            app_key: app_key.to_string(),
            app_name: app_name.to_string(),
            endpoint_key: endpoint.key.clone(),
            endpoint_name: endpoint.name.clone(),
            notifiers: endpoint.notifiers.clone(),
            result: er.without_body(),
        };
        if let Err(e) = self.notifications.send(notification).await {
            warn!(error = %e, "notification channel closed");
        }

        let status = if er.valid() {
            EndpointStatus::Ok
        } else {
            EndpointStatus::Fail
        };
        let context = json!({
            "headers": er.headers,
            "data": result_data.get("data").cloned().unwrap_or(Value::Null),
        });

        Some(FetchOutcome {
            context,
            status,
            validation,
        })
    }
}

/// Renders a request header or body template; evaluation errors fall back
/// to the raw template text with a warning.
fn render_or_raw(template: &str, data: &HashMap<String, Value>) -> String {
    if !template.contains("{{") && !template.contains("{%") {
        return template.to_string();
    }
    match render_template(template, data) {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!(template, error = %e, "unable to render request template");
            template.to_string()
        }
    }
}
