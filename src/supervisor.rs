//! The supervisor owns the process-wide application list and the lifecycle
//! of every application monitor. Monitors never hold references back into
//! the list; hot reload swaps an application atomically under the list
//! lock and signals the old monitor through its cancellation token.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::Application;
use crate::expander::expand_urls;
use crate::fetcher::Fetcher;

pub struct Supervisor {
    primary: CancellationToken,
    fetcher: Fetcher,
    apps: RwLock<Vec<Arc<Application>>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(primary: CancellationToken, fetcher: Fetcher) -> Supervisor {
        Supervisor {
            primary,
            fetcher,
            apps: RwLock::new(Vec::new()),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn applications(&self) -> Vec<Arc<Application>> {
        self.apps.read().await.clone()
    }

    pub async fn get_application(&self, key: &str) -> Option<Arc<Application>> {
        self.apps
            .read()
            .await
            .iter()
            .find(|a| a.key.eq_ignore_ascii_case(key))
            .cloned()
    }

    pub async fn application_by_file(&self, file: &Path) -> Option<Arc<Application>> {
        self.apps
            .read()
            .await
            .iter()
            .find(|a| a.file_name == file)
            .cloned()
    }

    /// Appends a new application. Fails when the key is already in use.
    pub async fn insert(&self, app: Arc<Application>) -> Result<(), crate::config::ConfigError> {
        let mut apps = self.apps.write().await;
        if apps.iter().any(|a| a.key.eq_ignore_ascii_case(&app.key)) {
            return Err(crate::config::ConfigError::DuplicateApplication(
                app.key.clone(),
            ));
        }
        apps.push(app);
        Ok(())
    }

    /// Seeds the list at startup, before any monitor runs.
    pub async fn install_all(&self, apps: Vec<Arc<Application>>) {
        *self.apps.write().await = apps;
    }

    /// Starts a monitor for every installed application.
    pub async fn start_all(&self) {
        let apps = self.applications().await;
        for app in apps {
            self.start_monitor(app).await;
        }
    }

    pub async fn start_monitor(&self, app: Arc<Application>) {
        info!(app = %app.key, "starting feed monitor");
        let handle = tokio::spawn(run_monitor(
            app.clone(),
            self.fetcher.clone(),
            self.primary.clone(),
        ));
        if let Some(old) = self.monitors.lock().await.insert(app.key.clone(), handle) {
            drop(old);
        }
    }

    /// Stops the old application's monitor, swaps in the replacement under
    /// the exclusive list lock, and starts its monitor.
    pub async fn replace(&self, replacement: Arc<Application>) {
        {
            let mut apps = self.apps.write().await;
            if let Some(slot) = apps
                .iter_mut()
                .find(|a| a.file_name == replacement.file_name)
            {
                slot.stop();
                *slot = replacement.clone();
            } else {
                apps.push(replacement.clone());
            }
        }
        self.start_monitor(replacement).await;
    }

    /// Stops and removes the application loaded from `file`, if any.
    pub async fn remove_by_file(&self, file: &Path) -> bool {
        let removed = {
            let mut apps = self.apps.write().await;
            match apps.iter().position(|a| a.file_name == file) {
                Some(index) => Some(apps.remove(index)),
                None => None,
            }
        };
        match removed {
            Some(app) => {
                app.stop();
                self.monitors.lock().await.remove(&app.key);
                info!(app = %app.key, "removed application");
                true
            }
            None => false,
        }
    }

    /// Signals every monitor to stop.
    pub async fn stop_all(&self) {
        for app in self.applications().await {
            app.stop();
        }
    }

    /// Waits for all monitors to finish, up to `timeout`. Returns true when
    /// the wait timed out.
    pub async fn wait_monitors(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let handles: Vec<JoinHandle<()>> = self
            .monitors
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                return true;
            }
        }
        false
    }
}

/// The 1 Hz scheduling loop for one application.
async fn run_monitor(app: Arc<Application>, fetcher: Fetcher, primary: CancellationToken) {
    debug!(app = %app.key, "started feed checker");
    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_secs(1),
        Duration::from_secs(1),
    );
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = app.cancel.cancelled() => break,
            _ = primary.cancelled() => break,
            _ = tick.tick() => {}
        }
        run_tick(&app, &fetcher).await;
        if app.cancel.is_cancelled() {
            break;
        }
    }
    debug!(app = %app.key, "shutting down feed checker");
}

/// One scheduling pass over the application's endpoints, in declared
/// order. The data context lives for exactly this tick; dynamic endpoints
/// see only the contexts of endpoints checked earlier in the same tick.
pub(crate) async fn run_tick(app: &Application, fetcher: &Fetcher) {
    let mut data: HashMap<String, Value> = HashMap::new();
    let count = app.endpoints.read().await.len();
    for index in 0..count {
        if app.cancel.is_cancelled() {
            return;
        }

        let now = Utc::now();
        let dynamic = {
            let endpoints = app.endpoints.read().await;
            match endpoints.get(index) {
                Some(e) if e.due(now) => e.dynamic,
                _ => continue,
            }
        };

        if dynamic {
            // Exclusive across expansion and dispatch: the tick context is
            // mutated and the endpoint's expansion list is rewritten.
            let mut endpoints = app.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(index) else {
                continue;
            };
            if !endpoint.due(Utc::now()) {
                continue;
            }
            endpoint.advance_schedule(Utc::now());
            let urls = match expand_urls(&endpoint.url, &data) {
                Ok(urls) => urls,
                Err(e) => {
                    error!(app = %app.key, endpoint = %endpoint.key, url = %endpoint.url,
                           error = %e, "error expanding dynamic URL template");
                    Vec::new()
                }
            };
            if urls.is_empty() {
                warn!(app = %app.key, endpoint = %endpoint.key,
                      "dynamic endpoint produced no URLs to query");
            }
            endpoint.current_urls = urls.clone();
            let snapshot = endpoint.snapshot();
            for url in &urls {
                let outcome = tokio::select! {
                    _ = app.cancel.cancelled() => return,
                    outcome = fetcher.fetch_endpoint(&app.key, &app.name, &snapshot, url, &data) => outcome,
                };
                if let Some(outcome) = outcome {
                    endpoint.current_status = outcome.status;
                    endpoint.current_validation = outcome.validation;
                    data.insert(snapshot.key.clone(), outcome.context);
                }
            }
        } else {
            // Advance the schedule first so slow fetches never re-fire on
            // the next tick, then fetch without holding the lock.
            let snapshot = {
                let mut endpoints = app.endpoints.write().await;
                let Some(endpoint) = endpoints.get_mut(index) else {
                    continue;
                };
                if !endpoint.due(Utc::now()) {
                    continue;
                }
                endpoint.advance_schedule(Utc::now());
                endpoint.snapshot()
            };
            let outcome = tokio::select! {
                _ = app.cancel.cancelled() => return,
                outcome = fetcher.fetch_endpoint(&app.key, &app.name, &snapshot, &snapshot.url, &data) => outcome,
            };
            if let Some(outcome) = outcome {
                let mut endpoints = app.endpoints.write().await;
                if let Some(endpoint) = endpoints.get_mut(index) {
                    endpoint.current_status = outcome.status;
                    endpoint.current_validation = outcome.validation;
                }
                data.insert(snapshot.key, outcome.context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{Endpoint, EndpointStatus};
    use crate::models::EndpointResult;
    use crate::notifications::Notification;
    use crate::store::bodies::BodyStoreCache;
    use crate::validators::build_validator;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn app_with(endpoints: Vec<Endpoint>) -> Arc<Application> {
        Arc::new(Application {
            key: "app".into(),
            name: "App".into(),
            file_name: "app.yaml".into(),
            last_modified: None,
            cancel: CancellationToken::new(),
            endpoints: tokio::sync::RwLock::new(endpoints),
        })
    }

    fn endpoint(key: &str, url: &str, dynamic: bool) -> Endpoint {
        Endpoint {
            key: key.into(),
            name: key.to_uppercase(),
            url: url.into(),
            method: "GET".into(),
            request_body: String::new(),
            headers: HashMap::new(),
            dynamic,
            ignore_redirects: false,
            check_interval: ChronoDuration::minutes(1),
            validators: vec![build_validator("JSON", "json", &json!(null)).unwrap()],
            notifiers: Vec::new(),
            current_urls: Vec::new(),
            current_status: EndpointStatus::Unknown,
            current_validation: Vec::new(),
            last_check: None,
            next_check: Utc::now(),
        }
    }

    struct TestHarness {
        _dir: TempDir,
        fetcher: Fetcher,
        _results: mpsc::Receiver<EndpointResult>,
        _notifications: mpsc::Receiver<Notification>,
    }

    fn fetcher() -> TestHarness {
        let dir = TempDir::new().unwrap();
        let (rtx, rrx) = mpsc::channel(100);
        let (ntx, nrx) = mpsc::channel(100);
        TestHarness {
            fetcher: Fetcher::new(BodyStoreCache::new(dir.path()), rtx, ntx).unwrap(),
            _dir: dir,
            _results: rrx,
            _notifications: nrx,
        }
    }

    /// A canned HTTP server that records the order of requested paths.
    async fn serve_paths(
        responses: HashMap<String, String>,
    ) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                log.lock().unwrap().push(path.clone());
                let body = responses.get(&path).cloned().unwrap_or_else(|| "{}".into());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn dynamic_endpoint_expands_within_one_tick_in_array_order() {
        let mut responses = HashMap::new();
        responses.insert(
            "/feed-a".to_string(),
            r#"{"ids":[{"id":"x"},{"id":"y"}]}"#.to_string(),
        );
        responses.insert("/item/x".to_string(), "{}".to_string());
        responses.insert("/item/y".to_string(), "{}".to_string());
        let (base, seen) = serve_paths(responses).await;

        let template = format!(
            "{{% for item in a.data.ids %}}{base}/item/{{{{ item.id }}}}|||{{% endfor %}}"
        );
        let app = app_with(vec![
            endpoint("a", &format!("{base}/feed-a"), false),
            endpoint("b", &template, true),
        ]);
        let h = fetcher();

        run_tick(&app, &h.fetcher).await;

        let paths = seen.lock().unwrap().clone();
        assert_eq!(paths, vec!["/feed-a", "/item/x", "/item/y"]);

        let endpoints = app.endpoints.read().await;
        assert_eq!(endpoints[0].current_status, EndpointStatus::Ok);
        assert_eq!(
            endpoints[1].current_urls,
            vec![format!("{base}/item/x"), format!("{base}/item/y")]
        );
    }

    #[tokio::test]
    async fn endpoints_not_yet_due_are_skipped() {
        let (base, seen) = serve_paths(HashMap::new()).await;
        let mut ep = endpoint("a", &format!("{base}/feed-a"), false);
        ep.next_check = Utc::now() + ChronoDuration::minutes(5);
        let app = app_with(vec![ep]);
        let h = fetcher();

        run_tick(&app, &h.fetcher).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expansion_failure_is_not_fatal_to_the_tick() {
        let (base, seen) = serve_paths(HashMap::new()).await;
        let app = app_with(vec![
            endpoint("bad", "{% for x in %}", true),
            endpoint("good", &format!("{base}/feed"), false),
        ]);
        let h = fetcher();

        run_tick(&app, &h.fetcher).await;
        // The broken template produced nothing; the next endpoint ran.
        assert_eq!(seen.lock().unwrap().clone(), vec!["/feed"]);
    }

    #[tokio::test]
    async fn cancelled_monitor_exits() {
        let app = app_with(Vec::new());
        let h = fetcher();
        let sup = Supervisor::new(CancellationToken::new(), h.fetcher.clone());
        sup.install_all(vec![app.clone()]).await;
        sup.start_all().await;

        sup.stop_all().await;
        assert!(!sup.wait_monitors(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected_case_insensitively() {
        let h = fetcher();
        let sup = Supervisor::new(CancellationToken::new(), h.fetcher.clone());
        sup.insert(app_with(Vec::new())).await.unwrap();

        let dup = Arc::new(Application {
            key: "APP".into(),
            name: "Other".into(),
            file_name: "other.yaml".into(),
            last_modified: None,
            cancel: CancellationToken::new(),
            endpoints: tokio::sync::RwLock::new(Vec::new()),
        });
        assert!(sup.insert(dup).await.is_err());
    }

    #[tokio::test]
    async fn replace_swaps_by_file_name() {
        let h = fetcher();
        let sup = Supervisor::new(CancellationToken::new(), h.fetcher.clone());
        let old = app_with(Vec::new());
        sup.insert(old.clone()).await.unwrap();

        let replacement = Arc::new(Application {
            key: "app".into(),
            name: "App v2".into(),
            file_name: "app.yaml".into(),
            last_modified: None,
            cancel: CancellationToken::new(),
            endpoints: tokio::sync::RwLock::new(Vec::new()),
        });
        sup.replace(replacement).await;

        assert!(old.cancel.is_cancelled());
        let current = sup.get_application("app").await.unwrap();
        assert_eq!(current.name, "App v2");
        assert_eq!(sup.applications().await.len(), 1);

        assert!(sup.remove_by_file(Path::new("app.yaml")).await);
        assert!(sup.get_application("app").await.is_none());
    }
}
