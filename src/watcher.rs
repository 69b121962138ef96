//! Hot reload: watches the application config directory and swaps
//! individual application monitors on create/modify/delete.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{build_application, Configuration};
use crate::store::results::ResultStore;
use crate::supervisor::Supervisor;

/// Starts watching the config directory. The returned watcher must be kept
/// alive for the duration of the process.
pub fn start_config_watcher(
    config: Arc<Configuration>,
    supervisor: Arc<Supervisor>,
    store: ResultStore,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    debug!("starting config directory file watcher");
    let (tx, mut rx) = mpsc::channel::<Event>(16);
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => error!(error = %e, "file watcher error"),
        }
    })?;
    watcher.watch(&config.app_config_dir, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for path in &event.paths {
                match event.kind {
                    EventKind::Create(_) => {
                        handle_create(&config, &supervisor, &store, path).await
                    }
                    EventKind::Modify(_) => {
                        handle_modify(&config, &supervisor, &store, path).await
                    }
                    EventKind::Remove(_) => handle_remove(&supervisor, path).await,
                    _ => {}
                }
            }
        }
    });

    Ok(watcher)
}

fn is_app_config(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "yaml")
}

pub(crate) async fn handle_create(
    config: &Configuration,
    supervisor: &Supervisor,
    store: &ResultStore,
    path: &Path,
) {
    if !is_app_config(path) {
        return;
    }
    debug!(file = %path.display(), "new config file found, attempting to load");
    let app = match build_application(config, path, store).await {
        Ok(app) => app,
        Err(e) => {
            error!(file = %path.display(), error = %e,
                   "unable to load configuration from new file");
            return;
        }
    };
    match supervisor.insert(app.clone()).await {
        Ok(()) => supervisor.start_monitor(app).await,
        Err(e) => error!(file = %path.display(), error = %e, "ignoring new config file"),
    }
}

pub(crate) async fn handle_modify(
    config: &Configuration,
    supervisor: &Supervisor,
    store: &ResultStore,
    path: &Path,
) {
    if !is_app_config(path) {
        return;
    }
    let Some(existing) = supervisor.application_by_file(path).await else {
        // Modified but never loaded: treat as a new file.
        handle_create(config, supervisor, store, path).await;
        return;
    };

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) => {
            error!(file = %path.display(), error = %e,
                   "error accessing file information");
            return;
        }
    };
    if existing.last_modified == Some(modified) {
        info!(file = %path.display(),
              "ignoring change notification, file modification time is unchanged");
        return;
    }

    match build_application(config, path, store).await {
        Ok(replacement) => {
            info!(app = %replacement.key, file = %path.display(),
                  "reloading application configuration");
            supervisor.replace(replacement).await;
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e,
                  "unable to reload configuration, keeping previous application");
        }
    }
}

pub(crate) async fn handle_remove(supervisor: &Supervisor, path: &Path) {
    supervisor.remove_by_file(path).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::Fetcher;
    use crate::store::bodies::BodyStoreCache;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const APP_YAML: &str = r#"
Key: shop
Name: Shop
Endpoints:
  - Key: orders
    Name: Orders
    URL: http://example.com/orders
    CheckInterval: 5
"#;

    struct Fixture {
        dir: TempDir,
        config: Configuration,
        store: ResultStore,
        supervisor: Arc<Supervisor>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(&dir.path().join("feedmon.db")).unwrap();
        let config = Configuration {
            log_level: "warn".into(),
            log_file: String::new(),
            git_root: dir.path().join("git"),
            web_port: 8080,
            web_root: String::new(),
            app_config_dir: dir.path().join("apps"),
            web_dev_mode: false,
        };
        fs::create_dir_all(&config.app_config_dir).unwrap();
        let (rtx, _rrx) = mpsc::channel(100);
        let (ntx, _nrx) = mpsc::channel(100);
        let fetcher = Fetcher::new(BodyStoreCache::new(dir.path()), rtx, ntx).unwrap();
        let supervisor = Arc::new(Supervisor::new(CancellationToken::new(), fetcher));
        Fixture {
            dir,
            config,
            store,
            supervisor,
        }
    }

    #[tokio::test]
    async fn create_loads_and_starts_new_applications() {
        let f = fixture();
        let path = f.config.app_config_dir.join("shop.yaml");
        fs::write(&path, APP_YAML).unwrap();

        handle_create(&f.config, &f.supervisor, &f.store, &path).await;
        assert!(f.supervisor.get_application("shop").await.is_some());

        // A second file reusing the key is rejected.
        let dup = f.config.app_config_dir.join("dup.yaml");
        fs::write(&dup, APP_YAML).unwrap();
        handle_create(&f.config, &f.supervisor, &f.store, &dup).await;
        assert_eq!(f.supervisor.applications().await.len(), 1);

        // Non-yaml paths are ignored entirely.
        let other = f.dir.path().join("notes.txt");
        fs::write(&other, "x").unwrap();
        handle_create(&f.config, &f.supervisor, &f.store, &other).await;
        assert_eq!(f.supervisor.applications().await.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_mtime_is_debounced() {
        let f = fixture();
        let path = f.config.app_config_dir.join("shop.yaml");
        fs::write(&path, APP_YAML).unwrap();
        handle_create(&f.config, &f.supervisor, &f.store, &path).await;
        let before = f.supervisor.get_application("shop").await.unwrap();

        handle_modify(&f.config, &f.supervisor, &f.store, &path).await;
        let after = f.supervisor.get_application("shop").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(!before.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn genuine_modify_replaces_the_application() {
        let f = fixture();
        let path = f.config.app_config_dir.join("shop.yaml");
        fs::write(&path, APP_YAML).unwrap();
        handle_create(&f.config, &f.supervisor, &f.store, &path).await;
        let before = f.supervisor.get_application("shop").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(&path, APP_YAML.replace("Name: Shop", "Name: Shop v2")).unwrap();
        handle_modify(&f.config, &f.supervisor, &f.store, &path).await;

        let after = f.supervisor.get_application("shop").await.unwrap();
        assert_eq!(after.name, "Shop v2");
        assert!(before.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn broken_modify_keeps_the_previous_application() {
        let f = fixture();
        let path = f.config.app_config_dir.join("shop.yaml");
        fs::write(&path, APP_YAML).unwrap();
        handle_create(&f.config, &f.supervisor, &f.store, &path).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(&path, "Key: [broken\n").unwrap();
        handle_modify(&f.config, &f.supervisor, &f.store, &path).await;

        let app = f.supervisor.get_application("shop").await.unwrap();
        assert_eq!(app.name, "Shop");
        assert!(!app.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn remove_stops_and_forgets_the_application() {
        let f = fixture();
        let path = f.config.app_config_dir.join("shop.yaml");
        fs::write(&path, APP_YAML).unwrap();
        handle_create(&f.config, &f.supervisor, &f.store, &path).await;
        let app = f.supervisor.get_application("shop").await.unwrap();

        handle_remove(&f.supervisor, &path).await;
        assert!(app.cancel.is_cancelled());
        assert!(f.supervisor.get_application("shop").await.is_none());
    }

    #[tokio::test]
    async fn modify_of_unknown_file_is_treated_as_create() {
        let f = fixture();
        let path = f.config.app_config_dir.join("shop.yaml");
        fs::write(&path, APP_YAML).unwrap();

        handle_modify(&f.config, &f.supervisor, &f.store, &path).await;
        assert!(f.supervisor.get_application("shop").await.is_some());
    }
}
