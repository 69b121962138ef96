//! Main and per-application configuration.
//!
//! All YAML parsing is strict: unknown keys fail the file so typos surface
//! at load time instead of at the next tick. Per-application files are
//! skippable errors; the main configuration is fatal.

use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::application::{Application, Endpoint, EndpointStatus};
use crate::notifications::senders::{build_notifier, Notifier};
use crate::store::results::ResultStore;
use crate::validators::{build_validator, Validator};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unknown validator type {0}")]
    UnknownValidatorType(String),
    #[error("unknown notifier type {0}")]
    UnknownNotifierType(String),
    #[error("invalid options for validator {name}: {reason}")]
    InvalidValidatorOptions { name: String, reason: String },
    #[error("invalid options for notifier {name}: {reason}")]
    InvalidNotifierOptions { name: String, reason: String },
    #[error("endpoint {endpoint} references unknown validator {reference}")]
    DanglingValidator { endpoint: String, reference: String },
    #[error("endpoint {endpoint} references unknown notifier {reference}")]
    DanglingNotifier { endpoint: String, reference: String },
    #[error("application key {0} is already in use")]
    DuplicateApplication(String),
}

/// The process-wide configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Configuration {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: String,
    pub git_root: PathBuf,
    pub web_port: u16,
    #[serde(default)]
    pub web_root: String,
    pub app_config_dir: PathBuf,
    #[serde(skip)]
    pub web_dev_mode: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// One application definition file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ApplicationConfig {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
    #[serde(default)]
    pub notifiers: Vec<NotifierConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct EndpointConfig {
    pub key: String,
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub ignore_redirects: bool,
    /// Minutes between checks.
    #[serde(default)]
    pub check_interval: i64,
    #[serde(default)]
    pub notifiers: Vec<String>,
    #[serde(default)]
    pub validators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ValidatorConfig {
    pub key: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct NotifierConfig {
    pub key: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Loads and strictly parses the main configuration file.
pub fn load_main_config(path: &Path) -> Result<Configuration, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds an [`Application`] from one definition file: strict parse,
/// validator/notifier construction with `Default: true` inheritance, and
/// schedule seeding from the most recent stored result so restarts do not
/// re-fire just-performed checks.
pub async fn build_application(
    config: &Configuration,
    file: &Path,
    store: &ResultStore,
) -> Result<Arc<Application>, ConfigError> {
    let raw = fs::read_to_string(file).map_err(|source| ConfigError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let app_config: ApplicationConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: file.to_path_buf(),
            source,
        })?;

    let last_modified = fs::metadata(file).ok().and_then(|m| m.modified().ok());

    let mut notifiers: HashMap<String, Arc<dyn Notifier>> = HashMap::new();
    let mut default_notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    for nc in &app_config.notifiers {
        let notifier = build_notifier(&nc.kind, &nc.name, &nc.config, &config.web_root)?;
        if nc.default {
            default_notifiers.push(notifier.clone());
        }
        notifiers.insert(nc.key.clone(), notifier);
    }

    let mut validators: HashMap<String, Arc<dyn Validator>> = HashMap::new();
    let mut default_validators: Vec<Arc<dyn Validator>> = Vec::new();
    for vc in &app_config.validators {
        let validator = build_validator(&vc.kind, &vc.name, &vc.config)?;
        if vc.default {
            default_validators.push(validator.clone());
        }
        validators.insert(vc.key.clone(), validator);
    }

    let mut endpoints = Vec::with_capacity(app_config.endpoints.len());
    for ec in &app_config.endpoints {
        let method = if ec.method.is_empty() {
            "GET".to_string()
        } else {
            ec.method.clone()
        };

        let mut chain = default_validators.clone();
        for reference in &ec.validators {
            let validator =
                validators
                    .get(reference)
                    .ok_or_else(|| ConfigError::DanglingValidator {
                        endpoint: ec.key.clone(),
                        reference: reference.clone(),
                    })?;
            chain.push(validator.clone());
        }

        let mut bound_notifiers = default_notifiers.clone();
        for reference in &ec.notifiers {
            let notifier =
                notifiers
                    .get(reference)
                    .ok_or_else(|| ConfigError::DanglingNotifier {
                        endpoint: ec.key.clone(),
                        reference: reference.clone(),
                    })?;
            bound_notifiers.push(notifier.clone());
        }

        let interval = Duration::minutes(ec.check_interval.max(1));
        let mut last_check = None;
        let mut next_check = Utc::now();
        if !ec.dynamic {
            if let Ok(Some(last)) = store
                .get_last_result(&app_config.key, &ec.key, &ec.url)
                .await
            {
                let next = last.check_time + interval;
                if next > Utc::now() {
                    last_check = Some(last.check_time);
                    next_check = next;
                }
            }
        }

        endpoints.push(Endpoint {
            key: ec.key.clone(),
            name: ec.name.clone(),
            url: ec.url.clone(),
            method,
            request_body: ec.request_body.clone(),
            headers: ec.headers.clone(),
            dynamic: ec.dynamic,
            ignore_redirects: ec.ignore_redirects,
            check_interval: interval,
            validators: chain,
            notifiers: bound_notifiers,
            current_urls: Vec::new(),
            current_status: EndpointStatus::Unknown,
            current_validation: Vec::new(),
            last_check,
            next_check,
        });
    }

    Ok(Arc::new(Application {
        key: app_config.key,
        name: app_config.name,
        file_name: file.to_path_buf(),
        last_modified,
        cancel: CancellationToken::new(),
        endpoints: RwLock::new(endpoints),
    }))
}

/// Loads every `*.yaml` application definition under the config directory.
/// Files that fail to parse or resolve are skipped with a logged error.
pub async fn load_applications(
    config: &Configuration,
    store: &ResultStore,
) -> Vec<Arc<Application>> {
    let mut files: Vec<PathBuf> = match fs::read_dir(&config.app_config_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
            .collect(),
        Err(e) => {
            error!(dir = %config.app_config_dir.display(), error = %e,
                   "unable to read application config directory");
            return Vec::new();
        }
    };
    files.sort();

    let mut apps: Vec<Arc<Application>> = Vec::new();
    for file in files {
        info!(file = %file.display(), "loading application configuration file");
        match build_application(config, &file, store).await {
            Ok(app) => {
                if apps.iter().any(|a| a.key.eq_ignore_ascii_case(&app.key)) {
                    error!(file = %file.display(), key = %app.key,
                           "application key is already in use, skipping file");
                    continue;
                }
                apps.push(app);
            }
            Err(e) => {
                error!(file = %file.display(), error = %e,
                       "unable to load application configuration");
            }
        }
    }
    apps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointResult, ValidationResult};
    use std::io::Write;
    use tempfile::TempDir;

    const APP_YAML: &str = r#"
Key: shop
Name: Shop
Validators:
  - Key: status
    Name: Status 200
    Type: Status
    Default: true
    Config:
      status: 200
  - Key: json
    Name: Valid JSON
    Type: JSON
Notifiers:
  - Key: console
    Name: Console
    Type: stderr
    Default: true
Endpoints:
  - Key: orders
    Name: Orders
    URL: http://example.com/orders
    CheckInterval: 5
    Validators: [json]
  - Key: search
    Name: Search
    URL: http://example.com/search
    Method: POST
    RequestBody: '{"q": "all"}'
    Headers:
      Content-Type: application/json
    CheckInterval: 1
"#;

    struct Fixture {
        dir: TempDir,
        config: Configuration,
        store: ResultStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(&dir.path().join("feedmon.db")).unwrap();
        let config = Configuration {
            log_level: "warn".into(),
            log_file: String::new(),
            git_root: dir.path().join("git"),
            web_port: 8080,
            web_root: "http://feedmon.local".into(),
            app_config_dir: dir.path().join("apps"),
            web_dev_mode: false,
        };
        fs::create_dir_all(&config.app_config_dir).unwrap();
        Fixture { dir, config, store }
    }

    fn write_app(fixture: &Fixture, name: &str, contents: &str) -> PathBuf {
        let path = fixture.config.app_config_dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn main_config_parses_and_rejects_unknown_keys() {
        let f = fixture();
        let path = f.dir.path().join("feedmon.yaml");
        fs::write(
            &path,
            "LogLevel: info\nGitRoot: /tmp/git\nWebPort: 8080\nWebRoot: http://x\nAppConfigDir: /tmp/apps\n",
        )
        .unwrap();
        let config = load_main_config(&path).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.web_port, 8080);

        fs::write(&path, "GitRoot: /tmp/git\nWebPort: 8080\nAppConfigDir: /tmp/apps\nWebPorts: 9\n").unwrap();
        assert!(matches!(
            load_main_config(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn builds_application_with_default_inheritance() {
        let f = fixture();
        let path = write_app(&f, "shop.yaml", APP_YAML);

        let app = build_application(&f.config, &path, &f.store).await.unwrap();
        assert_eq!(app.key, "shop");
        assert!(app.last_modified.is_some());

        let endpoints = app.endpoints.read().await;
        assert_eq!(endpoints.len(), 2);

        // Default validator first, endpoint reference after.
        let orders = &endpoints[0];
        assert_eq!(orders.method, "GET");
        assert_eq!(orders.validators.len(), 2);
        assert_eq!(orders.validators[0].name(), "Status 200");
        assert_eq!(orders.validators[1].name(), "Valid JSON");
        assert_eq!(orders.notifiers.len(), 1);
        assert_eq!(orders.check_interval, Duration::minutes(5));

        let search = &endpoints[1];
        assert_eq!(search.method, "POST");
        assert_eq!(search.validators.len(), 1);
        assert_eq!(search.headers["Content-Type"], "application/json");
    }

    #[tokio::test]
    async fn unknown_endpoint_key_fails_the_file() {
        let f = fixture();
        let bad = APP_YAML.replace("URL: http://example.com/orders", "Url2: http://x");
        let path = write_app(&f, "shop.yaml", &bad);
        assert!(matches!(
            build_application(&f.config, &path, &f.store).await,
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn dangling_validator_reference_fails_the_file() {
        let f = fixture();
        let bad = APP_YAML.replace("Validators: [json]", "Validators: [missing]");
        let path = write_app(&f, "shop.yaml", &bad);
        assert!(matches!(
            build_application(&f.config, &path, &f.store).await,
            Err(ConfigError::DanglingValidator { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_validator_type_fails_the_file() {
        let f = fixture();
        let bad = APP_YAML.replace("Type: Status", "Type: Regex");
        let path = write_app(&f, "shop.yaml", &bad);
        assert!(matches!(
            build_application(&f.config, &path, &f.store).await,
            Err(ConfigError::UnknownValidatorType(_))
        ));
    }

    #[tokio::test]
    async fn schedule_seeds_from_recent_stored_result() {
        let f = fixture();
        let recent = Utc::now() - Duration::minutes(2);
        f.store
            .write_endpoint_result(&EndpointResult {
                app_key: "shop".into(),
                endpoint_key: "orders".into(),
                url: "http://example.com/orders".into(),
                check_time: recent,
                duration_ms: 1,
                size: 2,
                status: 200,
                headers: HashMap::new(),
                body: Vec::new(),
                body_version: String::new(),
                body_changed: false,
                validation_results: vec![ValidationResult {
                    name: "status".into(),
                    valid: true,
                    errors: Vec::new(),
                }],
            })
            .await
            .unwrap();

        let path = write_app(&f, "shop.yaml", APP_YAML);
        let app = build_application(&f.config, &path, &f.store).await.unwrap();
        let endpoints = app.endpoints.read().await;

        // Interval 5min, last check 2min ago: not due for ~3 more minutes.
        let orders = &endpoints[0];
        assert!(!orders.due(Utc::now()));

        // No stored history: due immediately.
        let search = &endpoints[1];
        assert!(search.due(Utc::now()));
    }

    #[tokio::test]
    async fn load_applications_skips_broken_files_and_duplicates() {
        let f = fixture();
        write_app(&f, "shop.yaml", APP_YAML);
        write_app(&f, "broken.yaml", "Key: [not\n");
        write_app(&f, "dup.yaml", &APP_YAML.replace("Name: Shop", "Name: Shop Copy"));
        write_app(&f, "notes.txt", "ignored");

        let apps = load_applications(&f.config, &f.store).await;
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].key, "shop");
    }
}
