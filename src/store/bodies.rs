//! Content-addressed history of response bodies.
//!
//! Every `(app, endpoint, URL)` triple owns a small git repository holding
//! a single `body` file. A write that leaves the tree clean returns the
//! current head without creating a version; any change is committed with
//! the check time as the message. Replay reads the blob straight out of
//! the object database, which never disturbs the live working tree.

use chrono::{DateTime, SecondsFormat, Utc};
use git2::{ErrorCode, Oid, Repository, Signature, StatusOptions};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::StoreError;

const BODY_FILE: &str = "body";

/// Longest directory name we will create before falling back to a digest.
const MAX_ENCODED_LEN: usize = 255;

/// Encodes a URL into a case-stable directory name. Hex keeps the name
/// stable on case-insensitive filesystems; over-long names collapse to the
/// SHA-256 digest of the URL.
pub fn encode_url(url: &str) -> String {
    let encoded = hex::encode(url.as_bytes());
    if encoded.len() > MAX_ENCODED_LEN {
        hex::encode(Sha256::digest(url.as_bytes()))
    } else {
        encoded
    }
}

/// The versioned body history for one `(app, endpoint, URL)` triple.
pub struct BodyStore {
    dir: PathBuf,
    repo: Mutex<Repository>,
}

impl BodyStore {
    fn open_or_init(dir: PathBuf) -> Result<BodyStore, StoreError> {
        fs::create_dir_all(&dir)?;
        let repo = match Repository::open(&dir) {
            Ok(r) => r,
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(dir = %dir.display(), "initialising body store");
                Repository::init(&dir)?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(BodyStore {
            dir,
            repo: Mutex::new(repo),
        })
    }

    /// Writes `body` to the canonical file and commits it if it differs
    /// from the previous version. Returns the version identifier and
    /// whether a new version was created.
    pub fn update_feed(
        &self,
        body: &[u8],
        check_time: &DateTime<Utc>,
    ) -> Result<(String, bool), StoreError> {
        let repo = self.repo.lock().expect("body store lock poisoned");
        fs::write(self.dir.join(BODY_FILE), body)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        if statuses.is_empty() {
            let head = repo.head()?.peel_to_commit()?;
            return Ok((head.id().to_string(), false));
        }

        let mut index = repo.index()?;
        index.add_path(Path::new(BODY_FILE))?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("FeedMonitor", "feedmonitor@localhost")?;
        let message = check_time.to_rfc3339_opts(SecondsFormat::Secs, false);
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let oid = match &parent {
            Some(p) => repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[p])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?,
        };
        Ok((oid.to_string(), true))
    }

    /// The exact bytes committed at `version`.
    pub fn get_body(&self, version: &str) -> Result<Vec<u8>, StoreError> {
        let repo = self.repo.lock().expect("body store lock poisoned");
        let oid = Oid::from_str(version)?;
        let commit = repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let entry = tree.get_name(BODY_FILE).ok_or(StoreError::NotFound)?;
        let blob = repo.find_blob(entry.id())?;
        Ok(blob.content().to_vec())
    }
}

/// Process-wide cache of open body stores, keyed by directory. Opening and
/// initialising are serialized; writes to distinct triples do not contend.
#[derive(Clone)]
pub struct BodyStoreCache {
    root: PathBuf,
    stores: Arc<Mutex<HashMap<PathBuf, Arc<BodyStore>>>>,
}

impl BodyStoreCache {
    pub fn new(root: impl Into<PathBuf>) -> BodyStoreCache {
        BodyStoreCache {
            root: root.into(),
            stores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The store for a triple, opening or initialising it on first use.
    pub fn open(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
    ) -> Result<Arc<BodyStore>, StoreError> {
        let dir = self
            .root
            .join(app)
            .join(endpoint)
            .join(encode_url(url));
        let mut stores = self.stores.lock().expect("body store cache lock poisoned");
        if let Some(store) = stores.get(&dir) {
            return Ok(store.clone());
        }
        let store = Arc::new(BodyStore::open_or_init(dir.clone())?);
        stores.insert(dir, store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> (TempDir, BodyStoreCache) {
        let dir = TempDir::new().unwrap();
        let cache = BodyStoreCache::new(dir.path());
        (dir, cache)
    }

    #[test]
    fn identical_write_reports_unchanged_with_same_version() {
        let (_dir, cache) = cache();
        let store = cache.open("app", "ep", "http://example.com/a").unwrap();
        let now = Utc::now();

        let (v1, changed1) = store.update_feed(b"{\"a\":1}", &now).unwrap();
        assert!(changed1);
        let (v2, changed2) = store.update_feed(b"{\"a\":1}", &now).unwrap();
        assert!(!changed2);
        assert_eq!(v1, v2);
    }

    #[test]
    fn differing_writes_create_distinct_versions() {
        let (_dir, cache) = cache();
        let store = cache.open("app", "ep", "http://example.com/a").unwrap();
        let now = Utc::now();

        let (v1, _) = store.update_feed(b"one", &now).unwrap();
        let (v2, changed) = store.update_feed(b"two", &now).unwrap();
        assert!(changed);
        assert_ne!(v1, v2);
    }

    #[test]
    fn get_body_round_trips_every_version() {
        let (_dir, cache) = cache();
        let store = cache.open("app", "ep", "http://example.com/a").unwrap();
        let now = Utc::now();

        let (v1, _) = store.update_feed(b"first body", &now).unwrap();
        let (v2, _) = store.update_feed(b"second body", &now).unwrap();

        assert_eq!(store.get_body(&v1).unwrap(), b"first body");
        assert_eq!(store.get_body(&v2).unwrap(), b"second body");
    }

    #[test]
    fn cache_returns_same_handle_per_triple() {
        let (_dir, cache) = cache();
        let a = cache.open("app", "ep", "http://example.com/a").unwrap();
        let b = cache.open("app", "ep", "http://example.com/a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn url_encoding_is_stable_and_capped() {
        let short = encode_url("http://example.com/a");
        assert_eq!(short, encode_url("http://example.com/a"));
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));

        let long_url = format!("http://example.com/{}", "x".repeat(300));
        let encoded = encode_url(&long_url);
        assert_eq!(encoded.len(), 64);
        assert_eq!(encoded, encode_url(&long_url));
    }
}
