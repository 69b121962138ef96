//! FeedMonitor: a long-running service that periodically fetches configured
//! HTTP endpoints, validates each response against a chain of validators,
//! records results and performance metrics, keeps a versioned history of
//! response bodies, and emits notifications when an endpoint's validity
//! changes. A read-only web UI surfaces recent results, diffs, replays and
//! performance timelines.

pub mod application;
pub mod config;
pub mod expander;
pub mod fetcher;
pub mod models;
pub mod notifications;
pub mod store;
pub mod supervisor;
pub mod validators;
pub mod watcher;
pub mod web;
