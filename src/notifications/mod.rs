//! Notification events and the edge-triggered delivery engine.

pub mod senders;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::EndpointResult;
use crate::store::results::ResultStore;
use senders::Notifier;
use std::sync::Arc;

/// Capacity of the notification channel drained by the engine.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 100;

/// One fetch outcome, addressed to the notifiers bound to its endpoint at
/// fetch time.
#[derive(Clone)]
pub struct Notification {
    pub app_key: String,
    pub app_name: String,
    pub endpoint_key: String,
    pub endpoint_name: String,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub result: EndpointResult,
}

/// Decides whether an event represents a validity edge worth notifying.
///
/// The previously persisted result for the same triple is looked up with a
/// strictly-earlier query, so the decision is correct whether or not the
/// writer has already persisted the event itself. An absent predecessor is
/// treated as valid: the first-ever failure notifies, the first-ever
/// success does not.
pub async fn should_notify(store: &ResultStore, n: &Notification) -> bool {
    let prev = match store
        .get_endpoint_result_prev(&n.app_key, &n.endpoint_key, &n.result.url, &n.result.check_time)
        .await
    {
        Ok(prev) => prev,
        Err(e) => {
            warn!(app = %n.app_key, endpoint = %n.endpoint_key, error = %e,
                  "error loading previous result for notification decision");
            return false;
        }
    };
    let valid = n.result.valid();
    match prev {
        None => !valid,
        Some(prev) => valid != prev.valid(),
    }
}

async fn deliver(store: &ResultStore, n: &Notification) {
    if !should_notify(store, n).await {
        return;
    }
    for notifier in &n.notifiers {
        if let Err(e) = notifier.notify(n).await {
            warn!(app = %n.app_key, endpoint = %n.endpoint_key,
                  notifier = notifier.name(), error = %e,
                  "notifier delivery failed");
        }
    }
}

/// Starts the notification engine. The returned sender is the notification
/// channel; the engine drains it, applies the edge policy and fans out to
/// the event's notifiers. Remaining buffered events are flushed when the
/// helper scope is cancelled.
pub fn start_notification_engine(
    token: CancellationToken,
    store: ResultStore,
) -> (mpsc::Sender<Notification>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Notification>(NOTIFICATION_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        debug!("started notification engine");
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(n) => deliver(&store, &n).await,
                        None => break,
                    }
                }
                _ = token.cancelled() => {
                    while let Ok(n) = rx.try_recv() {
                        deliver(&store, &n).await;
                    }
                    break;
                }
            }
        }
        debug!("shutting down notification engine");
    });
    (tx, handle)
}
