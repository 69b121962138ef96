//! The read-only HTTP UI.

pub mod error;
mod handlers;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tera::Tera;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::store::bodies::BodyStoreCache;
use crate::store::results::ResultStore;
use crate::supervisor::Supervisor;

/// HTML template set, optionally reloaded per request in development mode.
pub struct TemplateEngine {
    tera: RwLock<Tera>,
    dev_mode: bool,
}

impl TemplateEngine {
    pub fn new(dev_mode: bool) -> Result<TemplateEngine, tera::Error> {
        let mut tera = Tera::new("templates/**/*.html")?;
        crate::expander::register_filters(&mut tera);
        Ok(TemplateEngine {
            tera: RwLock::new(tera),
            dev_mode,
        })
    }

    pub fn render(&self, name: &str, context: &tera::Context) -> Result<String, tera::Error> {
        if self.dev_mode {
            self.tera
                .write()
                .expect("template lock poisoned")
                .full_reload()?;
        }
        self.tera
            .read()
            .expect("template lock poisoned")
            .render(name, context)
    }
}

pub struct WebState {
    pub supervisor: Arc<Supervisor>,
    pub results: ResultStore,
    pub bodies: BodyStoreCache,
    pub templates: TemplateEngine,
    pub web_root: String,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(handlers::home))
        .route("/app/{app}/", get(handlers::app_home))
        .route("/app/{app}/{endpoint}/", get(handlers::endpoint_home))
        .route("/app/{app}/{endpoint}/result", get(handlers::endpoint_result))
        .route("/app/{app}/{endpoint}/results", get(handlers::endpoint_results))
        .route(
            "/app/{app}/{endpoint}/resultsdiff",
            get(handlers::endpoint_results_diff),
        )
        .route(
            "/app/{app}/{endpoint}/resultsinvalid",
            get(handlers::endpoint_results_invalid),
        )
        .route(
            "/app/{app}/{endpoint}/performance",
            get(handlers::endpoint_performance),
        )
        .route("/app/{app}/{endpoint}/replay", get(handlers::endpoint_replay))
        .route("/app/{app}/{endpoint}/diff", get(handlers::endpoint_diff))
        .with_state(state)
}

/// Binds the listener and serves the UI until the helper scope is
/// cancelled. Returns the bound address and the server task handle.
pub async fn start_webserver(
    token: CancellationToken,
    state: Arc<WebState>,
    port: u16,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    let app = router(state);
    let handle = tokio::spawn(async move {
        debug!(%addr, "started webserver");
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "webserver error");
        }
        debug!("stopped webserver");
    });
    Ok((addr, handle))
}
