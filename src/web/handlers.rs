//! Route handlers for the read-only UI.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::WebError;
use super::WebState;
use crate::application::{Application, Endpoint, EndpointStatus};
use crate::models::{EndpointResult, PerformanceRecord, ValidationResult};

#[derive(Serialize)]
struct AppView {
    key: String,
    name: String,
}

#[derive(Serialize)]
struct EndpointView {
    key: String,
    name: String,
    url: String,
    method: String,
    dynamic: bool,
    check_interval_min: i64,
    current_urls: Vec<String>,
    current_status: EndpointStatus,
    current_validation: Vec<ValidationResult>,
    last_check: Option<DateTime<Utc>>,
    next_check: DateTime<Utc>,
}

/// An [`EndpointResult`] with its aggregate validity, for templates.
#[derive(Serialize)]
struct ResultView {
    valid: bool,
    #[serde(flatten)]
    result: EndpointResult,
}

impl From<EndpointResult> for ResultView {
    fn from(result: EndpointResult) -> Self {
        ResultView {
            valid: result.valid(),
            result,
        }
    }
}

#[derive(Serialize)]
struct UrlResults {
    url: String,
    results: Vec<ResultView>,
}

#[derive(Deserialize)]
pub(super) struct ViewQuery {
    date: Option<String>,
    feed: Option<String>,
}

fn endpoint_view(e: &Endpoint) -> EndpointView {
    EndpointView {
        key: e.key.clone(),
        name: e.name.clone(),
        url: e.url.clone(),
        method: e.method.clone(),
        dynamic: e.dynamic,
        check_interval_min: e.check_interval.num_minutes(),
        current_urls: e.current_urls.clone(),
        current_status: e.current_status,
        current_validation: e.current_validation.clone(),
        last_check: e.last_check,
        next_check: e.next_check,
    }
}

async fn app_views(state: &WebState) -> Vec<AppView> {
    state
        .supervisor
        .applications()
        .await
        .iter()
        .map(|a| AppView {
            key: a.key.clone(),
            name: a.name.clone(),
        })
        .collect()
}

async fn get_app(state: &WebState, key: &str) -> Result<Arc<Application>, WebError> {
    state
        .supervisor
        .get_application(key)
        .await
        .ok_or(WebError::NotFound)
}

async fn find_endpoint_view(app: &Application, key: &str) -> Result<EndpointView, WebError> {
    app.endpoints
        .read()
        .await
        .iter()
        .find(|e| e.key.eq_ignore_ascii_case(key))
        .map(endpoint_view)
        .ok_or(WebError::NotFound)
}

/// The concrete URL a view applies to: the `feed` parameter for dynamic
/// endpoints, the configured URL otherwise.
fn feed_url(endpoint: &EndpointView, query: &ViewQuery) -> String {
    match &query.feed {
        Some(feed) => feed.clone(),
        None if !endpoint.dynamic => endpoint.url.clone(),
        None => String::new(),
    }
}

/// Parses a `date` parameter naming an exact instant (RFC 3339 or `today`).
fn parse_instant(arg: Option<&str>) -> Result<DateTime<Utc>, WebError> {
    let arg = arg.ok_or_else(|| WebError::BadRequest("missing date parameter".into()))?;
    if arg.trim().eq_ignore_ascii_case("today") {
        return Ok(Utc::now());
    }
    DateTime::parse_from_rfc3339(arg)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WebError::BadRequest(format!("invalid date {arg}: {e}")))
}

/// Parses a `date` parameter naming a day (`YYYY-MM-DD` or `today`).
fn parse_day(arg: Option<&str>) -> Result<DateTime<Utc>, WebError> {
    let Some(arg) = arg else {
        return Ok(Utc::now());
    };
    if arg.trim().eq_ignore_ascii_case("today") {
        return Ok(Utc::now());
    }
    NaiveDate::parse_from_str(arg, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|e| WebError::BadRequest(format!("invalid date {arg}: {e}")))
}

/// Graph rows for the performance timeline: `[epoch ms, duration, size]`.
fn graph_rows(records: &[PerformanceRecord]) -> String {
    let rows: Vec<[i64; 3]> = records
        .iter()
        .map(|r| [r.check_time.timestamp_millis(), r.entry.duration, r.entry.size])
        .collect();
    serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
}

pub(super) async fn home(State(state): State<Arc<WebState>>) -> Result<Html<String>, WebError> {
    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    Ok(Html(state.templates.render("home.html", &ctx)?))
}

pub(super) async fn app_home(
    State(state): State<Arc<WebState>>,
    Path(app_key): Path<String>,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoints: Vec<EndpointView> = app.endpoints.read().await.iter().map(endpoint_view).collect();

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoints", &endpoints);
    Ok(Html(state.templates.render("app.html", &ctx)?))
}

pub(super) async fn endpoint_home(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;

    let urls = if endpoint.dynamic {
        endpoint.current_urls.clone()
    } else {
        vec![endpoint.url.clone()]
    };
    let mut url_results = Vec::with_capacity(urls.len());
    for url in urls {
        let results = state
            .results
            .get_last_n_results(&app.key, &endpoint.key, &url, 10)
            .await?
            .into_iter()
            .map(ResultView::from)
            .collect();
        url_results.push(UrlResults { url, results });
    }

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoint", &endpoint);
    ctx.insert("url_results", &url_results);
    Ok(Html(state.templates.render("endpoint.html", &ctx)?))
}

pub(super) async fn endpoint_result(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;
    let date = parse_instant(query.date.as_deref())?;
    let url = feed_url(&endpoint, &query);

    let result = state
        .results
        .get_endpoint_result(&app.key, &endpoint.key, &url, &date)
        .await?;

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoint", &endpoint);
    ctx.insert("feed_url", &url);
    ctx.insert("result", &ResultView::from(result));
    Ok(Html(state.templates.render("result.html", &ctx)?))
}

pub(super) async fn endpoint_results(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;
    let date = parse_day(query.date.as_deref())?;
    let url = feed_url(&endpoint, &query);

    let results: Vec<ResultView> = state
        .results
        .get_endpoint_results_for_date(&app.key, &endpoint.key, &url, &date)
        .await?
        .into_iter()
        .map(ResultView::from)
        .collect();

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoint", &endpoint);
    ctx.insert("feed_url", &url);
    ctx.insert("results", &results);
    ctx.insert("date", &date.format("%a %b %e %Y").to_string());
    ctx.insert("prev_date", &(date - Duration::hours(24)).format("%Y-%m-%d").to_string());
    ctx.insert("next_date", &(date + Duration::hours(24)).format("%Y-%m-%d").to_string());
    Ok(Html(state.templates.render("results.html", &ctx)?))
}

async fn endpoint_results_filtered(
    state: Arc<WebState>,
    app_key: String,
    endpoint_key: String,
    query: ViewQuery,
    filter_name: &str,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;
    let url = feed_url(&endpoint, &query);

    let results = if filter_name == "Diffs" {
        state
            .results
            .get_last_n_diff_results(&app.key, &endpoint.key, &url, 100)
            .await?
    } else {
        state
            .results
            .get_last_n_invalid_results(&app.key, &endpoint.key, &url, 100)
            .await?
    };
    let results: Vec<ResultView> = results.into_iter().map(ResultView::from).collect();

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoint", &endpoint);
    ctx.insert("feed_url", &url);
    ctx.insert("results", &results);
    ctx.insert("filter_name", filter_name);
    Ok(Html(state.templates.render("results_alt.html", &ctx)?))
}

pub(super) async fn endpoint_results_diff(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Html<String>, WebError> {
    endpoint_results_filtered(state, app_key, endpoint_key, query, "Diffs").await
}

pub(super) async fn endpoint_results_invalid(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Html<String>, WebError> {
    endpoint_results_filtered(state, app_key, endpoint_key, query, "Invalid Results").await
}

pub(super) async fn endpoint_performance(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;
    let date = parse_day(query.date.as_deref())?;
    let url = feed_url(&endpoint, &query);

    let records = state
        .results
        .get_performance_records_for_date(&app.key, &endpoint.key, &url, &date)
        .await?;

    let day_start = date.date_naive().and_time(NaiveTime::MIN).and_utc();
    let day_end = day_start + Duration::hours(24);

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoint", &endpoint);
    ctx.insert("feed_url", &url);
    ctx.insert("graph_data", &graph_rows(&records));
    ctx.insert("date", &date.format("%a %b %e %Y").to_string());
    ctx.insert("start_date", &day_start.to_rfc3339());
    ctx.insert("end_date", &day_end.to_rfc3339());
    ctx.insert("prev_date", &(date - Duration::hours(24)).format("%Y-%m-%d").to_string());
    ctx.insert("next_date", &(date + Duration::hours(24)).format("%Y-%m-%d").to_string());
    Ok(Html(state.templates.render("performance.html", &ctx)?))
}

/// Headers never replayed verbatim: the framing of the replay response is
/// the server's own.
const SKIPPED_REPLAY_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

pub(super) async fn endpoint_replay(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;
    let date = parse_instant(query.date.as_deref())?;
    let url = feed_url(&endpoint, &query);

    let result = state
        .results
        .get_endpoint_result(&app.key, &endpoint.key, &url, &date)
        .await?;
    let body = load_body(&state, &result)?;

    let mut response = Response::builder().status(StatusCode::OK);
    if let Some(headers) = response.headers_mut() {
        for (name, values) in &result.headers {
            if SKIPPED_REPLAY_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(header_value) = HeaderValue::try_from(value.as_str()) {
                    headers.append(header_name.clone(), header_value);
                }
            }
        }
    }
    Ok(response
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

pub(super) async fn endpoint_diff(
    State(state): State<Arc<WebState>>,
    Path((app_key, endpoint_key)): Path<(String, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Html<String>, WebError> {
    let app = get_app(&state, &app_key).await?;
    let endpoint = find_endpoint_view(&app, &endpoint_key).await?;
    let date = parse_instant(query.date.as_deref())?;
    let url = feed_url(&endpoint, &query);

    let result = state
        .results
        .get_endpoint_result(&app.key, &endpoint.key, &url, &date)
        .await?;
    let previous = state
        .results
        .get_endpoint_result_prev(&app.key, &endpoint.key, &url, &date)
        .await?;

    let new_body = pretty_json(&load_body(&state, &result)?);
    let old_body = match &previous {
        Some(prev) => pretty_json(&load_body(&state, prev)?),
        None => String::new(),
    };

    let mut ctx = tera::Context::new();
    ctx.insert("applications", &app_views(&state).await);
    ctx.insert("application", &AppView { key: app.key.clone(), name: app.name.clone() });
    ctx.insert("endpoint", &endpoint);
    ctx.insert("feed_url", &url);
    ctx.insert("old_body", &old_body);
    ctx.insert("new_body", &new_body);
    Ok(Html(state.templates.render("diff.html", &ctx)?))
}

fn load_body(state: &WebState, result: &EndpointResult) -> Result<Vec<u8>, WebError> {
    if result.body_version.is_empty() {
        return Ok(Vec::new());
    }
    let store = state
        .bodies
        .open(&result.app_key, &result.endpoint_key, &result.url)?;
    Ok(store.get_body(&result.body_version)?)
}

fn pretty_json(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}
