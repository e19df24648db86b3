// HTTP handlers
//
// Handlers only translate between HTTP and the Storage contract. Every
// storage call goes through the shared Retryer, so connection blips are
// absorbed here and only an exhausted retry reaches the client as a 500.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::error::StorageError;
use crate::model::{Metric, MetricKind, MetricRecord};
use crate::retry::Retryer;
use crate::storage::Storage;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,

    /// Retries storage calls that failed with a connection exception
    pub retryer: Retryer<StorageError>,

    /// Save after every successful mutation (store interval of zero)
    pub sync_save: bool,
}

impl AppState {
    /// Persists the mutation just applied when running in synchronous mode.
    async fn save_if_sync(&self) -> Result<(), StorageError> {
        if !self.sync_save {
            return Ok(());
        }
        let storage = self.storage.as_ref();
        self.retryer.retry(move || storage.save()).await
    }
}

/// Client-facing failure, rendered as plain text or as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    Text(StatusCode, String),
    Json(StatusCode, String),
}

impl ApiError {
    fn text(err: StorageError) -> Self {
        let (status, message) = describe(err);
        ApiError::Text(status, message)
    }

    fn json(err: StorageError) -> Self {
        let (status, message) = describe(err);
        ApiError::Json(status, message)
    }

    fn rejected(rejection: JsonRejection) -> Self {
        warn!("Rejected JSON body: {}", rejection.body_text());
        ApiError::Json(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

/// Maps a storage error to a status and a message that is safe to expose.
fn describe(err: StorageError) -> (StatusCode, String) {
    match err {
        StorageError::Metric(e) => (StatusCode::BAD_REQUEST, e.to_string()),
        StorageError::MetricNotExist => (StatusCode::NOT_FOUND, err.to_string()),
        other => {
            error!("Storage failure: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "server error".to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Text(status, message) => (status, message).into_response(),
            ApiError::Json(status, message) => {
                (status, Json(json!({ "error": message }))).into_response()
            }
        }
    }
}

/// `POST /update/{type}/{name}/{value}`
pub async fn update_plain(
    State(state): State<AppState>,
    Path((kind, id, raw_value)): Path<(String, String, String)>,
) -> Result<String, ApiError> {
    let storage = state.storage.as_ref();
    let (kind, id, raw_value) = (kind.as_str(), id.as_str(), raw_value.as_str());

    let updated = state
        .retryer
        .retry(move || storage.update(kind, id, raw_value))
        .await
        .map_err(ApiError::text)?;
    state.save_if_sync().await.map_err(ApiError::text)?;

    Ok(updated.value.to_string())
}

/// `POST /update` with one JSON metric.
pub async fn update_json(
    State(state): State<AppState>,
    payload: Result<Json<Metric>, JsonRejection>,
) -> Result<Json<Metric>, ApiError> {
    let Json(metric) = payload.map_err(ApiError::rejected)?;
    let storage = state.storage.as_ref();
    let metric = &metric;

    let updated = state
        .retryer
        .retry(move || storage.update_json(metric.clone()))
        .await
        .map_err(ApiError::json)?;
    state.save_if_sync().await.map_err(ApiError::json)?;

    Ok(Json(updated))
}

/// `POST /updates` with a JSON array; echoes the canonical value of every
/// distinct metric in the batch.
pub async fn update_batch(
    State(state): State<AppState>,
    payload: Result<Json<Vec<Metric>>, JsonRejection>,
) -> Result<Json<Vec<Metric>>, ApiError> {
    let Json(metrics) = payload.map_err(ApiError::rejected)?;
    let storage = state.storage.as_ref();
    let metrics = metrics.as_slice();

    let updated = state
        .retryer
        .retry(move || storage.update_batch(metrics))
        .await
        .map_err(ApiError::json)?;
    state.save_if_sync().await.map_err(ApiError::json)?;

    Ok(Json(updated))
}

/// `GET /value/{type}/{name}`
pub async fn get_plain(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let storage = state.storage.as_ref();
    let (kind, id) = (kind.as_str(), id.as_str());

    state
        .retryer
        .retry(move || storage.get(kind, id))
        .await
        .map_err(ApiError::text)
}

/// `POST /value` with `{"id", "type"}`.
pub async fn get_json(
    State(state): State<AppState>,
    payload: Result<Json<MetricRecord>, JsonRejection>,
) -> Result<Json<Metric>, ApiError> {
    let Json(query) = payload.map_err(ApiError::rejected)?;
    let kind: MetricKind = query
        .kind
        .parse()
        .map_err(|e| ApiError::json(StorageError::Metric(e)))?;
    let storage = state.storage.as_ref();
    let id = query.id.as_str();

    state
        .retryer
        .retry(move || storage.get_json(kind, id))
        .await
        .map(Json)
        .map_err(ApiError::json)
}

/// `GET /ping`
pub async fn ping(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    let storage = state.storage.as_ref();
    state
        .retryer
        .retry(move || storage.ping())
        .await
        .map_err(ApiError::text)?;
    Ok("OK")
}

/// `GET /`
pub async fn index(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let storage = state.storage.as_ref();
    let metrics = state
        .retryer
        .retry(move || storage.get_metrics())
        .await
        .map_err(ApiError::text)?;

    Ok(Html(render_listing(&metrics)))
}

fn render_listing(metrics: &[(String, String)]) -> String {
    let mut html = String::from("<html><head><title>Metrics</title></head><body>");
    if metrics.is_empty() {
        html.push_str("<p>No metrics available</p>");
    } else {
        html.push_str("<ul>");
        for (name, value) in metrics {
            let _ = write!(html, "<li>{}: {}</li>", escape(name), escape(value));
        }
        html.push_str("</ul>");
    }
    html.push_str("</body></html>");
    html
}

fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_markup() {
        assert!(render_listing(&[]).contains("No metrics available"));

        let html = render_listing(&[
            ("Alloc".into(), "1.5".into()),
            ("<b>".into(), "2".into()),
        ]);
        assert!(html.contains("<li>Alloc: 1.5</li>"));
        assert!(html.contains("<li>&lt;b&gt;: 2</li>"));
    }

    #[test]
    fn test_error_mapping_hides_internals() {
        let (status, message) = describe(StorageError::Server("pq: relation missing".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, "server error");

        let (status, _) = describe(StorageError::PingUnsupported);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, message) = describe(StorageError::MetricNotExist);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(message, "metric doesn't exist");
    }
}
