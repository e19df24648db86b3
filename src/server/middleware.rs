// HTTP middleware - the inbound half of the transport security pipeline
//
// Applied to the POST routes in this order, outermost first:
//
//   decrypt -> gunzip -> verify_hash -> request_trace -> handler
//
// Each stage only acts when its Content-Encoding marker (or configured key)
// is present, so plain clients keep working against an unsecured server.
// verify_hash also signs the response body on the way out.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes, HttpBody};
use axum::extract::State;
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rsa::RsaPrivateKey;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultOnRequest, MakeSpan, OnResponse, TraceLayer};
use tracing::{error, info, info_span, warn, Span};

use crate::security::{self, ENCODING_ENCRYPTED, ENCODING_GZIP, HASH_HEADER};

/// Largest request or response body the middleware will buffer.
pub const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Keys the inbound pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// HMAC secret; empty disables signature checks and response signing
    pub hash_key: Vec<u8>,

    /// Private half of the agent's encryption key
    pub private_key: Option<RsaPrivateKey>,
}

impl SecurityConfig {
    fn hash_key(&self) -> Option<&[u8]> {
        Some(self.hash_key.as_slice()).filter(|k| !k.is_empty())
    }
}

fn bad_request(reason: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_REQUEST, reason.to_string()).into_response()
}

fn has_encoding(headers: &HeaderMap, marker: &str) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(marker))
}

async fn read_body(body: Body) -> Result<Bytes, Response> {
    to_bytes(body, BODY_LIMIT).await.map_err(|e| {
        warn!("Failed to read request body: {}", e);
        bad_request("failed to read request body")
    })
}

/// Reverses RSA chunk encryption; the result is still gzip-compressed.
pub async fn decrypt(
    State(security): State<Arc<SecurityConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !has_encoding(request.headers(), ENCODING_ENCRYPTED) {
        return next.run(request).await;
    }

    let Some(key) = security.private_key.as_ref() else {
        warn!("Encrypted request received but no private key is configured");
        return bad_request("encrypted payloads are not accepted");
    };

    let (mut parts, body) = request.into_parts();
    let ciphertext = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let compressed = match security::decrypt_chunks(key, &ciphertext) {
        Ok(plain) => plain,
        Err(e) => {
            warn!("Failed to decrypt request body: {}", e);
            return bad_request(e);
        }
    };

    parts
        .headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static(ENCODING_GZIP));
    parts.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(security::CONTENT_TYPE_JSON),
    );
    parts.headers.remove(CONTENT_LENGTH);

    next.run(Request::from_parts(parts, Body::from(compressed)))
        .await
}

pub async fn gunzip(request: Request<Body>, next: Next) -> Response {
    if !has_encoding(request.headers(), ENCODING_GZIP) {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let compressed = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let plain = match security::gunzip(&compressed) {
        Ok(plain) => plain,
        Err(e) => {
            warn!("Failed to decompress request body: {}", e);
            return bad_request(e);
        }
    };

    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.remove(CONTENT_LENGTH);

    next.run(Request::from_parts(parts, Body::from(plain))).await
}

/// Checks `HashSHA256` against the plain body and signs the response.
///
/// A request that fails verification never reaches the handler.
pub async fn verify_hash(
    State(security): State<Arc<SecurityConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(key) = security.hash_key() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let body = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let header = parts.headers.get(HASH_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = security::verify(key, &body, header) {
        warn!("Rejected request to {}: {}", parts.uri.path(), e);
        return bad_request(e);
    }

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    sign_response(key, response).await
}

async fn sign_response(key: &[u8], response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let body = match to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to buffer response body: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match security::sign(key, &body) {
        Ok(signature) => match HeaderValue::from_str(&signature) {
            Ok(value) => {
                parts.headers.insert(HASH_HEADER, value);
            }
            Err(e) => error!("Failed to encode response signature: {}", e),
        },
        Err(e) => error!("Failed to sign response: {}", e),
    }

    Response::from_parts(parts, Body::from(body))
}

/// Request span carrying the method and path.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path()
        )
    }
}

/// Logs status, response size and latency once the handler has answered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogResponse;

impl<B: HttpBody> OnResponse<B> for LogResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        info!(
            status = response.status().as_u16(),
            size = response.body().size_hint().exact().unwrap_or_default(),
            duration_ms = latency.as_millis() as u64,
            "Handled request"
        );
    }
}

pub type RequestTrace =
    TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan, DefaultOnRequest, LogResponse>;

/// Request logging layer: method, path, status, response size and duration.
pub fn request_trace() -> RequestTrace {
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_response(LogResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use rsa::RsaPublicKey;
    use tower::ServiceExt;

    /// Echoes the body it finally receives, so tests can see what the
    /// middleware chain produced.
    fn echo_router(security: SecurityConfig) -> Router {
        let security = Arc::new(security);
        Router::new()
            .route("/", post(|body: Bytes| async move { body }))
            .layer(request_trace())
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&security),
                verify_hash,
            ))
            .layer(axum::middleware::from_fn(gunzip))
            .layer(axum::middleware::from_fn_with_state(security, decrypt))
    }

    async fn body_of(response: Response) -> Bytes {
        to_bytes(response.into_body(), BODY_LIMIT).await.unwrap()
    }

    fn sealed_request(
        plain: &[u8],
        hash_key: Option<&[u8]>,
        public_key: Option<&RsaPublicKey>,
    ) -> Request<Body> {
        let sealed = security::seal(plain, hash_key, public_key).unwrap();
        let mut builder = Request::post("/")
            .header(CONTENT_TYPE, sealed.content_type)
            .header(CONTENT_ENCODING, sealed.content_encoding);
        if let Some(sig) = sealed.signature {
            builder = builder.header(HASH_HEADER, sig);
        }
        builder.body(Body::from(sealed.body)).unwrap()
    }

    #[tokio::test]
    async fn test_full_pipeline_is_reversed() {
        let private_key = security::test_private_key().clone();
        let public_key = RsaPublicKey::from(&private_key);
        let router = echo_router(SecurityConfig {
            hash_key: b"secret".to_vec(),
            private_key: Some(private_key),
        });

        let plain = br#"[{"id":"Alloc","type":"gauge","value":1.5}]"#;
        let response = router
            .oneshot(sealed_request(plain, Some(b"secret"), Some(&public_key)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let expected_sig = security::sign(b"secret", plain).unwrap();
        assert_eq!(
            response.headers().get(HASH_HEADER).unwrap().to_str().unwrap(),
            expected_sig
        );
        assert_eq!(&body_of(response).await[..], plain);
    }

    #[tokio::test]
    async fn test_request_trace_keeps_status_and_body() {
        let router = Router::new()
            .route(
                "/fail",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "server error") }),
            )
            .layer(request_trace());

        let response = router
            .oneshot(Request::post("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&body_of(response).await[..], b"server error");
    }

    #[tokio::test]
    async fn test_plain_requests_pass_untouched() {
        let router = echo_router(SecurityConfig::default());
        let response = router
            .oneshot(Request::post("/").body(Body::from("hello")).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(HASH_HEADER).is_none());
        assert_eq!(&body_of(response).await[..], b"hello");
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let router = echo_router(SecurityConfig {
            hash_key: b"secret".to_vec(),
            private_key: None,
        });

        let missing = router
            .clone()
            .oneshot(sealed_request(b"{}", None, None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let wrong = router
            .oneshot(sealed_request(b"{}", Some(b"other"), None))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_rejected() {
        let router = echo_router(SecurityConfig::default());
        let request = Request::post("/")
            .header(CONTENT_ENCODING, ENCODING_GZIP)
            .body(Body::from("not gzip"))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_encrypted_body_without_key_is_rejected() {
        let router = echo_router(SecurityConfig::default());
        let request = Request::post("/")
            .header(CONTENT_ENCODING, ENCODING_ENCRYPTED)
            .body(Body::from(vec![0u8; 16]))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
