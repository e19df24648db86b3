// Router assembly
//
// The body-carrying POST routes sit behind the full inbound security chain.
// The GET routes carry no body and only get request logging.

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;

use super::handlers::{self, AppState};
use super::middleware::{self, SecurityConfig};

/// Builds the collector service's router.
///
/// Layers added later wrap the ones added earlier, so the POST chain is
/// listed innermost first.
pub fn build_router(state: AppState, security: SecurityConfig) -> Router {
    let security = Arc::new(security);

    let secured = Router::new()
        .route("/update/:kind/:id/:value", post(handlers::update_plain))
        .route("/update", post(handlers::update_json))
        .route("/updates", post(handlers::update_batch))
        .route("/value", post(handlers::get_json))
        .layer(middleware::request_trace())
        .layer(from_fn_with_state(
            Arc::clone(&security),
            middleware::verify_hash,
        ))
        .layer(from_fn(middleware::gunzip))
        .layer(from_fn_with_state(security, middleware::decrypt));

    let open = Router::new()
        .route("/", get(handlers::index))
        .route("/value/:kind/:id", get(handlers::get_plain))
        .route("/ping", get(handlers::ping))
        .layer(middleware::request_trace());

    secured.merge(open).with_state(state)
}
