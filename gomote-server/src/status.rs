//! Status page served to non-RPC traffic on the primary listener.

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::any;

/// Body of the status page.
pub const STATUS_BODY: &str = "gomote status page placeholder";

/// Body of every other path.
pub const NOT_FOUND_BODY: &str = "404 page not found\n";

/// Router for the fallback side of the multiplexer.
///
/// `/` answers any method with the status page; every other path is 404.
pub fn router() -> Router {
    Router::new()
        .route("/", any(handle_status))
        .fallback(handle_not_found)
}

async fn handle_status() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], STATUS_BODY)
}

async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        NOT_FOUND_BODY,
    )
}
