use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::handlers::{
    adduser_handler, archive_handler, download_handler, health_handler, login_handler,
    shortlink_handler, upload_handler, websocket_handler,
};
use crate::infra::app_state::AppState;

/// Build the application router. Static assets, when configured, are
/// served for every path no route claims.
pub fn create_app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/ws", get(websocket_handler))
        .route(
            "/upload",
            post(upload_handler).layer(DefaultBodyLimit::disable()),
        )
        .route("/login", post(login_handler))
        .route("/adduser", post(adduser_handler))
        .route("/~/{*path}", get(download_handler))
        .route("/$/{link}", get(shortlink_handler))
        .route("/$$/{*path}", get(archive_handler))
        .route("/health", get(health_handler));

    if let Some(assets) = &state.config.storage.assets_dir {
        router = router.fallback_service(ServeDir::new(assets));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
