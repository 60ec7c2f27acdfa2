mod backfill;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::ServerState;

pub struct AppRouter;

impl AppRouter {
    pub fn create(state: ServerState) -> Router {
        Router::new()
            .route("/", get(|| async { "OK" }))
            .nest(
                "/backfill",
                Router::new()
                    .route("/jobs", get(backfill::list_jobs).post(backfill::start_job))
                    .route("/jobs/:id", get(backfill::get_job))
                    .route("/jobs/:id/stop", post(backfill::stop_job))
                    .route("/stop", post(backfill::stop_all)),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(state)
            .fallback(handler_404)
    }
}

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Route does not exist")
}
