pub mod control;
pub mod error;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::controller::Controller;

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .route("/modes", get(control::get_modes))
                .route("/modes/:name", get(control::get_mode_info))
                .route("/mode", post(control::set_mode))
                .route("/mode/param", post(control::set_mode_param))
                .route("/state", get(control::get_state))
                .with_state(controller),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
