mod index;
mod realtime;
mod v1;
use crate::app_state::AppState;
use axum::{http::header, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn create_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .merge(index::index_route())
        .merge(realtime::websocket_routes(state.clone()))
        .nest("/api/v1", v1::v1_routes(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
