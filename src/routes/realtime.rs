use crate::{app_state::AppState, middlewares::auth::auth_middleware, websocket::handlers::websocket_handler};
use axum::{middleware, routing::get, Router};

pub fn websocket_routes(state: AppState) -> Router<AppState> {
    // Authenticated before the upgrade so a bad token never gets a socket
    Router::new()
        .route("/chat", get(websocket_handler))
        .layer(middleware::from_fn_with_state(state, auth_middleware))
}
