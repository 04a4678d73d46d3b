use crate::handlers::v1::chats;
use crate::{app_state::AppState, middlewares::auth::auth_middleware};
use axum::routing::{get, post};
use axum::{middleware, Router};

pub fn chats_routes(state: AppState) -> Router<AppState> {
    // Every chat route requires a bearer token
    Router::new()
        .route("/list", get(chats::list_chats))
        .route("/create", post(chats::create_chat))
        .route("/join/{chat_id}", post(chats::join_chat))
        .route("/upload-url", get(chats::get_upload_url))
        .route("/{chat_id}/messages", get(chats::get_messages))
        .route("/{chat_id}/read-status", get(chats::get_read_statuses))
        .route("/{chat_id}/search", get(chats::search_messages))
        .route("/{chat_id}/semantic-search", get(chats::semantic_search))
        .route("/{chat_id}/schedule", post(chats::schedule_message))
        .layer(middleware::from_fn_with_state(state, auth_middleware))
}
