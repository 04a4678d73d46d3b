pub mod chats;
use crate::app_state::AppState;
use axum::Router;

pub fn v1_routes(state: AppState) -> Router<AppState> {
    Router::new().nest("/chats", chats::chats_routes(state))
}
