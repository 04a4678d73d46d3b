use axum::{response::IntoResponse, Json};
use serde_json::json;

pub async fn hello() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME") }))
}
