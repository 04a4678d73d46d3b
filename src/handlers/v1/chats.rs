use anyhow::anyhow;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    app_state::AppState,
    attachments,
    error::{AppError, AppResult},
    middlewares::auth::AuthUser,
    models::chats::ChatVisibility,
};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatPayload {
    #[validate(length(min = 1, max = 100, message = "Chat name must be 1-100 characters"))]
    pub name: String,
    pub visibility: ChatVisibility,
    #[validate(length(min = 4, max = 72, message = "Password must be 4-72 characters"))]
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinChatPayload {
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MessagesQuery {
    #[validate(custom(function = "crate::ids::validate_ulid"))]
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SearchQuery {
    #[validate(length(min = 3, message = "Search query must be at least 3 characters"))]
    pub query: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleMessagePayload {
    #[validate(length(max = 4000, message = "Message text is too long"))]
    pub text: Option<String>,
    #[validate(length(min = 1, max = 512, message = "Invalid attachment reference"))]
    pub attachment_ref: Option<String>,
    pub deliver_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlQuery {
    #[validate(
        length(min = 1, max = 255, message = "File name must be 1-255 characters"),
        custom(function = "plain_file_name")
    )]
    pub file_name: String,
    #[validate(length(min = 3, max = 127, message = "Invalid file type"))]
    pub file_type: String,
}

fn plain_file_name(name: &str) -> Result<(), validator::ValidationError> {
    if name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(validator::ValidationError::new("file_name")
            .with_message("File name must not contain a path".into()));
    }
    Ok(())
}

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<impl IntoResponse> {
    let chats = state.membership.list_user_chats(user.user_id).await?;
    Ok(Json(chats))
}

/// Creates a chat and makes the creator its first member.
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateChatPayload>,
) -> AppResult<impl IntoResponse> {
    payload.validate()?;

    let chat = state
        .membership
        .create_chat(&payload.name, payload.visibility, payload.password.as_deref())
        .await?;
    state
        .membership
        .join(user.user_id, chat.id, payload.password.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(chat)))
}

pub async fn join_chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    payload: Option<Json<JoinChatPayload>>,
) -> AppResult<impl IntoResponse> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    state
        .membership
        .join(user.user_id, chat_id, payload.password.as_deref())
        .await?;

    Ok((StatusCode::OK, Json(serde_json::json!({ "chatId": chat_id }))))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> AppResult<impl IntoResponse> {
    query.validate()?;
    state.membership.authorize(user.user_id, chat_id).await?;

    let page = state
        .history
        .get_messages(chat_id, query.cursor.as_deref(), query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn get_read_statuses(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.membership.authorize(user.user_id, chat_id).await?;
    let statuses = state.history.read_statuses(chat_id).await?;
    Ok(Json(statuses))
}

pub async fn search_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<SearchQuery>,
) -> AppResult<impl IntoResponse> {
    query.validate()?;
    state.membership.authorize(user.user_id, chat_id).await?;

    let messages = state.history.search_text(chat_id, &query.query).await?;
    Ok(Json(messages))
}

pub async fn semantic_search(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<SearchQuery>,
) -> AppResult<impl IntoResponse> {
    query.validate()?;
    state.membership.authorize(user.user_id, chat_id).await?;

    let results = state.search.search(chat_id, &query.query).await?;
    Ok(Json(results))
}

pub async fn schedule_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<ScheduleMessagePayload>,
) -> AppResult<impl IntoResponse> {
    payload.validate()?;

    let receipt = state
        .scheduler
        .schedule(
            user.user_id,
            chat_id,
            payload.text,
            payload.attachment_ref,
            payload.deliver_at,
        )
        .await?;

    let status = if receipt.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

/// Signs a direct upload; the returned `uniqueFileName` goes back as `attachmentRef`.
pub async fn get_upload_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<UploadUrlQuery>,
) -> AppResult<impl IntoResponse> {
    query.validate()?;

    let ticket = attachments::request_upload(state.signer.as_ref(), &query.file_name, &query.file_type)
        .await
        .map_err(|e| {
            tracing::warn!(user_id = %user.user_id, error = %e, "upload url unavailable");
            AppError::ServiceUnavailable(anyhow!("Uploads are temporarily unavailable"))
        })?;
    Ok(Json(ticket))
}
