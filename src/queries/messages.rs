use uuid::Uuid;

use crate::error::AppResult;
use crate::models::messages::{MessageRow, NewMessage};
use crate::queries::db_error;

const MESSAGE_COLUMNS: &str =
    "m.id, m.chat_id, m.author_id, m.text, m.attachment_ref, m.created_at, m.deleted_at";

#[derive(sqlx::FromRow)]
pub struct ScoredMessageRow {
    #[sqlx(flatten)]
    pub message: MessageRow,
    pub cosine_similarity: f64,
}

pub async fn insert_message(
    conn: &mut sqlx::PgConnection,
    message: &NewMessage,
) -> AppResult<MessageRow> {
    sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (id, chat_id, author_id, text, attachment_ref, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, chat_id, author_id, text, attachment_ref, created_at, deleted_at",
    )
    .bind(&message.id)
    .bind(message.chat_id)
    .bind(message.author_id)
    .bind(message.text.as_deref())
    .bind(message.attachment_ref.as_deref())
    .bind(message.created_at)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to insert message"))
}

pub async fn set_message_embedding(
    conn: &mut sqlx::PgConnection,
    message_id: &str,
    embedding: &[f32],
) -> AppResult<()> {
    sqlx::query("UPDATE messages SET embedding = $1::vector WHERE id = $2")
        .bind(vector_literal(embedding))
        .bind(message_id)
        .execute(conn)
        .await
        .map_err(db_error("Failed to store message embedding"))?;

    Ok(())
}

pub async fn latest_messages(
    conn: &mut sqlx::PgConnection,
    chat_id: Uuid,
    limit: i64,
) -> AppResult<Vec<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages AS m
         WHERE m.chat_id = $1 AND m.deleted_at IS NULL
         ORDER BY m.id DESC
         LIMIT $2"
    ))
    .bind(chat_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to fetch messages"))
}

pub async fn messages_before(
    conn: &mut sqlx::PgConnection,
    chat_id: Uuid,
    before: &str,
    limit: i64,
) -> AppResult<Vec<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages AS m
         WHERE m.chat_id = $1 AND m.deleted_at IS NULL AND m.id < $2
         ORDER BY m.id DESC
         LIMIT $3"
    ))
    .bind(chat_id)
    .bind(before)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to fetch messages"))
}

pub async fn find_message(
    conn: &mut sqlx::PgConnection,
    message_id: &str,
) -> AppResult<Option<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages AS m WHERE m.id = $1"
    ))
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to load message"))
}

pub async fn update_message_text(
    conn: &mut sqlx::PgConnection,
    message_id: &str,
    text: &str,
) -> AppResult<Option<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(
        "UPDATE messages SET text = $1
         WHERE id = $2 AND deleted_at IS NULL
         RETURNING id, chat_id, author_id, text, attachment_ref, created_at, deleted_at",
    )
    .bind(text)
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to update message"))
}

pub async fn soft_delete_message(
    conn: &mut sqlx::PgConnection,
    message_id: &str,
) -> AppResult<Option<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(
        "UPDATE messages SET deleted_at = now()
         WHERE id = $1 AND deleted_at IS NULL
         RETURNING id, chat_id, author_id, text, attachment_ref, created_at, deleted_at",
    )
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to delete message"))
}

pub async fn search_messages(
    conn: &mut sqlx::PgConnection,
    chat_id: Uuid,
    query: &str,
    limit: i64,
) -> AppResult<Vec<MessageRow>> {
    sqlx::query_as::<_, MessageRow>(&format!(
        r"SELECT {MESSAGE_COLUMNS} FROM messages AS m
         WHERE m.chat_id = $1
           AND m.deleted_at IS NULL
           AND m.text ILIKE '%' || $2 || '%' ESCAPE '\'
         ORDER BY m.id DESC
         LIMIT $3"
    ))
    .bind(chat_id)
    .bind(escape_like(query))
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to search messages"))
}

pub async fn nearest_messages(
    conn: &mut sqlx::PgConnection,
    chat_id: Uuid,
    embedding: &[f32],
    limit: i64,
) -> AppResult<Vec<ScoredMessageRow>> {
    sqlx::query_as::<_, ScoredMessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS},
                (1 - (m.embedding <=> $2::vector))::float8 AS cosine_similarity
         FROM messages AS m
         WHERE m.chat_id = $1
           AND m.deleted_at IS NULL
           AND m.embedding IS NOT NULL
         ORDER BY m.embedding <=> $2::vector ASC
         LIMIT $3"
    ))
    .bind(chat_id)
    .bind(vector_literal(embedding))
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to run semantic search"))
}

/// pgvector text form, e.g. `[0.1,0.2,0.3]`.
pub fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
