use uuid::Uuid;

use crate::error::AppResult;
use crate::models::chats::{Chat, ChatSummary, ChatVisibility, Membership, NewChat};
use crate::models::messages::ReadStatus;
use crate::queries::db_error;

pub async fn insert_chat(
    conn: &mut sqlx::PgConnection,
    id: Uuid,
    chat: &NewChat,
) -> AppResult<Chat> {
    let chat = sqlx::query_as::<_, Chat>(
        "INSERT INTO chats (id, name, visibility, password_hash) VALUES ($1, $2, $3, $4)
         RETURNING id, name, visibility, password_hash, created_at",
    )
    .bind(id)
    .bind(&chat.name)
    .bind(chat.visibility)
    .bind(chat.password_hash.as_deref())
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to create chat"))?;

    Ok(chat)
}

pub async fn find_chat(conn: &mut sqlx::PgConnection, chat_id: Uuid) -> AppResult<Option<Chat>> {
    sqlx::query_as::<_, Chat>(
        "SELECT id, name, visibility, password_hash, created_at FROM chats WHERE id = $1",
    )
    .bind(chat_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to load chat"))
}

pub async fn find_membership(
    conn: &mut sqlx::PgConnection,
    user_id: Uuid,
    chat_id: Uuid,
) -> AppResult<Option<Membership>> {
    sqlx::query_as::<_, Membership>(
        "SELECT c.visibility, (cm.user_id IS NOT NULL) AS is_member
         FROM chats AS c
         LEFT JOIN chat_members AS cm ON cm.chat_id = c.id AND cm.user_id = $1
         WHERE c.id = $2
         LIMIT 1",
    )
    .bind(user_id)
    .bind(chat_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("Failed to validate membership"))
}

pub async fn insert_chat_member(
    conn: &mut sqlx::PgConnection,
    user_id: Uuid,
    chat_id: Uuid,
) -> AppResult<bool> {
    let result = sqlx::query(
        "INSERT INTO chat_members (user_id, chat_id) VALUES ($1, $2)
         ON CONFLICT (user_id, chat_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(chat_id)
    .execute(conn)
    .await
    .map_err(db_error("Failed to create chat member"))?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_user_chats(
    conn: &mut sqlx::PgConnection,
    user_id: Uuid,
) -> AppResult<Vec<ChatSummary>> {
    sqlx::query_as::<_, ChatSummary>(
        "SELECT c.id, c.name, c.visibility
         FROM chats AS c
         WHERE c.visibility = $2
            OR EXISTS (
                SELECT 1 FROM chat_members AS cm
                WHERE cm.chat_id = c.id AND cm.user_id = $1
            )
         ORDER BY c.created_at ASC",
    )
    .bind(user_id)
    .bind(ChatVisibility::Public)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to list chats"))
}

pub async fn upsert_read_status(
    conn: &mut sqlx::PgConnection,
    user_id: Uuid,
    chat_id: Uuid,
    last_seen_message_id: &str,
) -> AppResult<ReadStatus> {
    sqlx::query_as::<_, ReadStatus>(
        "INSERT INTO read_statuses (id, user_id, chat_id, last_seen_message_id)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id, chat_id)
         DO UPDATE SET last_seen_message_id = EXCLUDED.last_seen_message_id, updated_at = now()
         RETURNING id, user_id, chat_id, last_seen_message_id, updated_at",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(chat_id)
    .bind(last_seen_message_id)
    .fetch_one(conn)
    .await
    .map_err(db_error("Failed to mark message as read"))
}

pub async fn get_read_statuses(
    conn: &mut sqlx::PgConnection,
    chat_id: Uuid,
) -> AppResult<Vec<ReadStatus>> {
    sqlx::query_as::<_, ReadStatus>(
        "SELECT id, user_id, chat_id, last_seen_message_id, updated_at
         FROM read_statuses WHERE chat_id = $1
         ORDER BY updated_at DESC",
    )
    .bind(chat_id)
    .fetch_all(conn)
    .await
    .map_err(db_error("Failed to load read status"))
}
