use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::chats::{Chat, ChatSummary, Membership, NewChat};
use crate::models::messages::{
    Message, MessageRow, NewMessage, NewPoll, PollOptionRef, PollVote, ReadStatus,
};
use crate::queries::{chats, messages, polls};
use crate::store::MessageStore;

#[derive(Clone)]
pub struct PgMessageStore {
    db_pool: PgPool,
}

impl PgMessageStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    async fn conn(&self) -> AppResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.db_pool.acquire().await.map_err(|e| {
            tracing::error!(error = %e, "failed to acquire database connection");
            AppError::InternalServerError(anyhow!("Database connection failed"))
        })
    }

    async fn begin(&self) -> AppResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.db_pool.begin().await.map_err(|e| {
            tracing::error!(error = %e, "failed to start transaction");
            AppError::InternalServerError(anyhow!("Failed to start transaction"))
        })
    }

    async fn with_polls(
        conn: &mut sqlx::PgConnection,
        rows: Vec<MessageRow>,
    ) -> AppResult<Vec<Message>> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut polls = polls::load_polls(conn, &ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let poll = polls.remove(&row.id);
                row.into_message(poll)
            })
            .collect())
    }

    async fn with_poll(
        conn: &mut sqlx::PgConnection,
        row: Option<MessageRow>,
    ) -> AppResult<Option<Message>> {
        match row {
            Some(row) => Ok(Self::with_polls(conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

async fn commit(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> AppResult<()> {
    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "failed to commit transaction");
        AppError::InternalServerError(anyhow!("Failed to commit transaction"))
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_chat(&self, chat: NewChat) -> AppResult<Chat> {
        let mut conn = self.conn().await?;
        chats::insert_chat(&mut conn, Uuid::new_v4(), &chat).await
    }

    async fn find_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>> {
        let mut conn = self.conn().await?;
        chats::find_chat(&mut conn, chat_id).await
    }

    async fn membership(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<Option<Membership>> {
        let mut conn = self.conn().await?;
        chats::find_membership(&mut conn, user_id, chat_id).await
    }

    async fn insert_member(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        chats::insert_chat_member(&mut conn, user_id, chat_id).await
    }

    async fn list_user_chats(&self, user_id: Uuid) -> AppResult<Vec<ChatSummary>> {
        let mut conn = self.conn().await?;
        chats::get_user_chats(&mut conn, user_id).await
    }

    async fn insert_message(
        &self,
        message: NewMessage,
        embedding: Option<Vec<f32>>,
    ) -> AppResult<Message> {
        let mut tx = self.begin().await?;

        let row = messages::insert_message(&mut tx, &message).await?;
        if let Some(embedding) = embedding.as_deref() {
            messages::set_message_embedding(&mut tx, &row.id, embedding).await?;
        }

        commit(tx).await?;
        Ok(row.into_message(None))
    }

    async fn latest_messages(&self, chat_id: Uuid, limit: i64) -> AppResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::latest_messages(&mut conn, chat_id, limit).await?;
        Self::with_polls(&mut conn, rows).await
    }

    async fn messages_before(
        &self,
        chat_id: Uuid,
        before: &str,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::messages_before(&mut conn, chat_id, before, limit).await?;
        Self::with_polls(&mut conn, rows).await
    }

    async fn find_message(&self, message_id: &str) -> AppResult<Option<Message>> {
        let mut conn = self.conn().await?;
        let row = messages::find_message(&mut conn, message_id).await?;
        Self::with_poll(&mut conn, row).await
    }

    async fn update_message_text(&self, message_id: &str, text: &str) -> AppResult<Option<Message>> {
        let mut conn = self.conn().await?;
        let row = messages::update_message_text(&mut conn, message_id, text).await?;
        Self::with_poll(&mut conn, row).await
    }

    async fn soft_delete_message(&self, message_id: &str) -> AppResult<Option<Message>> {
        let mut conn = self.conn().await?;
        let row = messages::soft_delete_message(&mut conn, message_id).await?;
        Ok(row.map(|row| row.into_message(None)))
    }

    async fn upsert_read_status(
        &self,
        user_id: Uuid,
        chat_id: Uuid,
        last_seen_message_id: &str,
    ) -> AppResult<ReadStatus> {
        let mut conn = self.conn().await?;
        chats::upsert_read_status(&mut conn, user_id, chat_id, last_seen_message_id).await
    }

    async fn read_statuses(&self, chat_id: Uuid) -> AppResult<Vec<ReadStatus>> {
        let mut conn = self.conn().await?;
        chats::get_read_statuses(&mut conn, chat_id).await
    }

    async fn search_text(&self, chat_id: Uuid, query: &str, limit: i64) -> AppResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::search_messages(&mut conn, chat_id, query, limit).await?;
        Self::with_polls(&mut conn, rows).await
    }

    async fn nearest_messages(
        &self,
        chat_id: Uuid,
        embedding: &[f32],
        limit: i64,
    ) -> AppResult<Vec<(Message, f64)>> {
        let mut conn = self.conn().await?;
        let rows = messages::nearest_messages(&mut conn, chat_id, embedding, limit).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.message.into_message(None), row.cosine_similarity))
            .collect())
    }

    async fn create_poll(&self, poll: NewPoll) -> AppResult<Message> {
        let mut tx = self.begin().await?;

        let row = messages::insert_message(&mut tx, &poll.message).await?;
        polls::insert_poll(&mut tx, poll.poll_id, &row.id, &poll.title).await?;
        for (position, text) in poll.options.iter().enumerate() {
            polls::insert_poll_option(&mut tx, poll.poll_id, text, position as i32).await?;
        }
        let message = Self::with_poll(&mut tx, Some(row)).await?;

        commit(tx).await?;
        message.ok_or_else(|| AppError::InternalServerError(anyhow!("Failed to create poll")))
    }

    async fn find_poll_option(&self, option_id: Uuid) -> AppResult<Option<PollOptionRef>> {
        let mut conn = self.conn().await?;
        polls::find_poll_option(&mut conn, option_id).await
    }

    async fn record_vote(&self, user_id: Uuid, option: PollOptionRef) -> AppResult<PollVote> {
        let mut conn = self.conn().await?;
        polls::upsert_vote(&mut conn, user_id, &option).await
    }
}
