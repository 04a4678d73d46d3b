//! Durable persistence of chats, memberships, messages, polls and read state.
//!
//! Callers only see [`MessageStore`]; whether a query is a typed CRUD call or
//! the raw cosine-distance scan is an implementation detail of the backend.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::chats::{Chat, ChatSummary, Membership, NewChat};
use crate::models::messages::{
    Message, NewMessage, NewPoll, PollOptionRef, PollVote, ReadStatus,
};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_chat(&self, chat: NewChat) -> AppResult<Chat>;

    async fn find_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>>;

    /// Chat visibility and membership of `user_id` in one lookup. `None` when
    /// the chat does not exist.
    async fn membership(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<Option<Membership>>;

    /// Returns `false` when the membership row already existed.
    async fn insert_member(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<bool>;

    /// Public chats plus the private chats `user_id` belongs to.
    async fn list_user_chats(&self, user_id: Uuid) -> AppResult<Vec<ChatSummary>>;

    /// Persists the message and, when given, its embedding in one transaction.
    async fn insert_message(
        &self,
        message: NewMessage,
        embedding: Option<Vec<f32>>,
    ) -> AppResult<Message>;

    /// Newest live messages of a chat, newest first.
    async fn latest_messages(&self, chat_id: Uuid, limit: i64) -> AppResult<Vec<Message>>;

    /// Live messages strictly older than `before`, newest first.
    async fn messages_before(
        &self,
        chat_id: Uuid,
        before: &str,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    /// Finds a message whether or not it has been soft-deleted.
    async fn find_message(&self, message_id: &str) -> AppResult<Option<Message>>;

    /// `None` when the message does not exist or is deleted.
    async fn update_message_text(&self, message_id: &str, text: &str) -> AppResult<Option<Message>>;

    /// `None` when the message does not exist or is already deleted.
    async fn soft_delete_message(&self, message_id: &str) -> AppResult<Option<Message>>;

    async fn upsert_read_status(
        &self,
        user_id: Uuid,
        chat_id: Uuid,
        last_seen_message_id: &str,
    ) -> AppResult<ReadStatus>;

    async fn read_statuses(&self, chat_id: Uuid) -> AppResult<Vec<ReadStatus>>;

    /// Case-insensitive substring match on live messages, newest first.
    async fn search_text(&self, chat_id: Uuid, query: &str, limit: i64) -> AppResult<Vec<Message>>;

    /// Live, embedded messages ordered by cosine distance to `embedding`,
    /// paired with their cosine similarity.
    async fn nearest_messages(
        &self,
        chat_id: Uuid,
        embedding: &[f32],
        limit: i64,
    ) -> AppResult<Vec<(Message, f64)>>;

    /// Creates the carrier message, the poll and its options atomically.
    async fn create_poll(&self, poll: NewPoll) -> AppResult<Message>;

    async fn find_poll_option(&self, option_id: Uuid) -> AppResult<Option<PollOptionRef>>;

    /// Records the user's vote on a poll, replacing any earlier vote they cast on it.
    async fn record_vote(&self, user_id: Uuid, option: PollOptionRef) -> AppResult<PollVote>;
}
