use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message as persisted and as held in the recent-message cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: Uuid,
    pub author_id: Uuid,
    pub text: Option<String>,
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<Poll>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: Uuid,
    pub author_id: Uuid,
    pub text: Option<String>,
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    pub fn into_message(self, poll: Option<Poll>) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            author_id: self.author_id,
            text: self.text,
            attachment_ref: self.attachment_ref,
            created_at: self.created_at,
            deleted_at: self.deleted_at,
            poll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: Uuid,
    pub title: String,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: Uuid,
    pub text: String,
    pub votes: Vec<PollVoter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollVoter {
    pub user_id: Uuid,
}

/// Where a poll option lives, used to check a vote targets the chat it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct PollOptionRef {
    pub option_id: Uuid,
    pub poll_id: Uuid,
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PollVote {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatus {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chat_id: Uuid,
    pub last_seen_message_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub chat_id: Uuid,
    pub author_id: Uuid,
    pub text: Option<String>,
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPoll {
    pub poll_id: Uuid,
    pub message: NewMessage,
    pub title: String,
    pub options: Vec<String>,
}

/// A message as handed to clients, with its attachment resolved to a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub attachment_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMessage {
    #[serde(flatten)]
    pub message: MessageView,
    pub cosine_similarity: Option<f64>,
}

/// How much of a head read the recent-message cache answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheProvenance {
    #[serde(rename = "true")]
    Full,
    #[serde(rename = "partial")]
    Partial,
    #[serde(rename = "false")]
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub data: Vec<MessageView>,
    pub from_cache: CacheProvenance,
    /// False only when nothing older than the first entry of `data` exists.
    pub has_more: bool,
}
