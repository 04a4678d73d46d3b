use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::messages::{MessageView, PollVote, ReadStatus};

/// Events a client sends over the `/chat` socket, framed as `{"event": .., "data": ..}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "ping")]
    Ping(ChatConnection),
    #[serde(rename = "chat:join")]
    Join(ChatConnection),
    #[serde(rename = "chat:leave")]
    Leave(ChatConnection),
    #[serde(rename = "message:send")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "message:update")]
    UpdateMessage(UpdateMessagePayload),
    #[serde(rename = "message:delete")]
    DeleteMessage(DeleteMessagePayload),
    #[serde(rename = "message:read")]
    ReadMessage(ReadMessagePayload),
    #[serde(rename = "poll:create")]
    CreatePoll(CreatePollPayload),
    #[serde(rename = "poll:vote")]
    VotePoll(VotePollPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::Join(_) => "chat:join",
            Self::Leave(_) => "chat:leave",
            Self::SendMessage(_) => "message:send",
            Self::UpdateMessage(_) => "message:update",
            Self::DeleteMessage(_) => "message:delete",
            Self::ReadMessage(_) => "message:read",
            Self::CreatePoll(_) => "poll:create",
            Self::VotePoll(_) => "poll:vote",
        }
    }

    /// Chat named by the payload, if any. Update and delete only carry a message id.
    pub fn chat_id(&self) -> Option<Uuid> {
        match self {
            Self::Ping(p) | Self::Join(p) | Self::Leave(p) => Some(p.chat_id),
            Self::SendMessage(p) => Some(p.chat_id),
            Self::ReadMessage(p) => Some(p.chat_id),
            Self::CreatePoll(p) => Some(p.chat_id),
            Self::VotePoll(p) => Some(p.chat_id),
            Self::UpdateMessage(_) | Self::DeleteMessage(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConnection {
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub chat_id: Uuid,
    #[validate(length(max = 4000, message = "Message text is too long"))]
    pub text: Option<String>,
    #[validate(length(min = 1, max = 512, message = "Invalid attachment reference"))]
    pub attachment_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessagePayload {
    #[validate(custom(function = "crate::ids::validate_ulid"))]
    pub message_id: String,
    #[validate(length(min = 1, max = 4000, message = "Message text must be 1-4000 characters"))]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessagePayload {
    #[validate(custom(function = "crate::ids::validate_ulid"))]
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessagePayload {
    pub chat_id: Uuid,
    #[validate(custom(function = "crate::ids::validate_ulid"))]
    pub last_seen_message_id: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollPayload {
    pub chat_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "Poll title is required"))]
    pub title: String,
    #[validate(length(min = 2, max = 20, message = "A poll needs between 2 and 20 options"))]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePollPayload {
    pub chat_id: Uuid,
    pub option_id: Uuid,
}

/// Events the server pushes to connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user:online")]
    UserOnline {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },
    #[serde(rename = "chat:join")]
    UserJoined {
        #[serde(rename = "userId")]
        user_id: Uuid,
    },
    #[serde(rename = "chat:leave")]
    Left {
        #[serde(rename = "chatId")]
        chat_id: Uuid,
    },
    #[serde(rename = "message:sent")]
    MessageSent(MessageView),
    #[serde(rename = "message:updated")]
    MessageUpdated {
        #[serde(rename = "messageId")]
        message_id: String,
        text: String,
    },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "message:seen")]
    MessageSeen(ReadStatus),
    #[serde(rename = "poll:created")]
    PollCreated(MessageView),
    #[serde(rename = "poll:receive:vote")]
    PollVoteReceived(PollVote),
    #[serde(rename = "exception")]
    Exception {
        status: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}
