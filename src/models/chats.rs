use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "chat_visibility", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatVisibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub name: String,
    pub visibility: ChatVisibility,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: Uuid,
    pub name: String,
    pub visibility: ChatVisibility,
}

impl From<&Chat> for ChatSummary {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id,
            name: chat.name.clone(),
            visibility: chat.visibility,
        }
    }
}

/// Visibility of a chat together with whether a given user holds a membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Membership {
    pub visibility: ChatVisibility,
    pub is_member: bool,
}

#[derive(Debug, Clone)]
pub struct NewChat {
    pub name: String,
    pub visibility: ChatVisibility,
    pub password_hash: Option<String>,
}
