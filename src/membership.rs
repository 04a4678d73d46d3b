//! Who may act on a chat.

use std::sync::Arc;

use anyhow::anyhow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::chats::{ChatSummary, ChatVisibility, NewChat};
use crate::store::MessageStore;

#[derive(Clone)]
pub struct MembershipService {
    store: Arc<dyn MessageStore>,
}

impl MembershipService {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Public chats admit everyone; private chats admit members only. A
    /// missing chat is reported before any membership check.
    pub async fn authorize(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<()> {
        let membership = self
            .store
            .membership(user_id, chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Chat not found")))?;

        match membership.visibility {
            ChatVisibility::Public => Ok(()),
            ChatVisibility::Private if membership.is_member => Ok(()),
            ChatVisibility::Private => Err(AppError::Unauthorized(anyhow!(
                "user {} is not a member of private chat {}",
                user_id,
                chat_id
            ))),
        }
    }

    /// Adds the user to the chat. Joining twice is not an error and never
    /// duplicates the membership.
    pub async fn join(&self, user_id: Uuid, chat_id: Uuid, password: Option<&str>) -> AppResult<()> {
        let chat = self
            .store
            .find_chat(chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Chat not found")))?;

        if chat.visibility == ChatVisibility::Private {
            let membership = self.store.membership(user_id, chat_id).await?;
            if !membership.is_some_and(|m| m.is_member) {
                let hash = chat.password_hash.as_deref().ok_or_else(|| {
                    AppError::InternalServerError(anyhow!("private chat {} has no password", chat_id))
                })?;
                let password = password
                    .ok_or_else(|| AppError::Unauthorized(anyhow!("password required")))?;
                verify_password(password, hash)?;
            }
        }

        if self.store.insert_member(user_id, chat_id).await? {
            tracing::info!(%user_id, %chat_id, "user joined chat");
        }
        Ok(())
    }

    pub async fn create_chat(
        &self,
        name: &str,
        visibility: ChatVisibility,
        password: Option<&str>,
    ) -> AppResult<ChatSummary> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest(anyhow!("Chat name is required")));
        }

        let password_hash = match (visibility, password) {
            (ChatVisibility::Public, None) => None,
            (ChatVisibility::Public, Some(_)) => {
                return Err(AppError::BadRequest(anyhow!(
                    "Public chats cannot have a password"
                )))
            }
            (ChatVisibility::Private, None) => {
                return Err(AppError::BadRequest(anyhow!(
                    "Private chats require a password"
                )))
            }
            (ChatVisibility::Private, Some(password)) => Some(hash_password(password).await?),
        };

        let chat = self
            .store
            .create_chat(NewChat {
                name: name.to_string(),
                visibility,
                password_hash,
            })
            .await?;

        tracing::info!(chat_id = %chat.id, ?visibility, "chat created");
        Ok(ChatSummary::from(&chat))
    }

    pub async fn list_user_chats(&self, user_id: Uuid) -> AppResult<Vec<ChatSummary>> {
        self.store.list_user_chats(user_id).await
    }
}

async fn hash_password(password: &str) -> AppResult<String> {
    let password = password.to_string();
    // bcrypt is CPU bound; keep it off the async workers.
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| AppError::InternalServerError(anyhow!("hashing task failed: {}", e)))?
        .map_err(|e| AppError::InternalServerError(anyhow!("Failed to hash password: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> AppResult<()> {
    match bcrypt::verify(password, hash) {
        Ok(true) => Ok(()),
        Ok(false) => Err(AppError::Unauthorized(anyhow!("wrong chat password"))),
        Err(e) => Err(AppError::InternalServerError(anyhow!(
            "Failed to verify password: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryMessageStore;

    fn service() -> MembershipService {
        MembershipService::new(Arc::new(InMemoryMessageStore::new()))
    }

    #[tokio::test]
    async fn public_chat_admits_everyone() {
        let service = service();
        let chat = service
            .create_chat("general", ChatVisibility::Public, None)
            .await
            .unwrap();
        assert!(service.authorize(Uuid::new_v4(), chat.id).await.is_ok());
        assert!(service.join(Uuid::new_v4(), chat.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn missing_chat_is_not_found() {
        let err = service()
            .authorize(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn private_chat_requires_membership_or_password() {
        let service = service();
        let chat = service
            .create_chat("secret", ChatVisibility::Private, Some("hunter22"))
            .await
            .unwrap();
        let user = Uuid::new_v4();

        let err = service.authorize(user, chat.id).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let err = service.join(user, chat.id, Some("wrong")).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert_eq!(err.public_message(), "Unauthorized");

        service.join(user, chat.id, Some("hunter22")).await.unwrap();
        service.join(user, chat.id, None).await.unwrap();
        assert!(service.authorize(user, chat.id).await.is_ok());
    }

    #[tokio::test]
    async fn chat_password_rules() {
        let service = service();
        assert!(matches!(
            service
                .create_chat("general", ChatVisibility::Public, Some("pw"))
                .await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            service.create_chat("secret", ChatVisibility::Private, None).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            service.create_chat("   ", ChatVisibility::Public, None).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn private_chats_are_listed_only_for_members() {
        let service = service();
        let member = Uuid::new_v4();
        let public = service
            .create_chat("general", ChatVisibility::Public, None)
            .await
            .unwrap();
        let private = service
            .create_chat("secret", ChatVisibility::Private, Some("pw"))
            .await
            .unwrap();
        service.join(member, private.id, Some("pw")).await.unwrap();

        let outsider_chats = service.list_user_chats(Uuid::new_v4()).await.unwrap();
        assert_eq!(outsider_chats, vec![public.clone()]);

        let member_chats = service.list_user_chats(member).await.unwrap();
        assert_eq!(member_chats, vec![public, private]);
    }

    #[tokio::test]
    async fn rejoining_keeps_a_single_membership() {
        let store = Arc::new(InMemoryMessageStore::new());
        let service = MembershipService::new(store.clone());
        let private = service
            .create_chat("secret", ChatVisibility::Private, Some("pw"))
            .await
            .unwrap();
        let user = Uuid::new_v4();

        service.join(user, private.id, Some("pw")).await.unwrap();
        service.join(user, private.id, Some("pw")).await.unwrap();
        service.join(user, private.id, None).await.unwrap();

        assert!(!store.insert_member(user, private.id).await.unwrap());
        assert_eq!(service.list_user_chats(user).await.unwrap(), vec![private]);
    }
}
