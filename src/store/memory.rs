//! In-process [`MessageStore`] used by tests and local experiments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::chats::{Chat, ChatSummary, ChatVisibility, Membership, NewChat};
use crate::models::messages::{
    Message, NewMessage, NewPoll, Poll, PollOption, PollOptionRef, PollVote, PollVoter,
    ReadStatus,
};
use crate::store::MessageStore;

struct StoredMessage {
    message: Message,
    embedding: Option<Vec<f32>>,
}

struct StoredPoll {
    id: Uuid,
    title: String,
    options: Vec<(Uuid, String)>,
}

#[derive(Default)]
struct State {
    chats: HashMap<Uuid, Chat>,
    chat_order: Vec<Uuid>,
    members: HashMap<(Uuid, Uuid), ()>,
    messages: HashMap<Uuid, BTreeMap<String, StoredMessage>>,
    message_chat: HashMap<String, Uuid>,
    polls: HashMap<String, StoredPoll>,
    options: HashMap<Uuid, (PollOptionRef, String)>,
    votes: HashMap<(Uuid, Uuid), PollVote>,
    read_statuses: HashMap<(Uuid, Uuid), ReadStatus>,
}

impl State {
    fn stored(&self, message_id: &str) -> Option<&StoredMessage> {
        let chat_id = self.message_chat.get(message_id)?;
        self.messages.get(chat_id)?.get(message_id)
    }

    fn stored_mut(&mut self, message_id: &str) -> Option<&mut StoredMessage> {
        let chat_id = *self.message_chat.get(message_id)?;
        self.messages.get_mut(&chat_id)?.get_mut(message_id)
    }

    fn poll_for(&self, message_id: &str) -> Option<Poll> {
        let stored = self.polls.get(message_id)?;
        let options = stored
            .options
            .iter()
            .map(|(option_id, text)| {
                let mut votes: Vec<&PollVote> = self
                    .votes
                    .values()
                    .filter(|vote| vote.option_id == *option_id)
                    .collect();
                votes.sort_by_key(|vote| vote.created_at);
                PollOption {
                    id: *option_id,
                    text: text.clone(),
                    votes: votes
                        .into_iter()
                        .map(|vote| PollVoter {
                            user_id: vote.user_id,
                        })
                        .collect(),
                }
            })
            .collect();

        Some(Poll {
            id: stored.id,
            title: stored.title.clone(),
            options,
        })
    }

    fn hydrate(&self, message: &Message) -> Message {
        let mut message = message.clone();
        message.poll = self.poll_for(&message.id);
        message
    }

    fn live_messages_desc(&self, chat_id: Uuid) -> impl Iterator<Item = &StoredMessage> {
        self.messages
            .get(&chat_id)
            .into_iter()
            .flat_map(|messages| messages.values().rev())
            .filter(|stored| !stored.message.is_deleted())
    }

    fn insert(&mut self, message: NewMessage, embedding: Option<Vec<f32>>) -> Message {
        let message = Message {
            id: message.id,
            chat_id: message.chat_id,
            author_id: message.author_id,
            text: message.text,
            attachment_ref: message.attachment_ref,
            created_at: message.created_at,
            deleted_at: None,
            poll: None,
        };
        self.message_chat.insert(message.id.clone(), message.chat_id);
        self.messages.entry(message.chat_id).or_default().insert(
            message.id.clone(),
            StoredMessage {
                message: message.clone(),
                embedding,
            },
        );
        message
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    state: RwLock<State>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_chat(&self, chat: NewChat) -> AppResult<Chat> {
        let chat = Chat {
            id: Uuid::new_v4(),
            name: chat.name,
            visibility: chat.visibility,
            password_hash: chat.password_hash,
            created_at: Utc::now(),
        };
        let mut state = self.write();
        state.chat_order.push(chat.id);
        state.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn find_chat(&self, chat_id: Uuid) -> AppResult<Option<Chat>> {
        Ok(self.read().chats.get(&chat_id).cloned())
    }

    async fn membership(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<Option<Membership>> {
        let state = self.read();
        Ok(state.chats.get(&chat_id).map(|chat| Membership {
            visibility: chat.visibility,
            is_member: state.members.contains_key(&(user_id, chat_id)),
        }))
    }

    async fn insert_member(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<bool> {
        Ok(self.write().members.insert((user_id, chat_id), ()).is_none())
    }

    async fn list_user_chats(&self, user_id: Uuid) -> AppResult<Vec<ChatSummary>> {
        let state = self.read();
        Ok(state
            .chat_order
            .iter()
            .filter_map(|id| state.chats.get(id))
            .filter(|chat| {
                chat.visibility == ChatVisibility::Public
                    || state.members.contains_key(&(user_id, chat.id))
            })
            .map(ChatSummary::from)
            .collect())
    }

    async fn insert_message(
        &self,
        message: NewMessage,
        embedding: Option<Vec<f32>>,
    ) -> AppResult<Message> {
        Ok(self.write().insert(message, embedding))
    }

    async fn latest_messages(&self, chat_id: Uuid, limit: i64) -> AppResult<Vec<Message>> {
        let state = self.read();
        Ok(state
            .live_messages_desc(chat_id)
            .take(limit.max(0) as usize)
            .map(|stored| state.hydrate(&stored.message))
            .collect())
    }

    async fn messages_before(
        &self,
        chat_id: Uuid,
        before: &str,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let state = self.read();
        Ok(state
            .live_messages_desc(chat_id)
            .filter(|stored| stored.message.id.as_str() < before)
            .take(limit.max(0) as usize)
            .map(|stored| state.hydrate(&stored.message))
            .collect())
    }

    async fn find_message(&self, message_id: &str) -> AppResult<Option<Message>> {
        let state = self.read();
        Ok(state
            .stored(message_id)
            .map(|stored| state.hydrate(&stored.message)))
    }

    async fn update_message_text(&self, message_id: &str, text: &str) -> AppResult<Option<Message>> {
        let mut state = self.write();
        let Some(stored) = state.stored_mut(message_id) else {
            return Ok(None);
        };
        if stored.message.is_deleted() {
            return Ok(None);
        }
        stored.message.text = Some(text.to_string());
        let message = stored.message.clone();
        Ok(Some(state.hydrate(&message)))
    }

    async fn soft_delete_message(&self, message_id: &str) -> AppResult<Option<Message>> {
        let mut state = self.write();
        let Some(stored) = state.stored_mut(message_id) else {
            return Ok(None);
        };
        if stored.message.is_deleted() {
            return Ok(None);
        }
        stored.message.deleted_at = Some(Utc::now());
        Ok(Some(stored.message.clone()))
    }

    async fn upsert_read_status(
        &self,
        user_id: Uuid,
        chat_id: Uuid,
        last_seen_message_id: &str,
    ) -> AppResult<ReadStatus> {
        let mut state = self.write();
        let status = state
            .read_statuses
            .entry((user_id, chat_id))
            .and_modify(|status| {
                status.last_seen_message_id = last_seen_message_id.to_string();
                status.updated_at = Utc::now();
            })
            .or_insert_with(|| ReadStatus {
                id: Uuid::new_v4(),
                user_id,
                chat_id,
                last_seen_message_id: last_seen_message_id.to_string(),
                updated_at: Utc::now(),
            });
        Ok(status.clone())
    }

    async fn read_statuses(&self, chat_id: Uuid) -> AppResult<Vec<ReadStatus>> {
        let state = self.read();
        let mut statuses: Vec<ReadStatus> = state
            .read_statuses
            .values()
            .filter(|status| status.chat_id == chat_id)
            .cloned()
            .collect();
        statuses.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(statuses)
    }

    async fn search_text(&self, chat_id: Uuid, query: &str, limit: i64) -> AppResult<Vec<Message>> {
        let needle = query.to_lowercase();
        let state = self.read();
        Ok(state
            .live_messages_desc(chat_id)
            .filter(|stored| {
                stored
                    .message
                    .text
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
            })
            .take(limit.max(0) as usize)
            .map(|stored| state.hydrate(&stored.message))
            .collect())
    }

    async fn nearest_messages(
        &self,
        chat_id: Uuid,
        embedding: &[f32],
        limit: i64,
    ) -> AppResult<Vec<(Message, f64)>> {
        let state = self.read();
        let mut scored: Vec<(Message, f64)> = state
            .live_messages_desc(chat_id)
            .filter_map(|stored| {
                let stored_embedding = stored.embedding.as_deref()?;
                Some((
                    stored.message.clone(),
                    cosine_similarity(stored_embedding, embedding),
                ))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit.max(0) as usize);
        Ok(scored)
    }

    async fn create_poll(&self, poll: NewPoll) -> AppResult<Message> {
        let mut state = self.write();
        let chat_id = poll.message.chat_id;
        let message = state.insert(poll.message, None);

        let options: Vec<(Uuid, String)> = poll
            .options
            .into_iter()
            .map(|text| (Uuid::new_v4(), text))
            .collect();
        for (option_id, _) in &options {
            state.options.insert(
                *option_id,
                (
                    PollOptionRef {
                        option_id: *option_id,
                        poll_id: poll.poll_id,
                        chat_id,
                    },
                    message.id.clone(),
                ),
            );
        }
        state.polls.insert(
            message.id.clone(),
            StoredPoll {
                id: poll.poll_id,
                title: poll.title,
                options,
            },
        );

        Ok(state.hydrate(&message))
    }

    async fn find_poll_option(&self, option_id: Uuid) -> AppResult<Option<PollOptionRef>> {
        let state = self.read();
        Ok(state
            .options
            .get(&option_id)
            .filter(|(_, message_id)| {
                state
                    .stored(message_id)
                    .is_some_and(|stored| !stored.message.is_deleted())
            })
            .map(|(option, _)| *option))
    }

    async fn record_vote(&self, user_id: Uuid, option: PollOptionRef) -> AppResult<PollVote> {
        let vote = PollVote {
            id: Uuid::new_v4(),
            poll_id: option.poll_id,
            option_id: option.option_id,
            user_id,
            created_at: Utc::now(),
        };
        self.write()
            .votes
            .insert((option.poll_id, user_id), vote.clone());
        Ok(vote)
    }
}
