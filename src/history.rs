//! Message history: the single write path for chat content and the hybrid
//! cache/store read path.
//!
//! Head reads (no cursor) are served from the recent-message cache when it
//! holds a full window; otherwise the store backfills whatever is older than
//! the oldest cached entry. Paged reads always go to the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use uuid::Uuid;

use crate::attachments::{self, AttachmentSigner};
use crate::cache::{RecentMessageCache, RECENT_CAPACITY};
use crate::error::{AppError, AppResult};
use crate::ids::{self, IdGenerator};
use crate::llm::LanguageModel;
use crate::models::messages::{
    CacheProvenance, Message, MessagePage, MessageView, NewMessage, NewPoll, PollVote,
    ReadStatus,
};
use crate::store::MessageStore;

pub const MAX_PAGE_LIMIT: i64 = 250;
pub const DEFAULT_PAGE_LIMIT: i64 = RECENT_CAPACITY as i64;
pub const SEARCH_LIMIT: i64 = 20;
pub const MIN_SEARCH_QUERY_LEN: usize = 3;
pub const MAX_TEXT_LEN: usize = 4000;

#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn MessageStore>,
    cache: RecentMessageCache,
    ids: Arc<IdGenerator>,
    signer: Arc<dyn AttachmentSigner>,
    attachment_ttl: Duration,
    embedder: Option<Arc<dyn LanguageModel>>,
}

impl HistoryService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        cache: RecentMessageCache,
        ids: Arc<IdGenerator>,
        signer: Arc<dyn AttachmentSigner>,
        attachment_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            ids,
            signer,
            attachment_ttl,
            embedder: None,
        }
    }

    /// Embeds the text of every new message with `model`.
    pub fn with_embeddings(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.embedder = Some(model);
        self
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub async fn get_messages(
        &self,
        chat_id: Uuid,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<MessagePage> {
        let (messages, from_cache, has_more) = match cursor {
            None => self.head_window(chat_id).await?,
            Some(cursor) => {
                let cursor = ids::parse_message_id(cursor)?;
                let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
                if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
                    return Err(AppError::BadRequest(anyhow!(
                        "limit must be between 1 and {}",
                        MAX_PAGE_LIMIT
                    )));
                }

                let mut page = self.store.messages_before(chat_id, &cursor, limit).await?;
                let has_more = page.len() as i64 == limit;
                page.reverse();
                (page, CacheProvenance::None, has_more)
            }
        };

        Ok(MessagePage {
            data: self.present(messages).await,
            from_cache,
            has_more,
        })
    }

    async fn head_window(&self, chat_id: Uuid) -> AppResult<(Vec<Message>, CacheProvenance, bool)> {
        let cached = self.cache.read_recent(chat_id).await;
        if cached.len() == RECENT_CAPACITY {
            // A full window says nothing about what lies beyond it.
            return Ok((cached, CacheProvenance::Full, true));
        }

        let remaining = (RECENT_CAPACITY - cached.len()) as i64;
        let (mut older, provenance, generation) = match cached.first() {
            Some(oldest) => (
                self.store
                    .messages_before(chat_id, &oldest.id, remaining)
                    .await?,
                CacheProvenance::Partial,
                None,
            ),
            None => {
                // Read before the store so an edit landing mid-query voids the warm-up.
                let generation = self.cache.generation(chat_id).await;
                (
                    self.store.latest_messages(chat_id, remaining).await?,
                    CacheProvenance::None,
                    generation,
                )
            }
        };
        let has_more = older.len() as i64 == remaining;
        older.reverse();

        if let Some(generation) = generation {
            self.cache.warm(chat_id, generation, &older).await;
        }

        older.extend(cached);
        Ok((older, provenance, has_more))
    }

    /// Persists a message, appends it to the chat's recent window and returns
    /// it with its attachment resolved. Authorization is the caller's job.
    pub async fn send_message(
        &self,
        author_id: Uuid,
        chat_id: Uuid,
        text: Option<String>,
        attachment_ref: Option<String>,
    ) -> AppResult<MessageView> {
        let text = text.filter(|t| !t.trim().is_empty());
        let attachment_ref = attachment_ref
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        if text.is_none() && attachment_ref.is_none() {
            return Err(AppError::BadRequest(anyhow!(
                "A message needs text or an attachment"
            )));
        }
        if text.as_ref().is_some_and(|t| t.chars().count() > MAX_TEXT_LEN) {
            return Err(AppError::BadRequest(anyhow!(
                "Message text must be at most {} characters",
                MAX_TEXT_LEN
            )));
        }

        let embedding = match text.as_deref() {
            Some(text) => self.embed(chat_id, text).await,
            None => None,
        };

        let message = self
            .store
            .insert_message(
                NewMessage {
                    id: self.ids.next_id(),
                    chat_id,
                    author_id,
                    text,
                    attachment_ref,
                    created_at: Utc::now(),
                },
                embedding,
            )
            .await?;

        self.cache.append(chat_id, &message).await;
        tracing::debug!(%chat_id, message_id = %message.id, "message stored");

        Ok(self.present_one(message).await)
    }

    async fn embed(&self, chat_id: Uuid, text: &str) -> Option<Vec<f32>> {
        let model = self.embedder.as_ref()?;
        match model.embed(text).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "message embedding failed, storing without one");
                None
            }
        }
    }

    /// A message that exists and has not been deleted.
    pub async fn live_message(&self, message_id: &str) -> AppResult<Message> {
        let message_id = ids::parse_message_id(message_id)?;
        self.store
            .find_message(&message_id)
            .await?
            .filter(|m| !m.is_deleted())
            .ok_or_else(|| AppError::NotFound(anyhow!("Message not found")))
    }

    pub async fn edit_message(
        &self,
        actor_id: Uuid,
        message: &Message,
        text: &str,
    ) -> AppResult<Message> {
        ensure_author(actor_id, message)?;
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_TEXT_LEN {
            return Err(AppError::BadRequest(anyhow!(
                "Message text must be 1-{} characters",
                MAX_TEXT_LEN
            )));
        }

        let updated = self
            .store
            .update_message_text(&message.id, text)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Message not found")))?;

        self.cache.invalidate(message.chat_id).await;
        Ok(updated)
    }

    pub async fn delete_message(&self, actor_id: Uuid, message: &Message) -> AppResult<()> {
        ensure_author(actor_id, message)?;

        self.store
            .soft_delete_message(&message.id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("Message not found")))?;

        self.cache.invalidate(message.chat_id).await;
        Ok(())
    }

    pub async fn create_poll(
        &self,
        author_id: Uuid,
        chat_id: Uuid,
        title: &str,
        options: Vec<String>,
    ) -> AppResult<MessageView> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::BadRequest(anyhow!("Poll title is required")));
        }
        let options: Vec<String> = options
            .into_iter()
            .map(|option| option.trim().to_string())
            .collect();
        if options.len() < 2 {
            return Err(AppError::BadRequest(anyhow!("A poll needs at least 2 options")));
        }
        if options.iter().any(String::is_empty) {
            return Err(AppError::BadRequest(anyhow!("Poll options cannot be empty")));
        }

        let message = self
            .store
            .create_poll(NewPoll {
                poll_id: Uuid::new_v4(),
                message: NewMessage {
                    id: self.ids.next_id(),
                    chat_id,
                    author_id,
                    text: None,
                    attachment_ref: None,
                    created_at: Utc::now(),
                },
                title: title.to_string(),
                options,
            })
            .await?;

        self.cache.append(chat_id, &message).await;
        Ok(self.present_one(message).await)
    }

    pub async fn vote_poll(&self, user_id: Uuid, chat_id: Uuid, option_id: Uuid) -> AppResult<PollVote> {
        let option = self
            .store
            .find_poll_option(option_id)
            .await?
            .filter(|option| option.chat_id == chat_id)
            .ok_or_else(|| AppError::NotFound(anyhow!("Poll option not found")))?;

        // The tally is embedded in the cached poll message.
        let vote = self.store.record_vote(user_id, option).await?;
        self.cache.invalidate(chat_id).await;
        Ok(vote)
    }

    pub async fn mark_read(
        &self,
        user_id: Uuid,
        chat_id: Uuid,
        last_seen_message_id: &str,
    ) -> AppResult<ReadStatus> {
        let last_seen = ids::parse_message_id(last_seen_message_id)?;
        self.store
            .upsert_read_status(user_id, chat_id, &last_seen)
            .await
    }

    pub async fn read_statuses(&self, chat_id: Uuid) -> AppResult<Vec<ReadStatus>> {
        self.store.read_statuses(chat_id).await
    }

    /// Case-insensitive substring search over live messages, newest first.
    pub async fn search_text(&self, chat_id: Uuid, query: &str) -> AppResult<Vec<MessageView>> {
        let query = validate_search_query(query)?;
        let messages = self.store.search_text(chat_id, query, SEARCH_LIMIT).await?;
        Ok(self.present(messages).await)
    }

    pub async fn present(&self, messages: Vec<Message>) -> Vec<MessageView> {
        attachments::resolve_all(self.signer.as_ref(), self.attachment_ttl, messages).await
    }

    pub async fn present_one(&self, message: Message) -> MessageView {
        attachments::resolve(self.signer.as_ref(), self.attachment_ttl, message).await
    }
}

pub fn validate_search_query(query: &str) -> AppResult<&str> {
    let query = query.trim();
    if query.chars().count() < MIN_SEARCH_QUERY_LEN {
        return Err(AppError::BadRequest(anyhow!(
            "Search query must be at least {} characters",
            MIN_SEARCH_QUERY_LEN
        )));
    }
    Ok(query)
}

fn ensure_author(actor_id: Uuid, message: &Message) -> AppResult<()> {
    if message.author_id != actor_id {
        return Err(AppError::Unauthorized(anyhow!(
            "user {} does not own message {}",
            actor_id,
            message.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::DisabledAttachmentSigner;
    use crate::cache::memory::InMemoryCacheStore;
    use crate::store::memory::InMemoryMessageStore;

    struct Fixture {
        history: HistoryService,
        store: Arc<InMemoryMessageStore>,
        cache: RecentMessageCache,
        ids: Arc<IdGenerator>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMessageStore::new());
        let cache = RecentMessageCache::new(
            Arc::new(InMemoryCacheStore::new()),
            Duration::from_secs(1),
        );
        let ids = Arc::new(IdGenerator::new());
        let history = HistoryService::new(
            store.clone(),
            cache.clone(),
            ids.clone(),
            Arc::new(DisabledAttachmentSigner),
            Duration::from_secs(60),
        );
        Fixture {
            history,
            store,
            cache,
            ids,
        }
    }

    impl Fixture {
        /// Writes straight to the store, bypassing the cache.
        async fn seed(&self, chat_id: Uuid, count: usize) -> Vec<String> {
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                let message = self
                    .store
                    .insert_message(
                        NewMessage {
                            id: self.ids.next_id(),
                            chat_id,
                            author_id: Uuid::new_v4(),
                            text: Some(format!("seeded {}", i)),
                            attachment_ref: None,
                            created_at: Utc::now(),
                        },
                        None,
                    )
                    .await
                    .unwrap();
                ids.push(message.id);
            }
            ids
        }

        async fn send(&self, chat_id: Uuid, text: &str) -> MessageView {
            self.history
                .send_message(Uuid::new_v4(), chat_id, Some(text.to_string()), None)
                .await
                .unwrap()
        }
    }

    fn ids_of(page: &MessagePage) -> Vec<String> {
        page.data.iter().map(|m| m.message.id.clone()).collect()
    }

    #[tokio::test]
    async fn warm_cache_serves_full_window() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let mut sent = Vec::new();
        for i in 0..60 {
            sent.push(f.send(chat_id, &format!("hello {}", i)).await.message.id);
        }

        let page = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(page.from_cache, CacheProvenance::Full);
        assert_eq!(ids_of(&page), sent[10..].to_vec());
    }

    #[tokio::test]
    async fn cold_cache_matches_store_and_warms() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let seeded = f.seed(chat_id, 70).await;

        let page = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(page.from_cache, CacheProvenance::None);
        assert!(page.has_more);
        assert_eq!(ids_of(&page), seeded[20..].to_vec());

        let again = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(again.from_cache, CacheProvenance::Full);
        assert_eq!(ids_of(&again), seeded[20..].to_vec());
    }

    #[tokio::test]
    async fn partial_cache_is_backfilled_from_store() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let seeded = f.seed(chat_id, 60).await;
        let newest = f.send(chat_id, "fresh").await.message.id;

        let page = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(page.from_cache, CacheProvenance::Partial);
        let mut expected = seeded[11..].to_vec();
        expected.push(newest);
        assert_eq!(ids_of(&page), expected);
    }

    #[tokio::test]
    async fn short_chat_reports_no_more_history() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        f.seed(chat_id, 3).await;

        let cold = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(cold.from_cache, CacheProvenance::None);
        assert!(!cold.has_more);

        let warm = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(warm.from_cache, CacheProvenance::Partial);
        assert!(!warm.has_more);
        assert_eq!(warm.data.len(), 3);
    }

    #[tokio::test]
    async fn paged_read_is_exclusive_and_bounded() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let seeded = f.seed(chat_id, 30).await;

        let page = f
            .history
            .get_messages(chat_id, Some(&seeded[20]), Some(5))
            .await
            .unwrap();
        assert_eq!(page.from_cache, CacheProvenance::None);
        assert_eq!(ids_of(&page), seeded[15..20].to_vec());
        assert!(page.has_more);

        let tail = f
            .history
            .get_messages(chat_id, Some(&seeded[2]), Some(5))
            .await
            .unwrap();
        assert_eq!(ids_of(&tail), seeded[..2].to_vec());
        assert!(!tail.has_more);
    }

    #[tokio::test]
    async fn paged_read_rejects_bad_input() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let cursor = f.ids.next_id();

        for limit in [0, 251] {
            let err = f
                .history
                .get_messages(chat_id, Some(&cursor), Some(limit))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)));
        }
        let err = f
            .history
            .get_messages(chat_id, Some("not-a-ulid"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn edit_invalidates_cached_window() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        let sent = f
            .history
            .send_message(author, chat_id, Some("tpyo".into()), None)
            .await
            .unwrap();

        let message = f.history.live_message(&sent.message.id).await.unwrap();
        f.history.edit_message(author, &message, "typo").await.unwrap();
        assert!(f.cache.read_recent(chat_id).await.is_empty());

        let page = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(page.data[0].message.text.as_deref(), Some("typo"));
    }

    #[tokio::test]
    async fn only_the_author_may_edit_or_delete() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let sent = f.send(chat_id, "mine").await;
        let message = f.history.live_message(&sent.message.id).await.unwrap();

        let stranger = Uuid::new_v4();
        assert!(matches!(
            f.history.edit_message(stranger, &message, "yours").await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            f.history.delete_message(stranger, &message).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn deleted_messages_leave_history() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        let keep = f.send(chat_id, "keep").await;
        let gone = f
            .history
            .send_message(author, chat_id, Some("gone".into()), None)
            .await
            .unwrap();

        let message = f.history.live_message(&gone.message.id).await.unwrap();
        f.history.delete_message(author, &message).await.unwrap();

        let page = f.history.get_messages(chat_id, None, None).await.unwrap();
        assert_eq!(ids_of(&page), vec![keep.message.id]);
        assert!(matches!(
            f.history.live_message(&gone.message.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let f = fixture();
        let err = f
            .history
            .send_message(Uuid::new_v4(), Uuid::new_v4(), Some("   ".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn votes_are_scoped_to_their_chat() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        let poll = f
            .history
            .create_poll(
                Uuid::new_v4(),
                chat_id,
                "Lunch?",
                vec!["Pizza".into(), "Sushi".into()],
            )
            .await
            .unwrap();
        let option_id = poll.message.poll.as_ref().unwrap().options[1].id;
        let voter = Uuid::new_v4();

        assert!(matches!(
            f.history.vote_poll(voter, Uuid::new_v4(), option_id).await,
            Err(AppError::NotFound(_))
        ));

        let vote = f.history.vote_poll(voter, chat_id, option_id).await.unwrap();
        assert_eq!(vote.option_id, option_id);

        let page = f.history.get_messages(chat_id, None, None).await.unwrap();
        let options = &page.data[0].message.poll.as_ref().unwrap().options;
        assert_eq!(options[1].votes.len(), 1);
    }

    #[tokio::test]
    async fn polls_need_two_options() {
        let f = fixture();
        let err = f
            .history
            .create_poll(Uuid::new_v4(), Uuid::new_v4(), "Lunch?", vec!["Pizza".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn short_search_queries_are_rejected() {
        let f = fixture();
        let chat_id = Uuid::new_v4();
        f.send(chat_id, "Where is the lunch spot").await;

        assert!(matches!(
            f.history.search_text(chat_id, "lu").await,
            Err(AppError::BadRequest(_))
        ));
        let found = f.history.search_text(chat_id, "LUNCH").await.unwrap();
        assert_eq!(found.len(), 1);
    }

    /// Store whose next `latest_messages` call parks after reading until released.
    struct GatedStore {
        inner: InMemoryMessageStore,
        gate: tokio::sync::Mutex<Option<(tokio::sync::oneshot::Sender<()>, tokio::sync::oneshot::Receiver<()>)>>,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryMessageStore::new(),
                gate: tokio::sync::Mutex::new(None),
            }
        }

        /// Returns (parked, release): `parked` fires once a read is held, `release` lets it finish.
        async fn arm(&self) -> (tokio::sync::oneshot::Receiver<()>, tokio::sync::oneshot::Sender<()>) {
            let (parked_tx, parked_rx) = tokio::sync::oneshot::channel();
            let (release_tx, release_rx) = tokio::sync::oneshot::channel();
            *self.gate.lock().await = Some((parked_tx, release_rx));
            (parked_rx, release_tx)
        }
    }

    #[async_trait::async_trait]
    impl MessageStore for GatedStore {
        async fn create_chat(&self, chat: crate::models::chats::NewChat) -> AppResult<crate::models::chats::Chat> {
            self.inner.create_chat(chat).await
        }
        async fn find_chat(&self, chat_id: Uuid) -> AppResult<Option<crate::models::chats::Chat>> {
            self.inner.find_chat(chat_id).await
        }
        async fn membership(
            &self,
            user_id: Uuid,
            chat_id: Uuid,
        ) -> AppResult<Option<crate::models::chats::Membership>> {
            self.inner.membership(user_id, chat_id).await
        }
        async fn insert_member(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<bool> {
            self.inner.insert_member(user_id, chat_id).await
        }
        async fn list_user_chats(&self, user_id: Uuid) -> AppResult<Vec<crate::models::chats::ChatSummary>> {
            self.inner.list_user_chats(user_id).await
        }
        async fn insert_message(&self, message: NewMessage, embedding: Option<Vec<f32>>) -> AppResult<Message> {
            self.inner.insert_message(message, embedding).await
        }
        async fn latest_messages(&self, chat_id: Uuid, limit: i64) -> AppResult<Vec<Message>> {
            let result = self.inner.latest_messages(chat_id, limit).await;
            let gate = self.gate.lock().await.take();
            if let Some((parked, release)) = gate {
                let _ = parked.send(());
                let _ = release.await;
            }
            result
        }
        async fn messages_before(&self, chat_id: Uuid, before: &str, limit: i64) -> AppResult<Vec<Message>> {
            self.inner.messages_before(chat_id, before, limit).await
        }
        async fn find_message(&self, message_id: &str) -> AppResult<Option<Message>> {
            self.inner.find_message(message_id).await
        }
        async fn update_message_text(&self, message_id: &str, text: &str) -> AppResult<Option<Message>> {
            self.inner.update_message_text(message_id, text).await
        }
        async fn soft_delete_message(&self, message_id: &str) -> AppResult<Option<Message>> {
            self.inner.soft_delete_message(message_id).await
        }
        async fn upsert_read_status(
            &self,
            user_id: Uuid,
            chat_id: Uuid,
            last_seen_message_id: &str,
        ) -> AppResult<ReadStatus> {
            self.inner
                .upsert_read_status(user_id, chat_id, last_seen_message_id)
                .await
        }
        async fn read_statuses(&self, chat_id: Uuid) -> AppResult<Vec<ReadStatus>> {
            self.inner.read_statuses(chat_id).await
        }
        async fn search_text(&self, chat_id: Uuid, query: &str, limit: i64) -> AppResult<Vec<Message>> {
            self.inner.search_text(chat_id, query, limit).await
        }
        async fn nearest_messages(
            &self,
            chat_id: Uuid,
            embedding: &[f32],
            limit: i64,
        ) -> AppResult<Vec<(Message, f64)>> {
            self.inner.nearest_messages(chat_id, embedding, limit).await
        }
        async fn create_poll(&self, poll: NewPoll) -> AppResult<Message> {
            self.inner.create_poll(poll).await
        }
        async fn find_poll_option(
            &self,
            option_id: Uuid,
        ) -> AppResult<Option<crate::models::messages::PollOptionRef>> {
            self.inner.find_poll_option(option_id).await
        }
        async fn record_vote(
            &self,
            user_id: Uuid,
            option: crate::models::messages::PollOptionRef,
        ) -> AppResult<PollVote> {
            self.inner.record_vote(user_id, option).await
        }
    }

    async fn race_head_read_against<F, Fut>(change: F) -> (HistoryService, Uuid, String)
    where
        F: FnOnce(HistoryService, Message) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let store = Arc::new(GatedStore::new());
        let history = HistoryService::new(
            store.clone(),
            RecentMessageCache::new(Arc::new(InMemoryCacheStore::new()), Duration::from_secs(1)),
            Arc::new(IdGenerator::new()),
            Arc::new(DisabledAttachmentSigner),
            Duration::from_secs(60),
        );
        let chat_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        let stored = store
            .inner
            .insert_message(
                NewMessage {
                    id: history.ids.next_id(),
                    chat_id,
                    author_id: author,
                    text: Some("old".into()),
                    attachment_ref: None,
                    created_at: Utc::now(),
                },
                None,
            )
            .await
            .unwrap();

        let (parked, release) = store.arm().await;
        let reader = {
            let history = history.clone();
            tokio::spawn(async move { history.get_messages(chat_id, None, None).await })
        };
        parked.await.unwrap();

        change(history.clone(), stored.clone()).await;

        release.send(()).unwrap();
        reader.await.unwrap().unwrap();
        (history, chat_id, stored.id)
    }

    #[tokio::test]
    async fn edit_during_cold_read_is_not_undone_by_warm_up() {
        let (history, chat_id, message_id) = race_head_read_against(|history, message| async move {
            history
                .edit_message(message.author_id, &message, "new")
                .await
                .unwrap();
        })
        .await;

        for i in 0..3 {
            history
                .send_message(Uuid::new_v4(), chat_id, Some(format!("later {}", i)), None)
                .await
                .unwrap();
            let page = history.get_messages(chat_id, None, None).await.unwrap();
            let edited = page
                .data
                .iter()
                .find(|view| view.message.id == message_id)
                .unwrap();
            assert_eq!(edited.message.text.as_deref(), Some("new"));
        }
    }

    #[tokio::test]
    async fn delete_during_cold_read_stays_deleted() {
        let (history, chat_id, message_id) = race_head_read_against(|history, message| async move {
            history
                .delete_message(message.author_id, &message)
                .await
                .unwrap();
        })
        .await;

        history
            .send_message(Uuid::new_v4(), chat_id, Some("after".into()), None)
            .await
            .unwrap();
        let page = history.get_messages(chat_id, None, None).await.unwrap();
        assert!(page.data.iter().all(|view| view.message.id != message_id));
        assert_eq!(page.data.len(), 1);
    }
}
