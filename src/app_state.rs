use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::attachments::{AttachmentSigner, DisabledAttachmentSigner, HttpAttachmentSigner};
use crate::cache::{memory::InMemoryCacheStore, redis::RedisCacheStore, CacheStore, Presence, RecentMessageCache};
use crate::config::{BroadcastPolicy, Config};
use crate::db;
use crate::history::HistoryService;
use crate::ids::IdGenerator;
use crate::llm::{LanguageModel, OpenAiClient};
use crate::membership::MembershipService;
use crate::middlewares::auth::TokenVerifier;
use crate::scheduler::{memory::InMemoryJobQueue, redis::RedisJobQueue, DeliveryWorker, JobQueue, Scheduler};
use crate::search::SemanticSearch;
use crate::store::{memory::InMemoryMessageStore, postgres::PgMessageStore, MessageStore};
use crate::websocket::manager::RoomRegistry;

/// Timeout for calls to the attachment signer and the language model.
const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// The collaborators the services are built on.
pub struct Backends {
    pub store: Arc<dyn MessageStore>,
    pub cache: Arc<dyn CacheStore>,
    pub queue: Arc<dyn JobQueue>,
    pub signer: Arc<dyn AttachmentSigner>,
    pub model: Option<Arc<dyn LanguageModel>>,
}

impl Backends {
    /// Everything in process; nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryMessageStore::new()),
            cache: Arc::new(InMemoryCacheStore::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            signer: Arc::new(DisabledAttachmentSigner),
            model: None,
        }
    }

    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect_to_db(config).await?;
        let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));

        let (cache, queue): (Arc<dyn CacheStore>, Arc<dyn JobQueue>) = match &config.redis_url {
            Some(url) => (
                Arc::new(RedisCacheStore::connect(url).await.context("redis cache")?),
                Arc::new(RedisJobQueue::connect(url).await.context("redis job queue")?),
            ),
            None => {
                tracing::warn!("REDIS_URL not set, using in-process cache and job queue");
                (
                    Arc::new(InMemoryCacheStore::new()),
                    Arc::new(InMemoryJobQueue::new()),
                )
            }
        };

        let signer: Arc<dyn AttachmentSigner> = match &config.attachment_signer_url {
            Some(url) => Arc::new(HttpAttachmentSigner::new(url, COLLABORATOR_TIMEOUT)?),
            None => Arc::new(DisabledAttachmentSigner),
        };

        let model: Option<Arc<dyn LanguageModel>> = match &config.openai {
            Some(openai) => Some(Arc::new(OpenAiClient::new(openai, COLLABORATOR_TIMEOUT)?)),
            None => None,
        };

        Ok(Self {
            store,
            cache,
            queue,
            signer,
            model,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub history: HistoryService,
    pub membership: MembershipService,
    pub search: SemanticSearch,
    pub scheduler: Scheduler,
    pub presence: Presence,
    pub rooms: RoomRegistry,
    pub tokens: TokenVerifier,
    pub signer: Arc<dyn AttachmentSigner>,
    pub broadcast_policy: BroadcastPolicy,
}

impl AppState {
    pub fn new(config: &Config, backends: Backends) -> Self {
        let Backends {
            store,
            cache,
            queue,
            signer,
            model,
        } = backends;

        let mut history = HistoryService::new(
            store.clone(),
            RecentMessageCache::new(cache.clone(), config.cache_timeout),
            Arc::new(IdGenerator::new()),
            signer.clone(),
            config.attachment_url_ttl,
        );
        if config.message_embedding_enabled {
            match &model {
                Some(model) => history = history.with_embeddings(model.clone()),
                None => tracing::warn!("MESSAGE_EMBEDDING_ENABLED is set but no OpenAI key is configured"),
            }
        }

        let search = match (&model, &config.openai, config.semantic_search_enabled) {
            (Some(model), Some(openai), true) => {
                SemanticSearch::new(history.clone(), model.clone(), Arc::new(openai.clone()))
            }
            (_, _, true) => {
                tracing::warn!("SEMANTIC_SEARCH_ENABLED is set but no OpenAI key is configured");
                SemanticSearch::disabled(history.clone())
            }
            _ => SemanticSearch::disabled(history.clone()),
        };

        let membership = MembershipService::new(store);

        Self {
            scheduler: Scheduler::new(queue, membership.clone()).with_timeout(config.cache_timeout),
            presence: Presence::new(cache, config.online_ttl, config.cache_timeout),
            rooms: RoomRegistry::new(),
            tokens: TokenVerifier::new(&config.jwt_secret),
            signer,
            broadcast_policy: config.broadcast_policy,
            history,
            membership,
            search,
        }
    }

    pub fn delivery_worker(&self, config: &Config) -> DeliveryWorker {
        DeliveryWorker::new(
            self.scheduler.queue(),
            self.history.clone(),
            self.rooms.clone(),
            config.scheduler_poll_interval,
        )
        .with_timeout(config.cache_timeout)
    }
}
