use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::assistant::{Assistant, KnowledgeBase, OpenAiAssistantClient};
use crate::auth::JwtTokenProvider;
use crate::config::AppConfig;
use crate::feed::client::ActivityClient;
use crate::feed::{ActivitySource, ContentFetcher};
use crate::http_client::{build_http_client, build_http_client_with_timeout};
use crate::hub::{LiveHub, ReferenceUser};
use crate::pipeline::{CollectionIds, EnrichmentPipeline, StageConfig};
use crate::scheduler::FetchScheduler;
use crate::store::PostStore;

/// Process-scoped state shared by the scheduler and the control channel.
pub struct BackendRuntime {
    pub config: AppConfig,
    pub store: Arc<PostStore>,
    pub hub: Arc<LiveHub>,
    pub scheduler: Arc<FetchScheduler>,
}

/// Wires collaborators together. Anything not supplied is built from the config.
pub struct BackendRuntimeBuilder {
    config: AppConfig,
    source: Option<Arc<dyn ActivitySource>>,
    assistant: Option<Arc<dyn Assistant>>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    store: Option<Arc<PostStore>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            source: None,
            assistant: None,
            knowledge: None,
            store: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ActivitySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_assistant(mut self, assistant: Arc<dyn Assistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_store(mut self, store: Arc<PostStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(
                PostStore::new(&config.database_path).with_context(|| {
                    format!("Failed to open post store at {}", config.database_path)
                })?,
            ),
        };

        let source = match self.source {
            Some(source) => source,
            None => {
                let client = build_http_client_with_timeout(Some(Duration::from_secs(
                    config.upstream.request_timeout_secs.max(1),
                )))?;
                let tokens = Arc::new(JwtTokenProvider::new(
                    config.upstream.base_url.clone(),
                    config.upstream.username.clone(),
                    config.upstream.password.clone(),
                    client.clone(),
                ));
                tracing::info!("Upstream feed: {}", config.upstream.base_url);
                Arc::new(ActivityClient::new(
                    config.upstream.base_url.clone(),
                    tokens,
                    client,
                )) as Arc<dyn ActivitySource>
            }
        };

        let (assistant, knowledge) = match (self.assistant, self.knowledge) {
            (Some(assistant), Some(knowledge)) => (assistant, knowledge),
            (assistant, knowledge) => {
                // per-request deadlines come from the run poll loop
                let client = build_http_client()?;
                let openai = Arc::new(OpenAiAssistantClient::new(&config.assistant, client));
                tracing::info!("Assistant API: {}", config.assistant.api_url);
                (
                    assistant.unwrap_or_else(|| openai.clone() as Arc<dyn Assistant>),
                    knowledge.unwrap_or_else(|| openai as Arc<dyn KnowledgeBase>),
                )
            }
        };

        let collections = CollectionIds {
            basic: config.assistant.basic_collection_id.clone(),
            advanced: config.assistant.advanced_collection_id.clone(),
        };
        if collections.basic.is_empty() || collections.advanced.is_empty() {
            tracing::warn!("Knowledge collection ids are not fully configured");
        }

        let pipeline = Arc::new(EnrichmentPipeline::new(
            assistant,
            store.clone(),
            StageConfig::default(),
            collections,
            config.stage_timeout(),
        ));

        let hub = Arc::new(LiveHub::new(
            pipeline,
            store.clone(),
            knowledge,
            ReferenceUser {
                id: config.reference_user_id,
                name: config.reference_user_name.clone(),
            },
        ));

        let fetcher = Arc::new(ContentFetcher::new(source, config.upstream.page_size));
        let scheduler = Arc::new(FetchScheduler::new(
            fetcher,
            store.clone(),
            config.fetch_interval(),
            Duration::from_secs(config.connect_retry_secs),
        ));

        Ok(BackendRuntime {
            config,
            store,
            hub,
            scheduler,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AppConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }

    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    }
}
