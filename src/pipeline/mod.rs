//! Enrichment Pipeline: technical analysis, then historical analysis, then
//! synthesis, over one post. A record is persisted only after all three
//! stages succeed.

pub mod instructions;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::assistant::{Assistant, AssistantError, StageRequest};
use crate::error::PipelineError;
use crate::markers;
use crate::models::{EnrichmentRecord, KnowledgeCollection, Post, Stage};
use crate::store::PostStore;
pub use instructions::{StageConfig, StageInstructions, StageOverride};

pub const NO_HISTORY_SUMMARY: &str = "No historical data available for this user.";
pub const UNKNOWN_ADVENTURE: &str = "unknown";
const FIXED_RATING: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Append the record and mark the post processed.
    Persist,
    /// Recompute without touching the store.
    Reprocess,
}

/// Reference collection ids the technical and historical stages search.
#[derive(Debug, Clone, Default)]
pub struct CollectionIds {
    pub basic: String,
    pub advanced: String,
}

impl CollectionIds {
    pub fn id_for(&self, collection: KnowledgeCollection) -> &str {
        match collection {
            KnowledgeCollection::Basic => &self.basic,
            KnowledgeCollection::Advanced => &self.advanced,
        }
    }
}

/// What each stage was given, as shown to dashboard clients.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInputs {
    pub technical: String,
    pub historical: String,
    pub synthesis: String,
}

impl StageInputs {
    pub fn for_record(record: &EnrichmentRecord) -> Self {
        Self {
            technical: record.text_content.clone(),
            historical: historical_input(record.user_id),
            synthesis: synthesis_input(&record.technical_analysis, &record.historical_analysis),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub record: EnrichmentRecord,
    pub collection: KnowledgeCollection,
    pub inputs: StageInputs,
    pub instructions: StageInstructions,
}

pub fn historical_input(user_id: i64) -> String {
    format!("User ID: {}", user_id)
}

pub fn synthesis_input(technical: &str, historical: &str) -> String {
    format!(
        "Technical Feedback: {}\nHistorical Feedback: {}",
        technical, historical
    )
}

fn history_digest(history: &[EnrichmentRecord]) -> String {
    let mut digest = String::from("User History:\n");
    for entry in history {
        digest.push_str(&format!(
            "- Post ID: {}, Adventure: {}, Content: {}, Technical Analysis: {}, Final Comment: {}, Date: {}\n",
            entry.post_id,
            entry.adventure_label,
            entry.text_content,
            entry.technical_analysis,
            entry.synthesis,
            entry.completed_at.to_rfc3339()
        ));
    }
    digest
}

/// Image URLs in attachment order; unusable attachments are dropped with a warning.
pub fn resolve_image_urls(post: &Post) -> Vec<String> {
    post.media_refs
        .iter()
        .filter_map(|media| {
            let resolved = media.resolve_url();
            if resolved.is_none() {
                tracing::warn!("Post {}: no usable image URL in {:?}", post.id, media);
            }
            resolved.map(str::to_string)
        })
        .collect()
}

pub struct EnrichmentPipeline {
    assistant: Arc<dyn Assistant>,
    store: Arc<PostStore>,
    stages: StageConfig,
    collections: CollectionIds,
    stage_timeout: Duration,
}

impl EnrichmentPipeline {
    pub fn new(
        assistant: Arc<dyn Assistant>,
        store: Arc<PostStore>,
        stages: StageConfig,
        collections: CollectionIds,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            assistant,
            store,
            stages,
            collections,
            stage_timeout,
        }
    }

    pub fn stages(&self) -> &StageConfig {
        &self.stages
    }

    pub fn assistant(&self) -> &dyn Assistant {
        self.assistant.as_ref()
    }

    pub fn collections(&self) -> &CollectionIds {
        &self.collections
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Run all three stages over `post`. Any stage failure aborts the run
    /// before anything is written.
    pub async fn run(&self, post: &Post, mode: RunMode) -> Result<EnrichmentOutcome, PipelineError> {
        let image_urls = resolve_image_urls(post);
        let collection = markers::classify_collection(&post.text_content, post.declared_level);
        tracing::info!(
            "Enriching post {} (activity {}) with {} collection, {} image(s), mode {:?}",
            post.id,
            post.activity_id,
            collection.label(),
            image_urls.len(),
            mode
        );

        let technical_instructions = self.stages.instructions(Stage::Technical).await;
        let technical = self
            .technical_stage(post, &image_urls, collection, technical_instructions)
            .await?;
        let detected = markers::adventure_number(&technical);

        let historical_instructions = self.stages.instructions(Stage::Historical).await;
        let historical = self
            .historical_stage(post, collection, historical_instructions)
            .await?;

        let synthesis_instructions = self.stages.instructions(Stage::Synthesis).await;
        let synthesis = self
            .synthesis_stage(post.id, &technical, &historical, synthesis_instructions)
            .await?;

        let adventure_label = post
            .declared_adventure_number
            .or(detected)
            .map(|number| number.to_string())
            .unwrap_or_else(|| UNKNOWN_ADVENTURE.to_string());

        let record = EnrichmentRecord {
            post_id: post.id,
            user_id: post.user_id,
            text_content: post.text_content.clone(),
            adventure_label,
            image_urls,
            technical_analysis: technical,
            historical_analysis: historical,
            synthesis,
            rating: FIXED_RATING,
            completed_at: Utc::now(),
        };

        if mode == RunMode::Persist {
            self.store
                .commit_enrichment(&record)
                .map_err(PipelineError::from_store)?;
            tracing::info!("Stored enrichment for post {}", post.id);
        }

        Ok(EnrichmentOutcome {
            inputs: StageInputs::for_record(&record),
            record,
            collection,
            instructions: self.stages.snapshot().await,
        })
    }

    /// Run one stage with `text` as its instructions for this call only. The
    /// override is held exclusively and reverted however the call ends.
    pub async fn preview(
        &self,
        stage: Stage,
        text: String,
        post: &Post,
        last: &EnrichmentRecord,
    ) -> Result<String, PipelineError> {
        let collection = markers::classify_collection(&post.text_content, post.declared_level);
        let guard = self.stages.override_stage(stage, text).await;
        let instructions = guard.instructions().to_string();
        tracing::info!("Previewing {} stage on post {}", stage, post.id);

        let output = match stage {
            Stage::Technical => {
                self.technical_stage(post, &last.image_urls, collection, instructions)
                    .await
            }
            Stage::Historical => {
                self.historical_stage(post, collection, instructions)
                    .await
            }
            Stage::Synthesis => {
                self.synthesis_stage(
                    post.id,
                    &last.technical_analysis,
                    &last.historical_analysis,
                    instructions,
                )
                .await
            }
        };
        drop(guard);
        output
    }

    async fn technical_stage(
        &self,
        post: &Post,
        image_urls: &[String],
        collection: KnowledgeCollection,
        instructions: String,
    ) -> Result<String, PipelineError> {
        let request = StageRequest {
            stage: Stage::Technical,
            instructions,
            text: format!("Analyze this: {}", post.text_content),
            image_url: image_urls.first().cloned(),
            collection_id: Some(self.collections.id_for(collection).to_string()),
        };
        self.call_stage(post.id, Stage::Technical, self.assistant.run(request))
            .await
    }

    /// Summarise the user's earlier submissions. Records of `post` itself are
    /// left out so a reprocess sees the same history as the first run.
    async fn historical_stage(
        &self,
        post: &Post,
        collection: KnowledgeCollection,
        instructions: String,
    ) -> Result<String, PipelineError> {
        let post_id = post.id;
        let mut history = self
            .store
            .history_for(post.user_id)
            .map_err(PipelineError::from_store)?;
        history.retain(|entry| entry.post_id != post_id);
        if history.is_empty() {
            tracing::debug!("Post {}: user {} has no history", post_id, post.user_id);
            return Ok(NO_HISTORY_SUMMARY.to_string());
        }

        let request = StageRequest {
            stage: Stage::Historical,
            instructions,
            text: format!(
                "Analyze the following user history:\n{}",
                history_digest(&history)
            ),
            image_url: None,
            collection_id: Some(self.collections.id_for(collection).to_string()),
        };
        self.call_stage(post_id, Stage::Historical, self.assistant.run(request))
            .await
    }

    async fn synthesis_stage(
        &self,
        post_id: i64,
        technical: &str,
        historical: &str,
        instructions: String,
    ) -> Result<String, PipelineError> {
        let request = StageRequest {
            stage: Stage::Synthesis,
            instructions,
            text: synthesis_input(technical, historical),
            image_url: None,
            collection_id: None,
        };
        self.call_stage(post_id, Stage::Synthesis, self.assistant.run(request))
            .await
    }

    async fn call_stage<F>(&self, post_id: i64, stage: Stage, call: F) -> Result<String, PipelineError>
    where
        F: Future<Output = Result<String, AssistantError>>,
    {
        tracing::info!("Post {}: calling {} stage", post_id, stage);
        let seconds = self.stage_timeout.as_secs();

        match tokio::time::timeout(self.stage_timeout, call).await {
            Ok(Ok(output)) => {
                tracing::debug!("Post {}: {} stage returned {} chars", post_id, stage, output.len());
                Ok(output)
            }
            Ok(Err(AssistantError::Timeout { seconds })) => {
                Err(PipelineError::StageTimeout { stage, seconds })
            }
            Ok(Err(e)) => {
                tracing::error!("Post {}: {} stage failed: {}", post_id, stage, e);
                Err(PipelineError::StageFailed {
                    stage,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                tracing::error!("Post {}: {} stage timed out after {}s", post_id, stage, seconds);
                Err(PipelineError::StageTimeout { stage, seconds })
            }
        }
    }
}
