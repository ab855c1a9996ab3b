//! Live Session Hub: tracks connected control sessions, fans out broadcasts
//! and dispatches inbound commands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::assistant::KnowledgeBase;
use crate::error::PipelineError;
use crate::models::{EnrichmentRecord, KnowledgeCollection, Post, Stage};
use crate::pipeline::{EnrichmentOutcome, EnrichmentPipeline, RunMode};
use crate::protocol::{Command, Outbound, ResultView};
use crate::store::PostStore;

pub const NO_POSTS_MESSAGE: &str = "No unprocessed posts available.";
pub const NOTHING_PROCESSED_MESSAGE: &str = "No post has been processed yet.";

/// Envelopes a session may have queued before it is treated as stalled and dropped.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Active,
}

struct SessionEntry {
    state: SessionState,
    tx: flume::Sender<String>,
}

/// The transport side of a session: serialized envelopes to write to the socket.
pub struct SessionHandle {
    pub id: Uuid,
    pub outbound: flume::Receiver<String>,
}

/// The fixed user whose latest record seeds a fresh dashboard.
#[derive(Debug, Clone)]
pub struct ReferenceUser {
    pub id: i64,
    pub name: String,
}

struct LastRun {
    post: Post,
    outcome: EnrichmentOutcome,
}

impl LastRun {
    fn record(&self) -> &EnrichmentRecord {
        &self.outcome.record
    }
}

pub struct LiveHub {
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    // Serialises queue advancement, reprocessing and previews.
    queue: AsyncMutex<Option<LastRun>>,
    pipeline: Arc<EnrichmentPipeline>,
    store: Arc<PostStore>,
    knowledge: Arc<dyn KnowledgeBase>,
    reference_user: ReferenceUser,
}

impl LiveHub {
    pub fn new(
        pipeline: Arc<EnrichmentPipeline>,
        store: Arc<PostStore>,
        knowledge: Arc<dyn KnowledgeBase>,
        reference_user: ReferenceUser,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queue: AsyncMutex::new(None),
            pipeline,
            store,
            knowledge,
            reference_user,
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        // A panicked holder leaves the map itself consistent.
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(&self) -> SessionHandle {
        let (tx, rx) = flume::bounded(SESSION_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        self.lock_sessions().insert(
            id,
            SessionEntry {
                state: SessionState::Connected,
                tx,
            },
        );
        tracing::debug!("Session {} connected", id);
        SessionHandle { id, outbound: rx }
    }

    pub fn activate(&self, session: Uuid) {
        if let Some(entry) = self.lock_sessions().get_mut(&session) {
            entry.state = SessionState::Active;
            tracing::debug!("Session {} active", session);
        }
    }

    pub fn close(&self, session: Uuid) {
        if self.lock_sessions().remove(&session).is_some() {
            tracing::debug!("Session {} closed", session);
        }
    }

    pub fn session_state(&self, session: Uuid) -> Option<SessionState> {
        self.lock_sessions().get(&session).map(|entry| entry.state)
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    fn serialize(message: &Outbound) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!("Failed to serialize outbound message: {}", e);
                None
            }
        }
    }

    /// Deliver to every active session. Sessions that are gone or whose queue is
    /// full are dropped.
    pub fn broadcast(&self, message: &Outbound) {
        let Some(payload) = Self::serialize(message) else {
            return;
        };

        let mut sessions = self.lock_sessions();
        let failed: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Active)
            .filter(|(_, entry)| entry.tx.try_send(payload.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();

        for id in failed {
            sessions.remove(&id);
            tracing::warn!("{}", PipelineError::DeliveryFailure(id.to_string()));
        }
    }

    pub fn send_to(&self, session: Uuid, message: &Outbound) {
        let Some(payload) = Self::serialize(message) else {
            return;
        };

        let mut sessions = self.lock_sessions();
        let delivered = sessions
            .get(&session)
            .map(|entry| entry.tx.try_send(payload).is_ok());
        if delivered == Some(false) {
            sessions.remove(&session);
            tracing::warn!("{}", PipelineError::DeliveryFailure(session.to_string()));
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Handle one raw inbound message from `session`.
    pub async fn handle_message(&self, session: Uuid, raw: &str) {
        let command = match serde_json::from_str::<Command>(raw) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("Session {} sent malformed message: {}", session, e);
                self.send_to(session, &Outbound::error(format!("Malformed message: {}", e)));
                return;
            }
        };
        self.handle_command(session, command).await;
    }

    pub async fn handle_command(&self, session: Uuid, command: Command) {
        match command {
            Command::InitialData => self.initial_data(session).await,
            Command::UpdatePrompt { stage, text } => self.update_prompt(session, stage, text).await,
            Command::ProcessNextPost => self.process_next_post().await,
            Command::ReprocessCurrentPost => self.reprocess_current_post().await,
            Command::PreviewPromptResponse { stage, text } => {
                self.preview_prompt_response(stage, text).await
            }
            Command::GetVectorStoreFiles => {
                if let Err(e) = self.broadcast_knowledge_files().await {
                    self.send_to(
                        session,
                        &Outbound::error(format!("Failed to fetch vector store files: {:#}", e)),
                    );
                }
            }
            Command::DeleteVectorStoreFile {
                file_id,
                vector_store_type,
            } => {
                self.delete_knowledge_file(session, &file_id, &vector_store_type)
                    .await
            }
            Command::UploadFile {
                file_name,
                file_content,
                vector_store_type,
            } => {
                self.upload_knowledge_file(session, &file_name, &file_content, &vector_store_type)
                    .await
            }
            Command::Unknown => {
                tracing::debug!("Session {} sent unknown command type, ignoring", session);
            }
        }
    }

    async fn initial_data(&self, session: Uuid) {
        let reference = &self.reference_user;
        match self.store.latest_enrichment_for(reference.id) {
            Ok(Some(record)) => {
                let instructions = self.pipeline.stages().snapshot().await;
                let view = ResultView::from_record(&record, &reference.name, instructions);
                self.send_to(session, &Outbound::InitialData(view));
            }
            Ok(None) => {
                self.send_to(
                    session,
                    &Outbound::info(format!("No enrichment history for {} yet.", reference.name)),
                );
            }
            Err(e) => {
                self.send_to(
                    session,
                    &Outbound::error(PipelineError::from_store(e).to_string()),
                );
            }
        }
    }

    async fn update_prompt(&self, session: Uuid, stage: Stage, text: String) {
        let pipeline = &self.pipeline;
        if let Err(e) = pipeline
            .stages()
            .update(stage, text, pipeline.assistant(), pipeline.stage_timeout())
            .await
        {
            self.send_to(
                session,
                &Outbound::error(format!("Failed to update prompt for {}: {:#}", stage, e)),
            );
        }
    }

    async fn process_next_post(&self) {
        let mut last = self.queue.lock().await;

        let post = match self.store.next_unprocessed() {
            Ok(Some(post)) => post,
            Ok(None) => {
                self.broadcast(&Outbound::info(NO_POSTS_MESSAGE));
                return;
            }
            Err(e) => {
                self.broadcast(&Outbound::error(PipelineError::from_store(e).to_string()));
                return;
            }
        };

        match self.pipeline.run(&post, RunMode::Persist).await {
            Ok(outcome) => {
                let view = ResultView::from_outcome(&outcome, &post.user_name, false);
                *last = Some(LastRun { post, outcome });
                self.broadcast(&Outbound::EnrichmentResult(view));
            }
            Err(e) => {
                tracing::error!("Failed to process post {}: {}", post.id, e);
                self.broadcast(&Outbound::error(format!(
                    "Failed to process post {}: {}",
                    post.id, e
                )));
            }
        }
    }

    async fn reprocess_current_post(&self) {
        let mut last = self.queue.lock().await;
        let Some(current) = last.as_mut() else {
            self.broadcast(&Outbound::info(NOTHING_PROCESSED_MESSAGE));
            return;
        };

        match self.pipeline.run(&current.post, RunMode::Reprocess).await {
            Ok(outcome) => {
                let view = ResultView::from_outcome(&outcome, &current.post.user_name, true);
                current.outcome = outcome;
                self.broadcast(&Outbound::EnrichmentResult(view));
            }
            Err(e) => {
                tracing::error!("Failed to reprocess post {}: {}", current.post.id, e);
                self.broadcast(&Outbound::error(format!(
                    "Failed to reprocess post {}: {}",
                    current.post.id, e
                )));
            }
        }
    }

    async fn preview_prompt_response(&self, stage: Stage, text: String) {
        let last = self.queue.lock().await;
        let Some(current) = last.as_ref() else {
            self.broadcast(&Outbound::info(NOTHING_PROCESSED_MESSAGE));
            return;
        };

        match self
            .pipeline
            .preview(stage, text, &current.post, current.record())
            .await
        {
            Ok(output) => self.broadcast(&Outbound::PromptPreview {
                stage,
                post_id: current.post.id,
                output,
            }),
            Err(e) => self.broadcast(&Outbound::error(format!(
                "Failed to preview {} stage: {}",
                stage, e
            ))),
        }
    }

    // ========================================================================
    // Knowledge collections
    // ========================================================================

    fn collection_id(&self, wire_name: &str) -> String {
        self.pipeline
            .collections()
            .id_for(KnowledgeCollection::from_wire(wire_name))
            .to_string()
    }

    async fn broadcast_knowledge_files(&self) -> anyhow::Result<()> {
        let collections = self.pipeline.collections();
        let advanced = self.knowledge.list_files(&collections.advanced).await?;
        let basic = self.knowledge.list_files(&collections.basic).await?;
        self.broadcast(&Outbound::KnowledgeFiles {
            advanced_vector_store_files: advanced,
            basic_vector_store_files: basic,
        });
        Ok(())
    }

    async fn delete_knowledge_file(&self, session: Uuid, file_id: &str, vector_store_type: &str) {
        let collection_id = self.collection_id(vector_store_type);
        let result = async {
            self.knowledge.delete_file(&collection_id, file_id).await?;
            tracing::info!("Deleted file {} from collection {}", file_id, collection_id);
            self.broadcast_knowledge_files().await
        }
        .await;

        if let Err(e) = result {
            self.send_to(
                session,
                &Outbound::error(format!("Failed to delete vector store file: {:#}", e)),
            );
        }
    }

    async fn upload_knowledge_file(
        &self,
        session: Uuid,
        file_name: &str,
        file_content: &str,
        vector_store_type: &str,
    ) {
        let collection_id = self.collection_id(vector_store_type);
        let result = async {
            let bytes = hex::decode(file_content.trim())
                .map_err(|e| anyhow::anyhow!("file_content is not valid hex: {}", e))?;
            let file_id = self
                .knowledge
                .upload_file(&collection_id, file_name, bytes)
                .await?;
            tracing::info!(
                "Uploaded {} as {} to collection {}",
                file_name,
                file_id,
                collection_id
            );
            self.broadcast_knowledge_files().await
        }
        .await;

        if let Err(e) = result {
            self.send_to(
                session,
                &Outbound::error(format!("Failed to upload file: {:#}", e)),
            );
        }
    }
}
