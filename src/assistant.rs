//! AI-assistant collaborator. A stage call submits instructions plus optional
//! text, image and collection scope, then blocks until the run is terminal and
//! returns the text of the newest thread message.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::config::AssistantConfig;
use crate::models::Stage;

#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    pub stage: Stage,
    pub instructions: String,
    pub text: String,
    pub image_url: Option<String>,
    pub collection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssistantError {
    #[error("run did not finish within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("run ended with status {status}: {detail}")]
    Terminal { status: String, detail: String },

    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn run(&self, request: StageRequest) -> Result<String, AssistantError>;

    /// Push new default instructions for a stage to the remote assistant.
    async fn update_instructions(&self, stage: Stage, instructions: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub id: String,
    pub name: String,
}

/// File management for the reference collections the stages search.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn list_files(&self, collection_id: &str) -> Result<Vec<KnowledgeFile>>;
    async fn delete_file(&self, collection_id: &str, file_id: &str) -> Result<()>;
    /// Returns the id of the new file.
    async fn upload_file(&self, collection_id: &str, file_name: &str, bytes: Vec<u8>)
        -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunLastError>,
}

#[derive(Debug, Deserialize)]
struct RunLastError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, PartialEq)]
enum RunProgress {
    Pending,
    Completed,
    Failed(AssistantError),
}

fn run_progress(run: &RunObject) -> RunProgress {
    match run.status.as_str() {
        "completed" => RunProgress::Completed,
        "failed" | "cancelled" | "expired" | "incomplete" => {
            let detail = run
                .last_error
                .as_ref()
                .map(|e| format!("{} ({})", e.message, e.code))
                .unwrap_or_else(|| "no error details".to_string());
            RunProgress::Failed(AssistantError::Terminal {
                status: run.status.clone(),
                detail,
            })
        }
        _ => RunProgress::Pending,
    }
}

fn first_text(messages: ListResponse<ThreadMessage>) -> Option<String> {
    messages
        .data
        .into_iter()
        .next()?
        .content
        .into_iter()
        .find(|part| part.kind == "text")
        .and_then(|part| part.text)
        .map(|text| text.value)
}

fn build_run_body(assistant_id: &str, request: &StageRequest) -> Value {
    let mut content = vec![json!({ "type": "text", "text": request.text })];
    if let Some(url) = &request.image_url {
        content.push(json!({ "type": "image_url", "image_url": { "url": url } }));
    }

    let mut body = json!({
        "assistant_id": assistant_id,
        "instructions": request.instructions,
        "thread": {
            "messages": [{ "role": "user", "content": content }]
        }
    });
    if let Some(collection_id) = request.collection_id.as_deref().filter(|id| !id.is_empty()) {
        body["tool_resources"] = json!({
            "file_search": { "vector_store_ids": [collection_id] }
        });
    }
    body
}

fn transport(error: anyhow::Error) -> AssistantError {
    AssistantError::Transport(format!("{:#}", error))
}

/// Client for the OpenAI Assistants (v2) and vector store endpoints.
pub struct OpenAiAssistantClient {
    api_url: String,
    api_key: String,
    technical_id: String,
    historical_id: String,
    synthesis_id: String,
    poll_interval: Duration,
    run_timeout: Duration,
    client: Client,
}

impl OpenAiAssistantClient {
    pub fn new(config: &AssistantConfig, client: Client) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            technical_id: config.technical_assistant_id.clone(),
            historical_id: config.historical_assistant_id.clone(),
            synthesis_id: config.synthesis_assistant_id.clone(),
            poll_interval: Duration::from_millis(config.run_poll_interval_ms.max(100)),
            run_timeout: Duration::from_secs(config.stage_timeout_secs.max(1)),
            client,
        }
    }

    fn assistant_id(&self, stage: Stage) -> &str {
        match stage {
            Stage::Technical => &self.technical_id,
            Stage::Historical => &self.historical_id,
            Stage::Synthesis => &self.synthesis_id,
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("OpenAI-Beta", "assistants=v2");
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned error {}: {}", what, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject> {
        let url = format!("{}/threads/{}/runs/{}", self.api_url, thread_id, run_id);
        self.send_json(self.client.get(&url), "run status").await
    }

    async fn wait_for_completion(&self, run: RunObject) -> Result<(), AssistantError> {
        let start = Instant::now();
        let mut current = run;

        loop {
            match run_progress(&current) {
                RunProgress::Completed => return Ok(()),
                RunProgress::Failed(error) => return Err(error),
                RunProgress::Pending => {}
            }
            if start.elapsed() > self.run_timeout {
                return Err(AssistantError::Timeout {
                    seconds: self.run_timeout.as_secs(),
                });
            }

            sleep(self.poll_interval).await;
            let (thread_id, run_id) = (current.thread_id.clone(), current.id.clone());
            current = self
                .retrieve_run(&thread_id, &run_id)
                .await
                .map_err(transport)?;
            tracing::debug!("Run {} status: {}", current.id, current.status);
        }
    }

    async fn latest_message(&self, thread_id: &str) -> Result<Option<String>> {
        let url = format!("{}/threads/{}/messages", self.api_url, thread_id);
        let messages: ListResponse<ThreadMessage> = self
            .send_json(
                self.client
                    .get(&url)
                    .query(&[("limit", "1"), ("order", "desc")]),
                "thread messages",
            )
            .await?;
        Ok(first_text(messages))
    }

    async fn file_name(&self, file_id: &str) -> Result<String> {
        let url = format!("{}/files/{}", self.api_url, file_id);
        let file: FileObject = self.send_json(self.client.get(&url), "file lookup").await?;
        Ok(if file.filename.is_empty() {
            file.id
        } else {
            file.filename
        })
    }
}

#[async_trait]
impl Assistant for OpenAiAssistantClient {
    async fn run(&self, request: StageRequest) -> Result<String, AssistantError> {
        let assistant_id = self.assistant_id(request.stage);
        if assistant_id.is_empty() {
            return Err(AssistantError::Transport(format!(
                "no assistant id configured for {} stage",
                request.stage
            )));
        }

        let url = format!("{}/threads/runs", self.api_url);
        let body = build_run_body(assistant_id, &request);
        let run: RunObject = self
            .send_json(self.client.post(&url).json(&body), "create run")
            .await
            .map_err(transport)?;
        tracing::debug!(
            "Started {} run {} on thread {}",
            request.stage,
            run.id,
            run.thread_id
        );

        let thread_id = run.thread_id.clone();
        self.wait_for_completion(run).await?;

        self.latest_message(&thread_id)
            .await
            .map_err(transport)?
            .ok_or_else(|| AssistantError::Terminal {
                status: "completed".to_string(),
                detail: "run produced no text message".to_string(),
            })
    }

    async fn update_instructions(&self, stage: Stage, instructions: &str) -> Result<()> {
        let assistant_id = self.assistant_id(stage);
        if assistant_id.is_empty() {
            anyhow::bail!("No assistant id configured for {} stage", stage);
        }
        let url = format!("{}/assistants/{}", self.api_url, assistant_id);
        let _: Value = self
            .send_json(
                self.client
                    .post(&url)
                    .json(&json!({ "instructions": instructions })),
                "assistant update",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KnowledgeBase for OpenAiAssistantClient {
    async fn list_files(&self, collection_id: &str) -> Result<Vec<KnowledgeFile>> {
        let url = format!("{}/vector_stores/{}/files", self.api_url, collection_id);
        let entries: ListResponse<FileEntry> = self
            .send_json(self.client.get(&url), "vector store files")
            .await?;

        let mut files = Vec::with_capacity(entries.data.len());
        for entry in entries.data {
            let name = self.file_name(&entry.id).await?;
            files.push(KnowledgeFile { id: entry.id, name });
        }
        Ok(files)
    }

    async fn delete_file(&self, collection_id: &str, file_id: &str) -> Result<()> {
        let url = format!(
            "{}/vector_stores/{}/files/{}",
            self.api_url, collection_id, file_id
        );
        let _: Value = self
            .send_json(self.client.delete(&url), "vector store file delete")
            .await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        collection_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string()),
            );
        let url = format!("{}/files", self.api_url);
        let file: FileObject = self
            .send_json(self.client.post(&url).multipart(form), "file upload")
            .await?;

        let url = format!("{}/vector_stores/{}/files", self.api_url, collection_id);
        let _: Value = self
            .send_json(
                self.client.post(&url).json(&json!({ "file_id": file.id })),
                "vector store attach",
            )
            .await?;
        Ok(file.id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-process assistant with canned answers per stage.
    pub struct ScriptedAssistant {
        responses: Mutex<HashMap<Stage, Result<String, AssistantError>>>,
        pub delay: Option<Duration>,
        pub update_delay: Option<Duration>,
        pub fail_updates: bool,
        pub calls: Mutex<Vec<StageRequest>>,
        pub updates: Mutex<Vec<(Stage, String)>>,
        pub files: Mutex<HashMap<String, Vec<KnowledgeFile>>>,
    }

    impl ScriptedAssistant {
        pub fn new() -> Self {
            let responses = HashMap::from([
                (
                    Stage::Technical,
                    Ok("Matches Adventure 7 - Basic. Clean sectioning.".to_string()),
                ),
                (Stage::Historical, Ok("Steady progress.".to_string())),
                (Stage::Synthesis, Ok("Great work, keep going.".to_string())),
            ]);
            Self {
                responses: Mutex::new(responses),
                delay: None,
                update_delay: None,
                fail_updates: false,
                calls: Mutex::new(Vec::new()),
                updates: Mutex::new(Vec::new()),
                files: Mutex::new(HashMap::new()),
            }
        }

        pub fn respond(&self, stage: Stage, response: Result<String, AssistantError>) {
            self.responses.lock().unwrap().insert(stage, response);
        }

        pub fn calls_for(&self, stage: Stage) -> Vec<StageRequest> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.stage == stage)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Assistant for ScriptedAssistant {
        async fn run(&self, request: StageRequest) -> Result<String, AssistantError> {
            let stage = request.stage;
            self.calls.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .get(&stage)
                .cloned()
                .unwrap_or_else(|| Ok(String::new()))
        }

        async fn update_instructions(&self, stage: Stage, instructions: &str) -> Result<()> {
            if let Some(delay) = self.update_delay {
                sleep(delay).await;
            }
            if self.fail_updates {
                anyhow::bail!("assistant service returned 500");
            }
            self.updates
                .lock()
                .unwrap()
                .push((stage, instructions.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl KnowledgeBase for ScriptedAssistant {
        async fn list_files(&self, collection_id: &str) -> Result<Vec<KnowledgeFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .get(collection_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn delete_file(&self, collection_id: &str, file_id: &str) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            let entries = files.entry(collection_id.to_string()).or_default();
            let before = entries.len();
            entries.retain(|file| file.id != file_id);
            if entries.len() == before {
                anyhow::bail!("No file {} in {}", file_id, collection_id);
            }
            Ok(())
        }

        async fn upload_file(
            &self,
            collection_id: &str,
            file_name: &str,
            bytes: Vec<u8>,
        ) -> Result<String> {
            let mut files = self.files.lock().unwrap();
            let entries = files.entry(collection_id.to_string()).or_default();
            let id = format!("file-{}-{}", entries.len() + 1, bytes.len());
            entries.push(KnowledgeFile {
                id: id.clone(),
                name: file_name.to_string(),
            });
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: &str) -> RunObject {
        RunObject {
            id: "run_1".to_string(),
            thread_id: "thread_1".to_string(),
            status: status.to_string(),
            last_error: None,
        }
    }

    #[test]
    fn run_status_classification() {
        assert_eq!(run_progress(&run("queued")), RunProgress::Pending);
        assert_eq!(run_progress(&run("in_progress")), RunProgress::Pending);
        assert_eq!(run_progress(&run("completed")), RunProgress::Completed);

        let mut failed = run("failed");
        failed.last_error = Some(RunLastError {
            code: "rate_limit_exceeded".to_string(),
            message: "slow down".to_string(),
        });
        match run_progress(&failed) {
            RunProgress::Failed(AssistantError::Terminal { status, detail }) => {
                assert_eq!(status, "failed");
                assert!(detail.contains("slow down"));
            }
            other => panic!("unexpected progress: {:?}", other),
        }
        assert!(matches!(
            run_progress(&run("expired")),
            RunProgress::Failed(_)
        ));
    }

    #[test]
    fn run_body_carries_image_and_collection_scope() {
        let body = build_run_body(
            "asst_tech",
            &StageRequest {
                stage: Stage::Technical,
                instructions: "look closely".to_string(),
                text: "Analyze this: Abenteuer 3".to_string(),
                image_url: Some("https://cdn.example/popup.jpg".to_string()),
                collection_id: Some("vs_basic".to_string()),
            },
        );
        assert_eq!(body["assistant_id"], "asst_tech");
        assert_eq!(body["instructions"], "look closely");
        let content = &body["thread"]["messages"][0]["content"];
        assert_eq!(content[1]["image_url"]["url"], "https://cdn.example/popup.jpg");
        assert_eq!(
            body["tool_resources"]["file_search"]["vector_store_ids"][0],
            "vs_basic"
        );
    }

    #[test]
    fn run_body_omits_empty_scope() {
        let body = build_run_body(
            "asst_meta",
            &StageRequest {
                stage: Stage::Synthesis,
                instructions: String::new(),
                text: "Technical Feedback: a".to_string(),
                image_url: None,
                collection_id: None,
            },
        );
        assert!(body.get("tool_resources").is_none());
        assert_eq!(body["thread"]["messages"][0]["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn first_text_reads_newest_message() {
        let messages: ListResponse<ThreadMessage> = serde_json::from_str(
            r#"{"data": [{"content": [
                {"type": "image_file", "image_file": {"file_id": "f"}},
                {"type": "text", "text": {"value": "Matches Adventure 4", "annotations": []}}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(first_text(messages).as_deref(), Some("Matches Adventure 4"));

        let empty: ListResponse<ThreadMessage> = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert_eq!(first_text(empty), None);
    }
}
