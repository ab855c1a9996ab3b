//! Control channel envelopes. Every message is a JSON object tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::assistant::KnowledgeFile;
use crate::models::{EnrichmentRecord, KnowledgeCollection, Stage};
use crate::pipeline::{EnrichmentOutcome, StageInputs, StageInstructions};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    InitialData,
    UpdatePrompt {
        #[serde(alias = "agent")]
        stage: Stage,
        #[serde(alias = "prompt")]
        text: String,
    },
    ProcessNextPost,
    ReprocessCurrentPost,
    PreviewPromptResponse {
        #[serde(alias = "agent")]
        stage: Stage,
        #[serde(alias = "prompt")]
        text: String,
    },
    GetVectorStoreFiles,
    DeleteVectorStoreFile {
        file_id: String,
        vector_store_type: String,
    },
    UploadFile {
        file_name: String,
        /// Hex-encoded file bytes.
        file_content: String,
        vector_store_type: String,
    },
    #[serde(other)]
    Unknown,
}

/// Enrichment result as rendered on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultView {
    pub post_id: i64,
    pub user_id: String,
    pub user_name: String,
    pub adventure_number: String,
    pub image_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_store_used: Option<String>,
    pub technical_input: String,
    pub technical_feedback: String,
    pub technical_prompt: String,
    pub historical_input: String,
    pub historical_feedback: String,
    pub historical_prompt: String,
    pub meta_input: String,
    pub meta_feedback: String,
    pub meta_prompt: String,
    pub rating: i64,
    pub reprocessed: bool,
}

impl ResultView {
    fn build(
        record: &EnrichmentRecord,
        user_name: &str,
        collection: Option<KnowledgeCollection>,
        inputs: StageInputs,
        instructions: StageInstructions,
        reprocessed: bool,
    ) -> Self {
        Self {
            post_id: record.post_id,
            user_id: record.user_id.to_string(),
            user_name: user_name.to_string(),
            adventure_number: record.adventure_label.clone(),
            image_urls: record.image_urls.clone(),
            vector_store_used: collection.map(|c| c.label().to_string()),
            technical_input: inputs.technical,
            technical_feedback: record.technical_analysis.clone(),
            technical_prompt: instructions.technical,
            historical_input: inputs.historical,
            historical_feedback: record.historical_analysis.clone(),
            historical_prompt: instructions.historical,
            meta_input: inputs.synthesis,
            meta_feedback: record.synthesis.clone(),
            meta_prompt: instructions.synthesis,
            rating: record.rating,
            reprocessed,
        }
    }

    pub fn from_outcome(outcome: &EnrichmentOutcome, user_name: &str, reprocessed: bool) -> Self {
        Self::build(
            &outcome.record,
            user_name,
            Some(outcome.collection),
            outcome.inputs.clone(),
            outcome.instructions.clone(),
            reprocessed,
        )
    }

    /// View of a stored record; the collection it used is not persisted.
    pub fn from_record(
        record: &EnrichmentRecord,
        user_name: &str,
        instructions: StageInstructions,
    ) -> Self {
        Self::build(
            record,
            user_name,
            None,
            StageInputs::for_record(record),
            instructions,
            false,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    EnrichmentResult(ResultView),
    InitialData(ResultView),
    PromptPreview {
        stage: Stage,
        post_id: i64,
        output: String,
    },
    Info {
        message: String,
    },
    Error {
        error: String,
    },
    KnowledgeFiles {
        advanced_vector_store_files: Vec<KnowledgeFile>,
        basic_vector_store_files: Vec<KnowledgeFile>,
    },
}

impl Outbound {
    pub fn info(message: impl Into<String>) -> Self {
        Outbound::Info {
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Outbound::Error {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_accept_legacy_field_names() {
        let command: Command =
            serde_json::from_str(r#"{"type": "update_prompt", "agent": "meta", "prompt": "hi"}"#)
                .unwrap();
        assert_eq!(
            command,
            Command::UpdatePrompt {
                stage: Stage::Synthesis,
                text: "hi".to_string()
            }
        );

        let command: Command = serde_json::from_str(
            r#"{"type": "preview_prompt_response", "stage": "technical", "text": "x"}"#,
        )
        .unwrap();
        assert!(matches!(
            command,
            Command::PreviewPromptResponse {
                stage: Stage::Technical,
                ..
            }
        ));
    }

    #[test]
    fn unknown_types_parse_as_unknown() {
        let command: Command = serde_json::from_str(r#"{"type": "dance"}"#).unwrap();
        assert_eq!(command, Command::Unknown);
        assert!(serde_json::from_str::<Command>(r#"{"no_type": true}"#).is_err());
    }

    #[test]
    fn outbound_envelopes_are_tagged() {
        let value = serde_json::to_value(Outbound::info("No unprocessed posts available.")).unwrap();
        assert_eq!(
            value,
            json!({"type": "info", "message": "No unprocessed posts available."})
        );

        let value = serde_json::to_value(Outbound::PromptPreview {
            stage: Stage::Synthesis,
            post_id: 4,
            output: "short".to_string(),
        })
        .unwrap();
        assert_eq!(value["type"], "prompt_preview");
        assert_eq!(value["stage"], "synthesis");
    }
}
