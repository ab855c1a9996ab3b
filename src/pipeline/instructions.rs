use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::assistant::Assistant;
use crate::models::Stage;

const DEFAULT_TECHNICAL: &str = "You are a technical reviewer. Analyze the attached haircut image \
against the reference adventure files and name the closest adventure as 'Adventure <number>'.";
const DEFAULT_HISTORICAL: &str = "You review a student's past submissions. Summarize their \
progress, recurring strengths and recurring issues.";
const DEFAULT_SYNTHESIS: &str = "Combine the technical and historical feedback into one \
encouraging, concrete comment for the student.";

/// Current instructions for each stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInstructions {
    pub technical: String,
    pub historical: String,
    pub synthesis: String,
}

impl Default for StageInstructions {
    fn default() -> Self {
        Self {
            technical: DEFAULT_TECHNICAL.to_string(),
            historical: DEFAULT_HISTORICAL.to_string(),
            synthesis: DEFAULT_SYNTHESIS.to_string(),
        }
    }
}

impl StageInstructions {
    pub fn get(&self, stage: Stage) -> &str {
        match stage {
            Stage::Technical => &self.technical,
            Stage::Historical => &self.historical,
            Stage::Synthesis => &self.synthesis,
        }
    }

    /// Swap in new text, returning the old.
    pub fn replace(&mut self, stage: Stage, text: String) -> String {
        let slot = match stage {
            Stage::Technical => &mut self.technical,
            Stage::Historical => &mut self.historical,
            Stage::Synthesis => &mut self.synthesis,
        };
        std::mem::replace(slot, text)
    }
}

/// Process-wide, last-writer-wins stage configuration.
#[derive(Clone, Default)]
pub struct StageConfig {
    inner: Arc<RwLock<StageInstructions>>,
}

impl StageConfig {
    pub fn new(initial: StageInstructions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn instructions(&self, stage: Stage) -> String {
        self.inner.read().await.get(stage).to_string()
    }

    pub async fn snapshot(&self) -> StageInstructions {
        self.inner.read().await.clone()
    }

    /// Replace one stage's instructions and push them to the assistant.
    /// The local value is rolled back when the push fails or outlives `deadline`.
    pub async fn update(
        &self,
        stage: Stage,
        text: String,
        assistant: &dyn Assistant,
        deadline: Duration,
    ) -> Result<()> {
        let mut guard = self.inner.write().await;
        let previous = guard.replace(stage, text.clone());

        let push = assistant.update_instructions(stage, &text);
        let pushed = match tokio::time::timeout(deadline, push).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "assistant did not confirm within {}s",
                deadline.as_secs()
            )),
        };
        if let Err(e) = pushed {
            guard.replace(stage, previous);
            tracing::warn!("Rolled back {} instructions: {:#}", stage, e);
            return Err(e);
        }

        tracing::info!("Updated {} instructions ({} chars)", stage, text.len());
        Ok(())
    }

    /// Temporarily replace one stage's instructions. Other readers wait until the
    /// returned guard is dropped, at which point the previous text is restored.
    pub async fn override_stage(&self, stage: Stage, text: String) -> StageOverride {
        let mut guard = self.inner.clone().write_owned().await;
        let previous = guard.replace(stage, text);
        StageOverride {
            guard,
            stage,
            previous: Some(previous),
        }
    }
}

pub struct StageOverride {
    guard: OwnedRwLockWriteGuard<StageInstructions>,
    stage: Stage,
    previous: Option<String>,
}

impl StageOverride {
    pub fn instructions(&self) -> &str {
        self.guard.get(self.stage)
    }
}

impl Drop for StageOverride {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.guard.replace(self.stage, previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::testing::ScriptedAssistant;
    use std::time::Duration;

    #[tokio::test]
    async fn update_propagates_and_rolls_back_on_failure() {
        let config = StageConfig::default();
        let assistant = ScriptedAssistant::new();

        config
            .update(
                Stage::Technical,
                "count the layers".to_string(),
                &assistant,
                Duration::from_secs(5),
            )
            .await
            .expect("update");
        assert_eq!(config.instructions(Stage::Technical).await, "count the layers");
        assert_eq!(assistant.updates.lock().unwrap().len(), 1);

        let mut failing = ScriptedAssistant::new();
        failing.fail_updates = true;
        assert!(config
            .update(
                Stage::Technical,
                "never applied".to_string(),
                &failing,
                Duration::from_secs(5),
            )
            .await
            .is_err());
        assert_eq!(config.instructions(Stage::Technical).await, "count the layers");
    }

    #[tokio::test]
    async fn stalled_update_is_rolled_back_and_releases_readers() {
        let config = StageConfig::default();
        let original = config.instructions(Stage::Historical).await;
        let mut stalled = ScriptedAssistant::new();
        stalled.update_delay = Some(Duration::from_secs(3600));

        let err = config
            .update(
                Stage::Historical,
                "never confirmed".to_string(),
                &stalled,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not confirm"));

        let read =
            tokio::time::timeout(Duration::from_millis(100), config.instructions(Stage::Historical))
                .await
                .expect("lock released");
        assert_eq!(read, original);
    }

    #[tokio::test]
    async fn override_is_exclusive_and_restored_on_drop() {
        let config = StageConfig::default();
        let original = config.instructions(Stage::Synthesis).await;

        let guard = config
            .override_stage(Stage::Synthesis, "be brief".to_string())
            .await;
        assert_eq!(guard.instructions(), "be brief");

        // readers cannot observe the override
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), config.instructions(Stage::Synthesis))
                .await;
        assert!(blocked.is_err());

        drop(guard);
        assert_eq!(config.instructions(Stage::Synthesis).await, original);
    }

    #[tokio::test]
    async fn override_is_restored_when_task_is_aborted() {
        let config = StageConfig::default();
        let original = config.snapshot().await;

        let held = config.clone();
        let task = tokio::spawn(async move {
            let _guard = held
                .override_stage(Stage::Historical, "temporary".to_string())
                .await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;

        assert_eq!(config.snapshot().await, original);
    }
}
