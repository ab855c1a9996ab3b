use crate::models::Stage;

/// Failure kinds surfaced by fetch cycles, enrichment runs and the session hub.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("{stage} stage timed out after {seconds}s")]
    StageTimeout { stage: Stage, seconds: u64 },

    #[error("{stage} stage failed: {reason}")]
    StageFailed { stage: Stage, reason: String },

    #[error("post {0} not found")]
    NotFound(i64),

    #[error("delivery to session {0} failed")]
    DeliveryFailure(String),

    #[error("store error: {0}")]
    Store(String),
}

impl PipelineError {
    pub(crate) fn from_store(error: anyhow::Error) -> Self {
        match error.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound(post_id)) => PipelineError::NotFound(*post_id),
            None => PipelineError::Store(format!("{:#}", error)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("post {0} not found")]
    NotFound(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_survives_anyhow_wrapping() {
        let wrapped = anyhow::Error::new(StoreError::NotFound(9)).context("commit enrichment");
        assert!(matches!(
            PipelineError::from_store(wrapped),
            PipelineError::NotFound(9)
        ));

        let other = anyhow::anyhow!("disk full");
        assert!(matches!(
            PipelineError::from_store(other),
            PipelineError::Store(_)
        ));
    }
}
