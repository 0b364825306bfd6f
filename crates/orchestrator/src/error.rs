#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("pipeline: {0}")]
    Pipeline(#[from] agg_pipeline::PipelineError),
    #[error("state: {0}")]
    State(#[from] agg_state::StateError),
    #[error("blob store: {0}")]
    BlobStore(#[from] agg_blob_store::BlobStoreError),
    #[error("artifact store: {0}")]
    ArtifactStore(#[from] agg_artifact_store::ArtifactStoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run timed out after {0:.1}s waiting on {1}")]
    TimedOut(f64, &'static str),
}
