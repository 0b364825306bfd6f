#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("state: {0}")]
    State(#[from] agg_state::StateError),
    #[error("blob store: {0}")]
    BlobStore(#[from] agg_blob_store::BlobStoreError),
    #[error("artifact store: {0}")]
    ArtifactStore(#[from] agg_artifact_store::ArtifactStoreError),
    #[error("format: {0}")]
    Format(#[from] agg_formats::FormatError),
    #[error("connector: {0}")]
    Connector(#[from] agg_connectors::ConnectorError),
    #[error("publisher: {0}")]
    Publisher(#[from] agg_connectors::PublisherError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no handler registered for format '{0}'")]
    UnknownFormat(String),
}
