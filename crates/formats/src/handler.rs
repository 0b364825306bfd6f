use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid record data: {0}")]
    InvalidData(String),
    #[error("zip build failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata handed to a handler alongside the raw bytes being parsed.
#[derive(Debug, Clone, Default)]
pub struct ParseMeta {
    pub filename: Option<String>,
    pub source_id: String,
}

/// One canonical entity produced by `FormatHandler::parse`.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub unique_hash: String,
    pub data: Value,
}

/// A record as read back from the state repository for a build: its
/// persisted type plus payload.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub record_type: String,
    pub data: Value,
}

/// Result of a build: the artifact bytes plus how many input records could
/// not be materialized (missing blob), so the caller can log a warning
/// without failing the whole route.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub bytes: Vec<u8>,
    pub skipped: usize,
}

/// Handed to `build` for bundle-style handlers that need to fetch the
/// original raw bytes by blob hash. Implemented by the pipeline crate over
/// the raw blob store, keeping this crate free of a dependency on it.
pub trait BlobFetcher {
    fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>>;
}

/// A no-op fetcher for handlers and tests that never need blob access.
pub struct NoBlobs;
impl BlobFetcher for NoBlobs {
    fn fetch(&self, _hash_hex: &str) -> Option<Vec<u8>> {
        None
    }
}

pub trait FormatHandler: Send + Sync {
    fn format_id(&self) -> &'static str;

    fn parse(&self, bytes: &[u8], meta: &ParseMeta) -> Result<Vec<ParsedRecord>, FormatError>;

    fn build(
        &self,
        records: &[BuildRecord],
        blobs: &dyn BlobFetcher,
    ) -> Result<BuildOutput, FormatError>;

    /// Whether builds of this format are blob-dependent (bundle formats):
    /// the raw blob store must retain referenced blobs until no active
    /// record needs them.
    fn is_blob_dependent(&self) -> bool {
        false
    }
}
