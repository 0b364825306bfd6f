//! agg_formats
//!
//! The format handler registry, the format router, and the builtin
//! handlers: text proxy-list handlers (`npvt`, `npvtsub`, `conf_lines`) and
//! the opaque-bundle family that carries proprietary binary containers
//! through untouched.

pub mod handler;
pub mod handlers;
pub mod registry;
pub mod router;

pub use handler::{BlobFetcher, BuildOutput, BuildRecord, FormatError, FormatHandler, NoBlobs, ParseMeta, ParsedRecord};
pub use registry::FormatRegistry;
pub use router::decide_format;
