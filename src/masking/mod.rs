//! # Masking
//!
//! De-identifies data in transit between two databases.
//!
//! - [`transform`] - the closed set of value transformers, resolved by rule name
//! - [`plan`] - rules compiled against a table's columns
//! - [`stream`] - streaming transform over COPY text dumps
//! - [`pipeline`] - concurrent, fail-fast per-table dump → mask → restore

pub mod pipeline;
pub mod plan;
pub mod stream;
pub mod transform;

pub use pipeline::{MaskingPipeline, MaskingReport};
pub use plan::MaskingPlan;
pub use stream::MaskingStream;
pub use transform::Transformer;

use crate::database::DatabaseError;

/// Masking errors
#[derive(Debug, thiserror::Error)]
pub enum MaskingError {
    /// A rule names a transformer that does not exist; nothing is masked
    #[error("unknown masking rule '{0}'")]
    UnknownRule(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("masking run was cancelled")]
    Cancelled,
    #[error("masking task failed: {0}")]
    Task(String),
}
