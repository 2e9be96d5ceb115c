pub mod cache;
pub mod config;
pub mod error;
pub mod matcher;
pub mod oracle;
pub mod storage;

// Re-export vision types for convenience
pub use facegate_vision::{face, pipeline, Detection, Embedding, ModelPaths, Pipeline};

pub use error::{MatchError, OracleError};
pub use matcher::{Diagnostic, IdentityMatcher, MatchOutcome, MatchResult, SkipReason};
pub use oracle::{FaceOracle, OnnxOracle};
