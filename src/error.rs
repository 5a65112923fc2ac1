//! Error types for tree actions, row sources and builds.

use thiserror::Error;

/// Setup-time problems with a tree action. Fatal for that action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Tree action '{0}' has no entity configured")]
    MissingEntity(String),

    #[error("Tree action '{action}' references unknown entity '{entity}'")]
    UnknownEntity { action: String, entity: String },

    #[error("Tree action '{0}' configures icons without a 'default' entry")]
    MissingDefaultIcon(String),

    #[error("Tree action '{action}' has an empty '{field}' setting")]
    EmptyField { action: String, field: &'static str },

    #[error("Tree action '{action}' has an unusable cache lifetime of {seconds} seconds")]
    InvalidCacheLifetime { action: String, seconds: u64 },
}

/// Failures reported by a row source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown relation '{relation}' on entity '{entity}'")]
    UnknownRelation { entity: String, relation: String },
}

/// Errors surfaced by `TreeFlattener::build`.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Row source error: {0}")]
    Source(#[from] SourceError),
}
