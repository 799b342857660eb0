//! Error types for uowq.
//!
//! Collaborator calls (store, queue) never raise; they return
//! [`ActionError`](crate::store::ActionError) values. This type covers
//! everything else: startup, adapters, and dispatcher fan-out.

use thiserror::Error;

use crate::store::ActionError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid settings file: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("{} dispatched item(s) failed: {}", .0.len(), summarize(.0))]
    Aggregate(Vec<Error>),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
