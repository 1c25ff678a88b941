//! Errors returned while loading settings and building the sampler.
use std::io;
use thiserror::Error;

/// Errors raised while reading or parsing settings documents.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SettingsError {
    /// The settings source could not be read.
    #[error("failed to read settings: {0}")]
    Io(#[from] io::Error),

    /// The settings document is not valid JSON or does not have the expected shape.
    #[error("failed to parse settings: {0}")]
    Json(#[from] serde_json::Error),

    /// The settings document is well formed but its content is unusable.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Errors raised while building a [`RemoteSampler`](crate::RemoteSampler) or its helpers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SamplerError {
    /// The sampler configuration is invalid.
    #[error("invalid sampler configuration: {0}")]
    Config(String),

    /// Initial settings could not be loaded.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// A background thread could not be started.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(io::Error),
}
