use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {0}")]
    Process(String),

    #[error("runner error: {0}")]
    Runner(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("pr state error: {0}")]
    PrState(String),

    #[error("aggregate error: {0}")]
    Aggregate(String),

    #[error("triage error: {0}")]
    Triage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
