use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Template render error: {0}")]
    Render(String),

    #[error("Unsafe statement rejected: {0}")]
    UnsafeQuery(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Run cancelled by caller")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
