use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum TrendsError {
    #[error("no bearer token configured for the trends API")]
    MissingCredential,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("trends API returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("trends API returned no usable posts")]
    Empty,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no API key configured for the text-generation service")]
    MissingCredential,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("text-generation API returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse generation output: {0}")]
    OutputParse(String),
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("no API key configured for the image-generation service")]
    MissingCredential,
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("image API returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("image API response had no image reference")]
    NoImage,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A second trigger arrived while a batch was in flight. Expected
    /// condition: callers fail fast, nothing is queued.
    #[error("a generation run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Run(#[from] anyhow::Error),
}
