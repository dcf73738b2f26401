#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("handle not found: {0}")]
    HandleNotFound(String),

    #[error("malformed snapshot handle buffer: need {needed} bytes, have {available}")]
    MalformedHandleBuffer { needed: usize, available: usize },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
