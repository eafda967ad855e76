use thiserror::Error;

#[derive(Error, Debug)]
pub enum SttError {
    #[error(
        "API key not found for {provider}. Set {env_var} environment variable or pass it explicitly."
    )]
    MissingApiKey { provider: String, env_var: String },

    #[error("audio is too short to transcribe ({0} bytes)")]
    AudioTooShort(u64),

    #[error("upload of {size} bytes exceeds the provider limit of {limit} bytes")]
    UploadTooLarge { size: u64, limit: u64 },

    #[error("API error{}: {message}", status_code.map(|c| format!(" (HTTP {})", c)).unwrap_or_default())]
    Api {
        message: String,
        status_code: Option<u16>,
    },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SttError>;
