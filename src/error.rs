use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("Unsupported file type: .{extension}")]
    UnsupportedFormat { extension: String },

    #[error("Failed to extract text from {file}: {message}")]
    Extraction { file: String, message: String },

    #[error("No text could be extracted from {file}")]
    EmptyDocument { file: String },

    #[error("Embedding provider error: {message}")]
    EmbeddingProvider { message: String, retryable: bool },

    #[error("LLM provider error: {message}")]
    LlmProvider { message: String, retryable: bool },

    #[error("Embedding space mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("Failed to load index from {path}: {message}")]
    IndexLoad { path: String, message: String },

    #[error("Failed to persist index to {path}: {message}")]
    IndexPersist { path: String, message: String },

    #[error("{0}")]
    Validation(String),

    #[error("No documents available")]
    NoDocuments,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RagError {
    pub fn unsupported(extension: impl Into<String>) -> Self {
        RagError::UnsupportedFormat {
            extension: extension.into(),
        }
    }

    pub fn embedding(message: impl Into<String>, retryable: bool) -> Self {
        RagError::EmbeddingProvider {
            message: message.into(),
            retryable,
        }
    }

    pub fn llm(message: impl Into<String>, retryable: bool) -> Self {
        RagError::LlmProvider {
            message: message.into(),
            retryable,
        }
    }

    /// Only transient provider failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::EmbeddingProvider { retryable, .. } => *retryable,
            RagError::LlmProvider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Text returned to HTTP callers. Provider internals stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            RagError::UnsupportedFormat { extension } => format!(
                "Unsupported file type: .{}. Supported types: .docx, .doc, .pdf, .txt, .md",
                extension
            ),
            RagError::Extraction { file, .. } => {
                format!("Could not read {}. The file may be damaged or password protected.", file)
            }
            RagError::EmptyDocument { file } => {
                format!("No readable text was found in {}.", file)
            }
            RagError::EmbeddingProvider { .. } => {
                "The embedding service is unavailable right now. Please try again in a moment."
                    .to_string()
            }
            RagError::LlmProvider { .. } => {
                "The language model service is unavailable right now. Please try again in a moment."
                    .to_string()
            }
            RagError::SchemaMismatch { .. } => {
                "The uploaded document could not be combined with the existing documents."
                    .to_string()
            }
            RagError::IndexLoad { .. } | RagError::IndexPersist { .. } | RagError::Io(_) => {
                "The document index could not be accessed. Please try again later.".to_string()
            }
            RagError::Validation(message) => message.clone(),
            RagError::NoDocuments => {
                "No documents available. Please upload a file first.".to_string()
            }
        }
    }
}

/// Classifies a provider HTTP status: auth and other client errors are final,
/// rate limits and server errors are transient.
pub fn status_is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
