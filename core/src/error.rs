use thiserror::Error;

/// Image archive error types
#[derive(Error, Debug)]
pub enum ImageError {
    /// A requested name did not resolve to an image in the store
    #[error("Reference not found: {reference}")]
    ReferenceNotFound { reference: String },

    /// The archive stream is structurally malformed or fails verification
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// An entry depends on a node that is neither earlier in the stream nor in the store
    #[error("Missing dependency: {id} requires {dependency}")]
    MissingDependency { id: String, dependency: String },

    /// The image store rejected a read or a write
    #[error("Store failure: {0}")]
    StoreFailure(String),

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ImageError {
    /// Stable kebab-case name of the error kind, for user-facing output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReferenceNotFound { .. } => "reference-not-found",
            Self::CorruptArchive(_) => "corrupt-archive",
            Self::MissingDependency { .. } => "missing-dependency",
            Self::StoreFailure(_) => "store-failure",
            Self::Io(_) => "io-failure",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }

    /// Shorthand for [`ImageError::ReferenceNotFound`].
    pub fn reference_not_found(reference: impl Into<String>) -> Self {
        Self::ReferenceNotFound {
            reference: reference.into(),
        }
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImageError {
    fn from(err: serde_yaml::Error) -> Self {
        ImageError::Config(err.to_string())
    }
}

/// Result type alias for image archive operations
pub type Result<T> = std::result::Result<T, ImageError>;
