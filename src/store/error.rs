use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Documents must be a list, got {0}")]
    NotASequence(String),

    #[error("Document at position {0} is not an object")]
    NotAnObject(usize),

    #[error("Duplicate value {value} for unique index '{field}' on collection '{collection}'")]
    DuplicateKey {
        collection: String,
        field: String,
        value: String,
    },

    #[error("Invalid name: {0}")]
    InvalidName(String),
}
