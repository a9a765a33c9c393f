use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Endpoint not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Endpoint config parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}
