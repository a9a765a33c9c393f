use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { status: u16, url: String },

    #[error("Invalid JSON body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected response shape from {0}: top level is not an object")]
    UnexpectedShape(String),

    #[error("Response from {0} sets meta.has_more without meta.after_cursor")]
    MissingCursor(String),

    #[error("Stopped after {0} pages without reaching the last page")]
    PageLimit(usize),

    #[error("Pagination exceeded the {0:?} deadline")]
    Deadline(std::time::Duration),
}
