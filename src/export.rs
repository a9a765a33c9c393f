use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::store::{Filter, StoreError, TenantStore};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Collection '{0}' does not exist")]
    UnknownCollection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

/// Union of top-level keys, in first-seen order.
pub fn collect_columns(docs: &[Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for doc in docs {
        if let Some(obj) = doc.as_object() {
            for key in obj.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns
}

/// Nested values are written as compact JSON.
fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn write_csv<W: Write>(docs: &[Value], writer: W) -> Result<usize, ExportError> {
    let columns = collect_columns(docs);
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(&columns)?;
    for doc in docs {
        let row: Vec<String> = columns.iter().map(|c| cell_text(doc.get(c))).collect();
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(docs.len())
}

pub fn write_json<W: Write>(docs: &[Value], mut writer: W) -> Result<usize, ExportError> {
    serde_json::to_writer_pretty(&mut writer, docs)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(docs.len())
}

pub fn export_documents(
    docs: &[Value],
    format: ExportFormat,
    path: &Path,
) -> Result<usize, ExportError> {
    let writer = BufWriter::new(File::create(path)?);
    let written = match format {
        ExportFormat::Csv => write_csv(docs, writer)?,
        ExportFormat::Json => write_json(docs, writer)?,
    };
    log::info!("Exported {written} documents to {}", path.display());
    Ok(written)
}

/// Every document of `collection`, in insertion order.
pub fn collection_documents(store: &TenantStore, collection: &str) -> Result<Vec<Value>, ExportError> {
    let coll = store
        .existing_collection(collection)?
        .ok_or_else(|| ExportError::UnknownCollection(collection.to_string()))?;
    Ok(coll.query(&Filter::all(), None)?)
}
