use serde_json::Value;
use thiserror::Error;

use crate::registry::EndpointSpec;
use crate::store::{Filter, Projection, StoreError, TenantStore};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Endpoint '{0}' has no dependency to resolve")]
    NotDependent(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Replace the first `{...}` segment of `template` with `value`.
/// Templates without a placeholder come back unchanged.
pub fn substitute_first_placeholder(template: &str, value: &str) -> String {
    let Some(open) = template.find('{') else {
        return template.to_string();
    };
    let Some(close) = template[open..].find('}') else {
        return template.to_string();
    };
    let close = open + close;

    let mut out = String::with_capacity(template.len() + value.len());
    out.push_str(&template[..open]);
    out.push_str(value);
    out.push_str(&template[close + 1..]);
    out
}

/// Path form of a parent key value; `None` for null.
fn path_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Concrete request paths for a dependent endpoint, one per parent document
/// that carries a non-null key value, in parent collection order.
pub fn resolve(spec: &EndpointSpec, store: &TenantStore) -> Result<Vec<String>, ResolveError> {
    let dependency = spec
        .dependency
        .as_ref()
        .ok_or_else(|| ResolveError::NotDependent(spec.name.clone()))?;

    let Some(parent) = store.existing_collection(&dependency.parent_collection)? else {
        log::warn!(
            "Parent collection '{}' for '{}' does not exist yet",
            dependency.parent_collection,
            spec.name
        );
        return Ok(Vec::new());
    };

    let projection = Projection::include([dependency.parent_key.as_str()]);
    let rows = parent.query(&Filter::all(), Some(&projection))?;

    let paths: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get(&dependency.parent_key).and_then(path_value))
        .map(|value| substitute_first_placeholder(&spec.path_template, &value))
        .collect();

    log::info!(
        "Resolved {} paths for '{}' from {} documents in '{}'",
        paths.len(),
        spec.name,
        rows.len(),
        dependency.parent_collection
    );
    Ok(paths)
}
