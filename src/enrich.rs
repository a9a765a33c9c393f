use std::collections::HashMap;

use serde_json::Value;

use crate::store::{Filter, StoreError, TenantStore};

pub const USERS: &str = "users";
pub const ORGANIZATIONS: &str = "organizations";
pub const GROUPS: &str = "groups";
pub const CUSTOM_ROLES: &str = "custom_roles";

/// id (as JSON text) -> name, for one lookup collection.
fn name_lookup(store: &TenantStore, collection: &str) -> Result<HashMap<String, String>, StoreError> {
    let Some(coll) = store.existing_collection(collection)? else {
        return Ok(HashMap::new());
    };
    let mut names = HashMap::new();
    for doc in coll.query(&Filter::all(), None)? {
        if let (Some(id), Some(name)) = (doc.get("id"), doc.get("name").and_then(Value::as_str)) {
            names.insert(id.to_string(), name.to_string());
        }
    }
    Ok(names)
}

fn resolve_name(doc: &Value, field: &str, lookup: &HashMap<String, String>, default: &str) -> Value {
    let name = match doc.get(field) {
        Some(Value::Null) | None => None,
        Some(id) => lookup.get(&id.to_string()),
    };
    Value::String(name.map(String::as_str).unwrap_or(default).to_string())
}

/// Users with organization, default group and custom role names resolved,
/// plus a link to the user in the agent interface.
pub fn enrich_users(store: &TenantStore, base_url: &str) -> Result<Vec<Value>, StoreError> {
    let Some(users) = store.existing_collection(USERS)? else {
        return Ok(Vec::new());
    };
    let organizations = name_lookup(store, ORGANIZATIONS)?;
    let groups = name_lookup(store, GROUPS)?;
    let roles = name_lookup(store, CUSTOM_ROLES)?;
    let base_url = base_url.trim_end_matches('/');

    let mut enriched = Vec::new();
    for mut user in users.query(&Filter::all(), None)? {
        let organization_name =
            resolve_name(&user, "organization_id", &organizations, "No Organization");
        let default_group_name = resolve_name(&user, "default_group_id", &groups, "None");
        let custom_role_name = resolve_name(&user, "custom_role_id", &roles, "None");
        let url = user
            .get("id")
            .map(|id| Value::String(format!("{base_url}/agent/users/{}", cell(id))));

        if let Some(obj) = user.as_object_mut() {
            obj.insert("custom_role_name".to_string(), custom_role_name);
            obj.insert("default_group_name".to_string(), default_group_name);
            obj.insert("organization_name".to_string(), organization_name);
            if let Some(url) = url {
                obj.insert("url".to_string(), url);
            }
        }
        enriched.push(user);
    }

    log::info!("Enriched {} users for tenant '{}'", enriched.len(), store.tenant());
    Ok(enriched)
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
