mod error;

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

pub use self::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Active,
    Inactive,
}

/// Where a dependent endpoint draws its path parameter from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub parent_collection: String,
    pub parent_key: String,
}

/// One logical REST resource declared in the endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub name: String,
    pub path_template: String,
    pub target_collection: Option<String>,
    pub status: EndpointStatus,
    pub dependency: Option<Dependency>,
}

impl EndpointSpec {
    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    pub fn is_dependent(&self) -> bool {
        self.dependency.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    name: String,
    end_point: String,
    #[serde(default)]
    mongodb_collection: Option<String>,
    #[serde(default)]
    pythagorazen_status: Option<String>,
    #[serde(default)]
    end_point_dependencies: Option<RawDependency>,
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    #[serde(default)]
    mongodb_dependency_collection: Option<String>,
    #[serde(default)]
    mongodb_dependency_collection_key: Option<String>,
}

impl RawEndpoint {
    fn into_spec(self) -> Result<EndpointSpec, RegistryError> {
        let status = match self.pythagorazen_status.as_deref() {
            Some("active") => EndpointStatus::Active,
            _ => EndpointStatus::Inactive,
        };

        let dependency = match self.end_point_dependencies {
            None => None,
            // `{}` declares nothing to resolve, so the endpoint stays independent.
            Some(RawDependency {
                mongodb_dependency_collection: None,
                mongodb_dependency_collection_key: None,
            }) => None,
            Some(RawDependency {
                mongodb_dependency_collection: Some(parent_collection),
                mongodb_dependency_collection_key: Some(parent_key),
            }) if !parent_collection.is_empty() && !parent_key.is_empty() => Some(Dependency {
                parent_collection,
                parent_key,
            }),
            Some(_) => {
                return Err(RegistryError::Parse(format!(
                    "endpoint '{}' has an incomplete dependency",
                    self.name
                )))
            }
        };

        Ok(EndpointSpec {
            name: self.name,
            path_template: self.end_point,
            target_collection: self.mongodb_collection.filter(|c| !c.is_empty()),
            status,
            dependency,
        })
    }
}

/// Read-only view over the declared endpoints, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    specs: Vec<EndpointSpec>,
}

impl EndpointRegistry {
    pub fn from_specs(specs: Vec<EndpointSpec>) -> Self {
        Self { specs }
    }

    /// Parse the grouped configuration format:
    /// `{ "<group>": [ { "<key>": { "name": ..., "end_point": ... } }, ... ], ... }`.
    ///
    /// Items that do not have that shape are skipped with a warning.
    pub fn from_json_str(raw: &str) -> Result<Self, RegistryError> {
        let root: Value = serde_json::from_str(raw)?;
        let groups = root
            .as_object()
            .ok_or_else(|| RegistryError::Parse("top level must be an object".to_string()))?;

        let mut specs = Vec::new();
        for (group, items) in groups {
            let Some(items) = items.as_array() else {
                log::warn!("Endpoint group '{group}' is not a list, skipping");
                continue;
            };

            for item in items {
                let Some(details) = item.as_object().and_then(|o| o.values().next()) else {
                    log::warn!("Malformed entry in endpoint group '{group}', skipping");
                    continue;
                };

                let spec = serde_json::from_value::<RawEndpoint>(details.clone())
                    .map_err(RegistryError::from)
                    .and_then(RawEndpoint::into_spec);
                match spec {
                    Ok(spec) => specs.push(spec),
                    Err(e) => log::warn!("Skipping endpoint in group '{group}': {e}"),
                }
            }
        }

        log::debug!("Loaded {} endpoint specs", specs.len());
        Ok(Self { specs })
    }

    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Like [`from_path`](Self::from_path), but an unreadable or malformed file
    /// degrades to an empty registry.
    pub fn load(path: &Path) -> Self {
        match Self::from_path(path) {
            Ok(registry) => registry,
            Err(e) => {
                log::error!(
                    "Failed to load endpoint config {}: {e}; continuing with no endpoints",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointSpec> {
        self.specs.iter()
    }

    pub fn lookup(&self, name: &str) -> Result<&EndpointSpec, RegistryError> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    fn active_names_where<P>(&self, predicate: P) -> Vec<String>
    where
        P: Fn(&EndpointSpec) -> bool,
    {
        let mut seen = HashSet::new();
        self.specs
            .iter()
            .filter(|s| s.is_active() && predicate(*s))
            .filter(|s| seen.insert(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn active_endpoint_names(&self) -> Vec<String> {
        self.active_names_where(|_| true)
    }

    pub fn active_independent_endpoint_names(&self) -> Vec<String> {
        self.active_names_where(|s| !s.is_dependent())
    }

    pub fn active_dependent_endpoint_names(&self) -> Vec<String> {
        self.active_names_where(EndpointSpec::is_dependent)
    }

    pub fn active_collection_names(&self) -> Vec<String> {
        self.specs
            .iter()
            .filter(|s| s.is_active())
            .filter_map(|s| s.target_collection.clone())
            .collect()
    }

    pub fn active_dependent_collection_names(&self) -> Vec<String> {
        self.specs
            .iter()
            .filter(|s| s.is_active() && s.is_dependent())
            .filter_map(|s| s.target_collection.clone())
            .collect()
    }

    /// Names declared more than once, each reported once.
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut dupes = Vec::new();
        for spec in &self.specs {
            if !seen.insert(spec.name.as_str()) && reported.insert(spec.name.as_str()) {
                dupes.push(spec.name.clone());
            }
        }
        dupes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "users": [
            {"list_users": {
                "name": "users",
                "end_point": "/api/v2/users.json",
                "mongodb_collection": "users",
                "pythagorazen_status": "active"
            }},
            {"list_org_users": {
                "name": "organization_users",
                "end_point": "/api/v2/organizations/{organization_id}/users.json",
                "mongodb_collection": "organization_users",
                "pythagorazen_status": "active",
                "end_point_dependencies": {
                    "mongodb_dependency_collection": "organizations",
                    "mongodb_dependency_collection_key": "id"
                }
            }}
        ],
        "organizations": [
            {"list_orgs": {
                "name": "organizations",
                "end_point": "/api/v2/organizations.json",
                "mongodb_collection": "organizations",
                "pythagorazen_status": "active"
            }},
            {"list_brands": {
                "name": "brands",
                "end_point": "/api/v2/brands.json",
                "mongodb_collection": "brands",
                "pythagorazen_status": "inactive"
            }},
            {"no_status": {
                "name": "tags",
                "end_point": "/api/v2/tags.json"
            }}
        ]
    }"#;

    #[test]
    fn splits_active_endpoints_by_dependency() {
        let registry = EndpointRegistry::from_json_str(CONFIG).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(
            registry.active_independent_endpoint_names(),
            vec!["users".to_string(), "organizations".to_string()]
        );
        assert_eq!(
            registry.active_dependent_endpoint_names(),
            vec!["organization_users".to_string()]
        );
        assert_eq!(registry.active_endpoint_names().len(), 3);
        assert_eq!(
            registry.active_dependent_collection_names(),
            vec!["organization_users".to_string()]
        );
    }

    #[test]
    fn lookup_returns_spec_or_not_found() {
        let registry = EndpointRegistry::from_json_str(CONFIG).unwrap();
        let spec = registry.lookup("organization_users").unwrap();
        assert_eq!(
            spec.dependency,
            Some(Dependency {
                parent_collection: "organizations".to_string(),
                parent_key: "id".to_string(),
            })
        );
        assert_eq!(spec.target_collection.as_deref(), Some("organization_users"));

        let tags = registry.lookup("tags").unwrap();
        assert_eq!(tags.status, EndpointStatus::Inactive);
        assert!(tags.target_collection.is_none());

        match registry.lookup("missing") {
            Err(RegistryError::NotFound(name)) => assert_eq!(name, "missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn malformed_file_degrades_to_empty_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("endpoints.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = EndpointRegistry::load(&path);
        assert!(registry.is_empty());
        assert!(registry.active_independent_endpoint_names().is_empty());

        let missing = EndpointRegistry::load(&dir.path().join("absent.json"));
        assert!(missing.is_empty());
    }

    #[test]
    fn incomplete_dependency_is_skipped() {
        let raw = r#"{"g": [
            {"a": {"name": "broken", "end_point": "/x/{id}", "pythagorazen_status": "active",
                   "end_point_dependencies": {"mongodb_dependency_collection": "parents"}}},
            {"b": {"name": "empty_dep", "end_point": "/y", "pythagorazen_status": "active",
                   "end_point_dependencies": {}}}
        ]}"#;
        let registry = EndpointRegistry::from_json_str(raw).unwrap();
        assert!(registry.lookup("broken").is_err());
        assert_eq!(
            registry.active_independent_endpoint_names(),
            vec!["empty_dep".to_string()]
        );
    }

    #[test]
    fn duplicate_names_reported_once() {
        let raw = r#"{"g": [
            {"a": {"name": "users", "end_point": "/a", "pythagorazen_status": "active"}},
            {"b": {"name": "users", "end_point": "/b", "pythagorazen_status": "active"}},
            {"c": {"name": "users", "end_point": "/c"}}
        ]}"#;
        let registry = EndpointRegistry::from_json_str(raw).unwrap();
        assert_eq!(registry.duplicate_names(), vec!["users".to_string()]);
        assert_eq!(registry.active_endpoint_names(), vec!["users".to_string()]);
        assert_eq!(registry.lookup("users").unwrap().path_template, "/a");
    }
}
