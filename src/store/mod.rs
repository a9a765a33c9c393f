// Per-tenant document store on sled.
//
// Layout inside a tenant database:
//   collection:<name>          row key (u64 BE, monotonic) -> JSON document
//   index:<name>:<field>       "<json value>\0<row key>"   -> row key
//   __indexes__                "<name>\0<field>"           -> IndexDef (bincode)

mod error;
mod filter;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::error::StoreError;
pub use self::filter::{Filter, Projection};

const COLLECTION_PREFIX: &str = "collection:";
const INDEX_META_TREE: &str = "__indexes__";

const LOCK_RETRIES: u32 = 100;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

// sled drops its file lock from the flusher thread some time after the last
// handle goes away, so a reopen right after `close` can still find it held.
pub(crate) fn open_db(path: &Path) -> Result<sled::Db, sled::Error> {
    let mut attempt = 0;
    loop {
        match sled::open(path) {
            Err(sled::Error::Io(e)) if is_lock_held(&e) && attempt < LOCK_RETRIES => {
                attempt += 1;
                log::debug!("{:?} still locked, retry {attempt}/{LOCK_RETRIES}", path);
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
            other => return other,
        }
    }
}

// sled reports a held lock as an `Other` io error carrying this message.
fn is_lock_held(e: &std::io::Error) -> bool {
    e.to_string().starts_with("could not acquire lock")
}

fn validate_name(kind: &str, name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(format!("{kind} '{name}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub field: String,
    pub unique: bool,
}

/// All collections of a single tenant.
pub struct TenantStore {
    tenant: String,
    db: sled::Db,
    path: PathBuf,
}

impl TenantStore {
    /// Open (creating if needed) the store for `tenant` under `root`.
    pub fn open(root: &Path, tenant: &str) -> Result<Self, StoreError> {
        validate_name("tenant", tenant)?;
        let path = root.join(tenant);
        std::fs::create_dir_all(&path)?;

        let db = open_db(&path)?;
        log::info!("Opened store for tenant '{}' at {:?}", tenant, path);

        Ok(Self {
            tenant: tenant.to_string(),
            db,
            path,
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle to a collection, created on first use.
    pub fn collection(&self, name: &str) -> Result<TenantCollection, StoreError> {
        validate_name("collection", name)?;
        let tree = self.db.open_tree(format!("{COLLECTION_PREFIX}{name}"))?;
        Ok(TenantCollection {
            tenant: self.tenant.clone(),
            name: name.to_string(),
            db: self.db.clone(),
            tree,
        })
    }

    pub fn has_collection(&self, name: &str) -> bool {
        let wanted = format!("{COLLECTION_PREFIX}{name}");
        self.db
            .tree_names()
            .iter()
            .any(|n| &n[..] == wanted.as_bytes())
    }

    /// Existing collection handle, without creating one.
    pub fn existing_collection(&self, name: &str) -> Result<Option<TenantCollection>, StoreError> {
        if self.has_collection(name) {
            self.collection(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|n| {
                String::from_utf8_lossy(&n)
                    .strip_prefix(COLLECTION_PREFIX)
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    /// Remove a collection together with its indexes.
    pub fn drop_collection(&self, name: &str) -> Result<bool, StoreError> {
        let Some(collection) = self.existing_collection(name)? else {
            return Ok(false);
        };
        for def in collection.indexes()? {
            self.db.drop_tree(collection.index_tree_name(&def.field))?;
            collection.meta_tree()?.remove(collection.index_meta_key(&def.field))?;
        }
        let dropped = self.db.drop_tree(format!("{COLLECTION_PREFIX}{name}"))?;
        log::info!("Dropped collection '{}' for tenant '{}'", name, self.tenant);
        Ok(dropped)
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        log::debug!("Closed store for tenant '{}'", self.tenant);
        Ok(())
    }
}

/// One tenant-scoped collection.
pub struct TenantCollection {
    tenant: String,
    name: String,
    db: sled::Db,
    tree: sled::Tree,
}

impl TenantCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn count(&self) -> usize {
        self.tree.len()
    }

    /// Insert a JSON list of documents. Anything but a list is rejected.
    pub fn insert(&self, documents: Value) -> Result<usize, StoreError> {
        match documents {
            Value::Array(docs) => self.insert_many(docs),
            other => Err(StoreError::NotASequence(json_type_name(&other).to_string())),
        }
    }

    pub fn insert_many(&self, documents: Vec<Value>) -> Result<usize, StoreError> {
        if documents.is_empty() {
            log::warn!(
                "No documents to insert into '{}' for tenant '{}'",
                self.name,
                self.tenant
            );
            return Ok(0);
        }

        if let Some(pos) = documents.iter().position(|d| !d.is_object()) {
            return Err(StoreError::NotAnObject(pos));
        }

        let indexes = self.indexes()?;
        for def in indexes.iter().filter(|d| d.unique) {
            self.check_unique(&def.field, &documents)?;
        }

        let mut batch = sled::Batch::default();
        let mut entries = Vec::with_capacity(documents.len());
        for doc in &documents {
            let key = self.db.generate_id()?.to_be_bytes();
            batch.insert(key.as_slice(), serde_json::to_vec(doc)?);
            entries.push((key, doc));
        }
        self.tree.apply_batch(batch)?;

        for def in &indexes {
            let index = self.db.open_tree(self.index_tree_name(&def.field))?;
            for (key, doc) in &entries {
                if let Some(entry) = index_entry(doc, &def.field, key)? {
                    index.insert(entry, key.as_slice())?;
                }
            }
        }

        log::info!(
            "Inserted {} documents into '{}' for tenant '{}'",
            documents.len(),
            self.name,
            self.tenant
        );
        Ok(documents.len())
    }

    pub fn query(
        &self,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut results = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            let doc: Value = serde_json::from_slice(&value)?;
            if !filter.matches(&doc) {
                continue;
            }
            results.push(match projection {
                Some(p) => p.apply(&doc),
                None => doc,
            });
        }
        log::debug!(
            "Query returned {} documents from '{}'",
            results.len(),
            self.name
        );
        Ok(results)
    }

    pub fn find_one(&self, filter: &Filter) -> Result<Option<Value>, StoreError> {
        for item in self.tree.iter() {
            let (_key, value) = item?;
            let doc: Value = serde_json::from_slice(&value)?;
            if filter.matches(&doc) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    pub fn delete_many(&self, filter: &Filter) -> Result<usize, StoreError> {
        let indexes = self.indexes()?;
        let mut doomed = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let doc: Value = serde_json::from_slice(&value)?;
            if filter.matches(&doc) {
                doomed.push((key, doc));
            }
        }

        for (key, doc) in &doomed {
            self.tree.remove(key)?;
            for def in &indexes {
                if let Some(entry) = index_entry(doc, &def.field, key)? {
                    self.db
                        .open_tree(self.index_tree_name(&def.field))?
                        .remove(entry)?;
                }
            }
        }

        log::info!("Deleted {} documents from '{}'", doomed.len(), self.name);
        Ok(doomed.len())
    }

    /// Remove documents whose `id` is null or absent.
    pub fn purge_missing_ids(&self) -> Result<usize, StoreError> {
        self.delete_many(&Filter::eq("id", Value::Null))
    }

    /// Remove every document, keeping index definitions.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.tree.len();
        self.tree.clear()?;
        for def in self.indexes()? {
            self.db.open_tree(self.index_tree_name(&def.field))?.clear()?;
        }
        Ok(removed)
    }

    /// Build an index on a top-level field. With `unique`, existing
    /// duplicates fail the build and later inserts are checked.
    pub fn create_index(&self, field: &str, unique: bool) -> Result<(), StoreError> {
        let tree_name = self.index_tree_name(field);
        self.db.drop_tree(&tree_name)?;
        let index = self.db.open_tree(&tree_name)?;

        let mut seen = HashSet::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let doc: Value = serde_json::from_slice(&value)?;
            if unique {
                if let Some(v) = indexed_value(&doc, field)? {
                    if !seen.insert(v.clone()) {
                        self.db.drop_tree(&tree_name)?;
                        self.meta_tree()?.remove(self.index_meta_key(field))?;
                        log::warn!(
                            "Index on '{}' for '{}' removed: duplicate value {}",
                            field,
                            self.name,
                            v
                        );
                        return Err(self.duplicate(field, v));
                    }
                }
            }
            if let Some(entry) = index_entry(&doc, field, &key)? {
                index.insert(entry, key)?;
            }
        }

        let def = IndexDef {
            field: field.to_string(),
            unique,
        };
        let encoded = bincode::serde::encode_to_vec(&def, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        self.meta_tree()?.insert(self.index_meta_key(field), encoded)?;

        log::info!(
            "Created {}index on '{}' for collection '{}'",
            if unique { "unique " } else { "" },
            field,
            self.name
        );
        Ok(())
    }

    pub fn indexes(&self) -> Result<Vec<IndexDef>, StoreError> {
        let prefix = format!("{}\0", self.name);
        let mut defs = Vec::new();
        for item in self.meta_tree()?.scan_prefix(prefix.as_bytes()) {
            let (_key, value) = item?;
            let (def, _): (IndexDef, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Encode(e.to_string()))?;
            defs.push(def);
        }
        Ok(defs)
    }

    /// Flush pending writes and release the handle.
    pub async fn close(self) -> Result<(), StoreError> {
        self.tree.flush_async().await?;
        log::debug!("Closed collection '{}' for tenant '{}'", self.name, self.tenant);
        Ok(())
    }

    fn check_unique(&self, field: &str, documents: &[Value]) -> Result<(), StoreError> {
        let index = self.db.open_tree(self.index_tree_name(field))?;
        let mut batch_values = HashSet::new();
        for doc in documents {
            let Some(v) = indexed_value(doc, field)? else {
                continue;
            };
            let prefix = format!("{v}\0");
            if index.scan_prefix(prefix.as_bytes()).next().is_some() || !batch_values.insert(v.clone())
            {
                return Err(self.duplicate(field, v));
            }
        }
        Ok(())
    }

    fn duplicate(&self, field: &str, value: String) -> StoreError {
        StoreError::DuplicateKey {
            collection: self.name.clone(),
            field: field.to_string(),
            value,
        }
    }

    fn meta_tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(INDEX_META_TREE)?)
    }

    fn index_tree_name(&self, field: &str) -> String {
        format!("index:{}:{}", self.name, field)
    }

    fn index_meta_key(&self, field: &str) -> Vec<u8> {
        format!("{}\0{}", self.name, field).into_bytes()
    }
}

/// JSON text of the indexed value; `None` for missing or null.
fn indexed_value(doc: &Value, field: &str) -> Result<Option<String>, StoreError> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
    }
}

fn index_entry(doc: &Value, field: &str, row_key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(indexed_value(doc, field)?.map(|v| {
        let mut entry = v.into_bytes();
        entry.push(0);
        entry.extend_from_slice(row_key);
        entry
    }))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> TenantStore {
        TenantStore::open(dir.path(), "acme").unwrap()
    }

    #[test]
    fn insert_rejects_non_list() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let users = store.collection("users").unwrap();

        match users.insert(json!({"id": 1})) {
            Err(StoreError::NotASequence(kind)) => assert_eq!(kind, "object"),
            other => panic!("expected NotASequence, got {other:?}"),
        }
        assert!(matches!(
            users.insert(json!([{"id": 1}, 2])),
            Err(StoreError::NotAnObject(1))
        ));
        assert_eq!(users.count(), 0);
    }

    #[test]
    fn empty_insert_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let users = store.collection("users").unwrap();
        assert_eq!(users.insert(json!([])).unwrap(), 0);
        assert_eq!(users.count(), 0);
    }

    #[test]
    fn query_preserves_insertion_order_and_projects() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let users = store.collection("users").unwrap();
        users
            .insert(json!([
                {"id": 3, "organization_id": 10},
                {"id": 1, "organization_id": 20},
                {"id": 2}
            ]))
            .unwrap();

        let all = users.query(&Filter::all(), None).unwrap();
        let ids: Vec<_> = all.iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(1), json!(2)]);

        let projected = users
            .query(&Filter::all(), Some(&Projection::include(["organization_id"])))
            .unwrap();
        assert_eq!(
            projected,
            vec![json!({"organization_id": 10}), json!({"organization_id": 20}), json!({})]
        );

        let found = users.find_one(&Filter::eq("organization_id", json!(20))).unwrap();
        assert_eq!(found, Some(json!({"id": 1, "organization_id": 20})));
    }

    #[test]
    fn delete_many_and_purge_missing_ids() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let tickets = store.collection("tickets").unwrap();
        tickets
            .insert(json!([
                {"id": 1, "status": "open"},
                {"id": 2, "status": "closed"},
                {"status": "open"},
                {"id": null}
            ]))
            .unwrap();

        assert_eq!(tickets.purge_missing_ids().unwrap(), 2);
        assert_eq!(tickets.delete_many(&Filter::eq("status", json!("closed"))).unwrap(), 1);
        let left = tickets.query(&Filter::all(), None).unwrap();
        assert_eq!(left, vec![json!({"id": 1, "status": "open"})]);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let users = store.collection("users").unwrap();
        users.insert(json!([{"id": 1}, {"id": 2}])).unwrap();
        users.create_index("id", true).unwrap();
        assert_eq!(
            users.indexes().unwrap(),
            vec![IndexDef {
                field: "id".to_string(),
                unique: true
            }]
        );

        assert!(matches!(
            users.insert(json!([{"id": 3}, {"id": 2}])),
            Err(StoreError::DuplicateKey { .. })
        ));
        assert!(matches!(
            users.insert(json!([{"id": 4}, {"id": 4}])),
            Err(StoreError::DuplicateKey { .. })
        ));
        assert_eq!(users.count(), 2);

        users.delete_many(&Filter::eq("id", json!(2))).unwrap();
        assert_eq!(users.insert(json!([{"id": 2}])).unwrap(), 1);
    }

    #[test]
    fn unique_index_build_fails_on_existing_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let users = store.collection("users").unwrap();
        users.insert(json!([{"id": 1}, {"id": 1}])).unwrap();
        assert!(users.create_index("id", true).is_err());
        assert!(users.indexes().unwrap().is_empty());
        users.create_index("id", false).unwrap();
    }

    #[test]
    fn failed_unique_rebuild_forgets_previous_index() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let users = store.collection("users").unwrap();
        users.create_index("id", false).unwrap();
        users.insert(json!([{"id": 1}, {"id": 1}, {"id": 2}])).unwrap();
        assert_eq!(users.indexes().unwrap().len(), 1);

        assert!(matches!(
            users.create_index("id", true),
            Err(StoreError::DuplicateKey { .. })
        ));
        assert!(users.indexes().unwrap().is_empty());

        // Inserts and deletes no longer consult the dropped index.
        users.insert(json!([{"id": 1}])).unwrap();
        assert_eq!(users.delete_many(&Filter::eq("id", json!(1))).unwrap(), 3);
        assert_eq!(users.count(), 1);
    }

    #[test]
    fn collections_are_listed_and_dropped() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.collection("users").unwrap().insert(json!([{"id": 1}])).unwrap();
        store.collection("groups").unwrap();
        store.collection("users").unwrap().create_index("id", false).unwrap();

        assert_eq!(store.list_collections(), vec!["groups", "users"]);
        assert!(store.existing_collection("brands").unwrap().is_none());
        assert!(!store.has_collection("brands"));

        assert!(store.drop_collection("users").unwrap());
        assert_eq!(store.list_collections(), vec!["groups"]);
        assert!(!store.drop_collection("users").unwrap());
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            TenantStore::open(dir.path(), "../evil"),
            Err(StoreError::InvalidName(_))
        ));
        let store = open(&dir);
        assert!(store.collection("a/b").is_err());
    }

    #[tokio::test]
    async fn data_survives_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            let users = store.collection("users").unwrap();
            users.insert(json!([{"id": 1}])).unwrap();
            users.close().await.unwrap();
            store.close().await.unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.collection("users").unwrap().count(), 1);
    }

    #[tokio::test]
    async fn close_and_reopen_repeatedly() {
        let dir = TempDir::new().unwrap();
        for round in 0..20 {
            let store = open(&dir);
            let users = store.collection("users").unwrap();
            assert_eq!(users.count(), round);
            users.insert(json!([{"id": round}])).unwrap();
            users.close().await.unwrap();
            store.close().await.unwrap();
        }
        assert_eq!(open(&dir).collection("users").unwrap().count(), 20);
    }
}
