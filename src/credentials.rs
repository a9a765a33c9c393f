use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paginator::Credentials;
use crate::store::open_db;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Unknown tenant: {0}")]
    NotFound(String),

    #[error("Tenant already registered: {0}")]
    AlreadyExists(String),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(String),
}

/// Resolves a tenant identifier to API credentials.
pub trait CredentialSource {
    fn credentials(&self, tenant: &str) -> Result<Credentials, CredentialError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    api_user_email: String,
    api_key: String,
}

/// Tenant credentials kept in their own sled tree, keyed by subdomain.
pub struct CredentialStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl CredentialStore {
    const TREE_NAME: &'static str = "__tenants__";

    pub fn open(dir: &Path) -> Result<Self, CredentialError> {
        std::fs::create_dir_all(dir)?;
        let db = open_db(dir)?;
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { db, tree })
    }

    pub fn add(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        if self.tree.contains_key(credentials.subdomain.as_bytes())? {
            return Err(CredentialError::AlreadyExists(credentials.subdomain.clone()));
        }
        self.put(credentials)?;
        log::info!("Added tenant '{}'", credentials.subdomain);
        Ok(())
    }

    /// Replace the entry for `old_subdomain`, possibly under a new subdomain.
    pub fn update(&self, old_subdomain: &str, credentials: &Credentials) -> Result<(), CredentialError> {
        if !self.tree.contains_key(old_subdomain.as_bytes())? {
            return Err(CredentialError::NotFound(old_subdomain.to_string()));
        }
        if old_subdomain != credentials.subdomain
            && self.tree.contains_key(credentials.subdomain.as_bytes())?
        {
            return Err(CredentialError::AlreadyExists(credentials.subdomain.clone()));
        }
        self.tree.remove(old_subdomain.as_bytes())?;
        self.put(credentials)?;
        log::info!("Updated tenant '{}'", credentials.subdomain);
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Credentials>, CredentialError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let subdomain = String::from_utf8_lossy(&key).to_string();
            out.push(Self::decode(subdomain, &value)?);
        }
        Ok(out)
    }

    pub fn fetch(&self, subdomain: &str) -> Result<Credentials, CredentialError> {
        match self.tree.get(subdomain.as_bytes())? {
            Some(value) => Self::decode(subdomain.to_string(), &value),
            None => Err(CredentialError::NotFound(subdomain.to_string())),
        }
    }

    pub fn remove(&self, subdomain: &str) -> Result<bool, CredentialError> {
        let removed = self.tree.remove(subdomain.as_bytes())?.is_some();
        if removed {
            log::info!("Removed tenant '{subdomain}'");
        }
        Ok(removed)
    }

    pub async fn close(self) -> Result<(), CredentialError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn put(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let stored = StoredCredentials {
            api_user_email: credentials.api_user_email.clone(),
            api_key: credentials.api_key.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| CredentialError::Encode(e.to_string()))?;
        self.tree.insert(credentials.subdomain.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn decode(subdomain: String, bytes: &[u8]) -> Result<Credentials, CredentialError> {
        let (stored, _): (StoredCredentials, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CredentialError::Encode(e.to_string()))?;
        Ok(Credentials {
            subdomain,
            api_user_email: stored.api_user_email,
            api_key: stored.api_key,
        })
    }
}

impl CredentialSource for CredentialStore {
    fn credentials(&self, tenant: &str) -> Result<Credentials, CredentialError> {
        self.fetch(tenant)
    }
}
