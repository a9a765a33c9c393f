// Endpoint catalogue and HTTP paging
pub mod config;
pub mod registry;
pub mod paginator;

// Per-tenant persistence and the two-phase sync
pub mod store;
pub mod resolver;
pub mod sync;

// Tenant management and downstream reporting
pub mod credentials;
pub mod export;
pub mod enrich;

// Public exports
pub use config::AppConfig;
pub use credentials::{CredentialSource, CredentialStore};
pub use paginator::{Credentials, FetchResult, Paginator};
pub use registry::{EndpointRegistry, EndpointSpec};
pub use store::{TenantCollection, TenantStore};
pub use sync::{sync_tenant, SyncOptions, SyncOrchestrator, SyncRunReport};
