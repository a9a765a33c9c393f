// Two-phase tenant sync: independent endpoints, then endpoints whose paths
// come from key values in collections the first phase filled.
// Strictly sequential. Per-endpoint failures land in the run report.
mod progress;
mod report;

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use crate::config::AppConfig;
use crate::paginator::{Credentials, FetchError, Paginator};
use crate::registry::{EndpointRegistry, EndpointSpec};
use crate::resolver;
use crate::store::{StoreError, TenantStore};

pub use self::progress::{
    progress_percentage, selection_total, CancelFlag, LogProgress, ProgressSink,
};
pub use self::report::{SyncPhase, SyncRunReport};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] FetchError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Empty each target collection once, on its first successful fetch in the run.
    pub refresh: bool,
}

/// Everything one run needs, passed explicitly.
pub struct SyncContext<'a> {
    pub registry: &'a EndpointRegistry,
    pub store: &'a TenantStore,
    pub paginator: &'a Paginator,
    pub progress: &'a dyn ProgressSink,
}

pub struct SyncOrchestrator<'a> {
    ctx: SyncContext<'a>,
    options: SyncOptions,
    phase: SyncPhase,
    report: SyncRunReport,
    refreshed: HashSet<String>,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(ctx: SyncContext<'a>, options: SyncOptions) -> Self {
        let report = SyncRunReport::new(ctx.store.tenant());
        Self {
            ctx,
            options,
            phase: SyncPhase::Idle,
            report,
            refreshed: HashSet::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub async fn run(mut self) -> SyncRunReport {
        self.transition(SyncPhase::RunningIndependent);
        self.run_independent().await;

        // A cancelled independent phase skips the dependent phase entirely.
        if !self.report.cancelled {
            self.transition(SyncPhase::RunningDependent);
            self.run_dependent().await;
        }

        let last = if self.report.cancelled {
            SyncPhase::Cancelled
        } else {
            SyncPhase::Done
        };
        self.transition(last);
        self.report.final_phase = last;
        self.report.log_summary();
        self.report
    }

    fn transition(&mut self, next: SyncPhase) {
        log::debug!("Sync phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn cancel_requested(&mut self) -> bool {
        if self.ctx.progress.cancel_requested() {
            log::warn!("Cancellation requested during {:?}", self.phase);
            self.report.cancelled = true;
        }
        self.report.cancelled
    }

    async fn run_independent(&mut self) {
        let names = self.ctx.registry.active_independent_endpoint_names();
        log::info!("Independent endpoints selected: {}", names.len());

        for (i, name) in names.iter().enumerate() {
            let Some(spec) = self.spec_with_target(name) else {
                continue;
            };

            self.report_progress(i + 1, names.len(), name);
            self.sync_independent(&spec).await;

            if self.cancel_requested() {
                break;
            }
        }
    }

    async fn sync_independent(&mut self, spec: &EndpointSpec) {
        let Some(target) = spec.target_collection.as_deref() else {
            return;
        };

        let result = self.ctx.paginator.fetch_all(&spec.path_template).await;
        if let Some(err) = result.error {
            self.report.record_error(&spec.name, err.to_string());
            return;
        }

        if let Err(e) = self.refresh_once(target) {
            self.report
                .record_error(&spec.name, format!("refresh of '{target}' failed: {e}"));
            return;
        }

        if result.records.is_empty() {
            log::warn!("Endpoint '{}' returned no records", spec.name);
            self.report.record_empty(&spec.name);
            return;
        }

        match self.write(target, result.records).await {
            Ok(written) => {
                self.report.populated_count += 1;
                self.report.documents_written += written;
            }
            Err(e) => self
                .report
                .record_error(&spec.name, format!("insert into '{target}' failed: {e}")),
        }
    }

    async fn run_dependent(&mut self) {
        let names = self.ctx.registry.active_dependent_endpoint_names();
        log::info!("Dependent endpoints selected: {}", names.len());

        for (i, name) in names.iter().enumerate() {
            let Some(spec) = self.spec_with_target(name) else {
                continue;
            };

            self.report_progress(i + 1, names.len(), name);
            self.sync_dependent(&spec).await;

            if self.report.cancelled {
                break;
            }
        }
    }

    async fn sync_dependent(&mut self, spec: &EndpointSpec) {
        let Some(target) = spec.target_collection.as_deref() else {
            return;
        };

        let paths = match resolver::resolve(spec, self.ctx.store) {
            Ok(paths) => paths,
            Err(e) => {
                self.report.record_error(&spec.name, e.to_string());
                self.cancel_requested();
                return;
            }
        };

        if paths.is_empty() {
            log::warn!("Endpoint '{}' resolved to no concrete paths", spec.name);
            self.report.record_empty(&spec.name);
            self.cancel_requested();
            return;
        }

        let mut written = 0usize;
        let mut failed = false;
        for path in &paths {
            log::info!("Dependent endpoint '{}': {}", spec.name, path);
            let result = self.ctx.paginator.fetch_all(path).await;

            match result.error {
                Some(err) => {
                    failed = true;
                    self.report.record_error(&spec.name, format!("{path}: {err}"));
                }
                None => match self.refresh_once(target) {
                    Err(e) => {
                        failed = true;
                        self.report
                            .record_error(&spec.name, format!("refresh of '{target}' failed: {e}"));
                    }
                    Ok(()) if result.records.is_empty() => {}
                    Ok(()) => match self.write(target, result.records).await {
                        Ok(n) => written += n,
                        Err(e) => {
                            failed = true;
                            self.report.record_error(
                                &spec.name,
                                format!("{path}: insert into '{target}' failed: {e}"),
                            );
                        }
                    },
                },
            }

            if self.cancel_requested() {
                break;
            }
        }

        if written > 0 {
            self.report.populated_count += 1;
            self.report.documents_written += written;
        } else if !failed {
            self.report.record_empty(&spec.name);
        }
    }

    /// Definition of `name` if it has somewhere to write; otherwise skipped.
    fn spec_with_target(&mut self, name: &str) -> Option<EndpointSpec> {
        match self.ctx.registry.lookup(name) {
            Ok(spec) if spec.target_collection.is_some() => Some(spec.clone()),
            Ok(_) => {
                log::debug!("Endpoint '{name}' has no target collection, skipping");
                None
            }
            Err(e) => {
                self.report.record_error(name, e.to_string());
                None
            }
        }
    }

    fn report_progress(&self, position: usize, size: usize, name: &str) {
        let pct = progress_percentage(position, size);
        let label = format!(
            "Working on endpoint {position} of {}\nEndpoint: {name}",
            selection_total(size)
        );
        self.ctx.progress.update(pct, &label);
    }

    fn refresh_once(&mut self, collection: &str) -> Result<(), StoreError> {
        if !self.options.refresh || !self.refreshed.insert(collection.to_string()) {
            return Ok(());
        }
        let removed = self.ctx.store.collection(collection)?.clear()?;
        log::info!("Refresh cleared {removed} documents from '{collection}'");
        Ok(())
    }

    /// Open the collection, insert, and close it whatever the insert outcome.
    async fn write(&self, collection: &str, records: Vec<Value>) -> Result<usize, StoreError> {
        let handle = self.ctx.store.collection(collection)?;
        let outcome = handle.insert_many(records);
        if let Err(e) = handle.close().await {
            log::warn!("Closing collection '{collection}' failed: {e}");
        }
        outcome
    }
}

/// Open the tenant's store, run both phases, and close the store.
pub async fn sync_tenant(
    config: &AppConfig,
    registry: &EndpointRegistry,
    credentials: &Credentials,
    progress: &dyn ProgressSink,
    options: SyncOptions,
) -> Result<SyncRunReport, SyncError> {
    let paginator = Paginator::new(
        config.base_url_for(&credentials.subdomain),
        credentials,
        &config.http,
    )?;
    let store = TenantStore::open(&config.tenants_dir(), &credentials.subdomain)?;

    let ctx = SyncContext {
        registry,
        store: &store,
        paginator: &paginator,
        progress,
    };
    let report = SyncOrchestrator::new(ctx, options).run().await;

    if let Err(e) = store.close().await {
        log::error!("Closing store for '{}' failed: {e}", credentials.subdomain);
    }
    Ok(report)
}
