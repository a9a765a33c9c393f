use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    RunningIndependent,
    RunningDependent,
    Done,
    Cancelled,
}

/// Accumulated outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunReport {
    pub tenant: String,
    pub populated_count: usize,
    pub documents_written: usize,
    pub empty_endpoints: BTreeSet<String>,
    /// Endpoint name -> last error seen for it.
    pub errored_endpoints: BTreeMap<String, String>,
    pub cancelled: bool,
    pub final_phase: SyncPhase,
}

impl SyncRunReport {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            populated_count: 0,
            documents_written: 0,
            empty_endpoints: BTreeSet::new(),
            errored_endpoints: BTreeMap::new(),
            cancelled: false,
            final_phase: SyncPhase::Idle,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errored_endpoints.is_empty()
    }

    pub(crate) fn record_error(&mut self, endpoint: &str, error: impl Into<String>) {
        let error = error.into();
        log::error!("Endpoint '{endpoint}' failed: {error}");
        self.errored_endpoints.insert(endpoint.to_string(), error);
    }

    pub(crate) fn record_empty(&mut self, endpoint: &str) {
        self.empty_endpoints.insert(endpoint.to_string());
    }

    pub fn log_summary(&self) {
        log::info!(
            "Sync for '{}' finished in phase {:?}: {} populated, {} documents written",
            self.tenant,
            self.final_phase,
            self.populated_count,
            self.documents_written
        );

        if self.has_errors() {
            log::error!("Endpoints with errors ({}):", self.errored_endpoints.len());
            for (name, error) in &self.errored_endpoints {
                log::error!("  {name}: {error}");
            }
        }

        if !self.empty_endpoints.is_empty() {
            log::warn!("Empty endpoints ({}):", self.empty_endpoints.len());
            for name in &self.empty_endpoints {
                log::warn!("  {name}");
            }
        }

        if self.cancelled {
            log::warn!("Sync was cancelled before all endpoints were processed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_error_overwrites_earlier_one() {
        let mut report = SyncRunReport::new("acme");
        report.record_error("org_users", "first");
        report.record_error("org_users", "second");
        assert_eq!(report.errored_endpoints.len(), 1);
        assert_eq!(report.errored_endpoints["org_users"], "second");
    }

    #[test]
    fn serializes_for_cli_output() {
        let mut report = SyncRunReport::new("acme");
        report.record_empty("brands");
        report.final_phase = SyncPhase::Done;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["final_phase"], "done");
        assert_eq!(json["empty_endpoints"][0], "brands");
        assert_eq!(json["cancelled"], false);
    }
}
