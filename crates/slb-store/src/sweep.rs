use chrono::Duration;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::Store;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions_ended: usize,
    pub requests_timed_out: usize,
    pub failures: usize,
}

/// One-shot maintenance pass: ends stale sessions and times out expired
/// requests. Scheduling is left to the caller.
///
/// Only ever moves entities forward, so it is safe to run alongside live
/// mutations and alongside other sweepers.
pub struct Sweeper {
    store: Store,
    stale_threshold: Duration,
}

impl Sweeper {
    pub fn new(store: Store, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold,
        }
    }

    /// Run one pass. Per-item failures are logged and counted, never returned.
    pub fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.store.find_stale_sessions(self.stale_threshold) {
            Ok(stale) => {
                for session in stale {
                    match self.store.end_stale_session(session.id, self.stale_threshold) {
                        Ok(true) => {
                            info!(session_id = %session.id, agent = %session.agent_name, "ended stale session");
                            report.sessions_ended += 1;
                        }
                        // Heartbeated or ended since it was listed.
                        Ok(false) => {}
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "failed to end stale session");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to list stale sessions");
                report.failures += 1;
            }
        }

        match self.store.find_expired_requests() {
            Ok(expired) => {
                for request in expired {
                    match self.store.mark_timeout(request.id) {
                        Ok(true) => report.requests_timed_out += 1,
                        // Resolved by a reviewer in the meantime.
                        Ok(false) => {}
                        Err(e) => {
                            warn!(request_id = %request.id, error = %e, "failed to time out request");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to list expired requests");
                report.failures += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                sessions_ended = report.sessions_ended,
                requests_timed_out = report.requests_timed_out,
                failures = report.failures,
                "sweep complete"
            );
        }
        report
    }
}
