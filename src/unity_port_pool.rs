use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{debug_log, info_log, warn_log};

/// Minimum time between two runs of the expiry cleanup
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Number of failed ports listed in diagnostic summaries
const SUMMARY_LIMIT: usize = 5;

/// Candidate ports for discovery and the record of ports that failed recently.
///
/// A port with a live failure record is never offered as a candidate until the
/// record expires. If every port in the range has failed, the whole record is
/// cleared so a transient outage cannot exclude Unity forever.
#[derive(Debug, Clone)]
pub struct PortPool {
    port_start: u16,
    port_end: u16,
    failure_timeout: Duration,
    max_failed_ports: usize,
    failed_ports: HashMap<u16, Instant>,
    last_cleanup: Option<Instant>,
}

impl PortPool {
    /// Creates a pool over the inclusive range `port_start..=port_end`
    pub fn new(
        port_start: u16,
        port_end: u16,
        failure_timeout: Duration,
        max_failed_ports: usize,
    ) -> Self {
        Self {
            port_start,
            port_end,
            failure_timeout,
            max_failed_ports: max_failed_ports.max(1),
            failed_ports: HashMap::new(),
            last_cleanup: None,
        }
    }

    /// Candidate ports in ascending order, excluding ports with an unexpired failure record
    pub fn candidates(&mut self) -> Vec<u16> {
        self.candidates_at(Instant::now())
    }

    pub(crate) fn candidates_at(&mut self, now: Instant) -> Vec<u16> {
        let candidates: Vec<u16> = (self.port_start..=self.port_end)
            .filter(|port| !self.is_failed_at(*port, now))
            .collect();

        if candidates.is_empty() {
            warn_log!(
                "All ports in {}-{} have failed recently, clearing failed ports and retrying all",
                self.port_start,
                self.port_end
            );
            self.failed_ports.clear();
            return (self.port_start..=self.port_end).collect();
        }

        candidates
    }

    /// Records a failure for `port` now
    pub fn mark_failed(&mut self, port: u16) {
        self.mark_failed_at(port, Instant::now());
    }

    pub(crate) fn mark_failed_at(&mut self, port: u16, at: Instant) {
        self.failed_ports.insert(port, at);

        if self.failed_ports.len() > self.max_failed_ports {
            let oldest = self
                .failed_ports
                .iter()
                .min_by_key(|(_, failed_at)| **failed_at)
                .map(|(port, _)| *port);
            if let Some(oldest) = oldest {
                self.failed_ports.remove(&oldest);
                debug_log!("Removed oldest failed port record: {}", oldest);
            }
        }
    }

    /// Forgets any failure recorded for `port`
    pub fn mark_succeeded(&mut self, port: u16) {
        self.failed_ports.remove(&port);
    }

    /// Removes failure records older than the failure timeout.
    ///
    /// Does nothing if the previous cleanup ran less than [`CLEANUP_INTERVAL`] ago.
    pub fn cleanup_expired(&mut self) {
        self.cleanup_expired_at(Instant::now());
    }

    pub(crate) fn cleanup_expired_at(&mut self, now: Instant) {
        if let Some(last) = self.last_cleanup {
            if now.saturating_duration_since(last) < CLEANUP_INTERVAL {
                return;
            }
        }

        let timeout = self.failure_timeout;
        let mut expired: Vec<u16> = self
            .failed_ports
            .iter()
            .filter(|(_, failed_at)| now.saturating_duration_since(**failed_at) > timeout)
            .map(|(port, _)| *port)
            .collect();
        expired.sort_unstable();

        for port in &expired {
            self.failed_ports.remove(port);
            debug_log!("Removed expired failed port: {}", port);
        }
        if !expired.is_empty() {
            info_log!("Cleaned up {} expired failed ports: {:?}", expired.len(), expired);
        }

        self.last_cleanup = Some(now);
    }

    /// Whether `port` currently has an unexpired failure record
    pub fn is_failed(&self, port: u16) -> bool {
        self.is_failed_at(port, Instant::now())
    }

    fn is_failed_at(&self, port: u16, now: Instant) -> bool {
        self.failed_ports
            .get(&port)
            .is_some_and(|failed_at| now.saturating_duration_since(*failed_at) <= self.failure_timeout)
    }

    /// Number of failure records currently held
    pub fn failed_count(&self) -> usize {
        self.failed_ports.len()
    }

    /// Failed ports with the time elapsed since each failure, most recent first
    pub fn recent_failures(&self) -> Vec<(u16, Duration)> {
        let now = Instant::now();
        let mut failures: Vec<(u16, Duration)> = self
            .failed_ports
            .iter()
            .map(|(port, failed_at)| (*port, now.saturating_duration_since(*failed_at)))
            .collect();
        failures.sort_by_key(|(port, elapsed)| (*elapsed, *port));
        failures
    }

    /// Human readable summary such as `{8101: 3.2s ago, 8103: 12.0s ago}`
    pub fn failure_summary(&self) -> String {
        let entries: Vec<String> = self
            .recent_failures()
            .into_iter()
            .take(SUMMARY_LIMIT)
            .map(|(port, elapsed)| format!("{}: {:.1}s ago", port, elapsed.as_secs_f64()))
            .collect();
        format!("{{{}}}", entries.join(", "))
    }
}
