//! Per-host proxy traffic counters
//!
//! Tracks request/response/error counts, latency and a status code histogram
//! for every Host the proxy serves, plus an aggregated rollup for the stats
//! endpoint. Counters only reset through an explicit `clear`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

/// Counters for a single request Host
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub status_codes: HashMap<u16, u64>,
    pub last_access: Option<DateTime<Utc>>,
}

/// Rollup across all hosts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub total_requests: u64,
    pub total_responses: u64,
    pub total_errors: u64,
    pub average_duration_ms: f64,
    /// Errors as a percentage of requests, two decimal places
    pub error_rate_percent: f64,
    pub hosts: usize,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    hosts: DashMap<String, HostStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an inbound request for this host.
    pub fn record_request(&self, host: &str) {
        let mut entry = self.hosts.entry(host.to_string()).or_default();
        entry.requests += 1;
        entry.last_access = Some(Utc::now());
    }

    /// Count a relayed response with its status and total latency.
    pub fn record_response(&self, host: &str, status: u16, duration_ms: u64) {
        let mut entry = self.hosts.entry(host.to_string()).or_default();
        entry.responses += 1;
        entry.total_duration_ms += duration_ms;
        entry.average_duration_ms = entry.total_duration_ms as f64 / entry.responses as f64;
        *entry.status_codes.entry(status).or_insert(0) += 1;
    }

    /// Count a request that never produced an upstream response.
    pub fn record_error(&self, host: &str) {
        let mut entry = self.hosts.entry(host.to_string()).or_default();
        entry.errors += 1;
    }

    pub fn host(&self, host: &str) -> Option<HostStats> {
        self.hosts.get(host).map(|entry| entry.clone())
    }

    /// Point-in-time copy of every host's counters.
    pub fn snapshot(&self) -> HashMap<String, HostStats> {
        self.hosts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn aggregated(&self) -> AggregatedStats {
        let mut total_requests = 0u64;
        let mut total_responses = 0u64;
        let mut total_errors = 0u64;
        let mut total_duration_ms = 0u64;
        let mut hosts = 0usize;

        for entry in self.hosts.iter() {
            total_requests += entry.requests;
            total_responses += entry.responses;
            total_errors += entry.errors;
            total_duration_ms += entry.total_duration_ms;
            hosts += 1;
        }

        let average_duration_ms = if total_responses > 0 {
            total_duration_ms as f64 / total_responses as f64
        } else {
            0.0
        };
        let error_rate_percent = if total_requests > 0 {
            (total_errors as f64 / total_requests as f64 * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };

        AggregatedStats {
            total_requests,
            total_responses,
            total_errors,
            average_duration_ms,
            error_rate_percent,
            hosts,
        }
    }

    pub fn clear(&self) {
        self.hosts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_per_host() {
        let stats = StatsCollector::new();

        stats.record_request("app.example.com");
        stats.record_response("app.example.com", 200, 40);
        stats.record_request("app.example.com");
        stats.record_response("app.example.com", 404, 20);
        stats.record_request("other.example.com");
        stats.record_error("other.example.com");

        let app = stats.host("app.example.com").unwrap();
        assert_eq!(app.requests, 2);
        assert_eq!(app.responses, 2);
        assert_eq!(app.errors, 0);
        assert_eq!(app.total_duration_ms, 60);
        assert_eq!(app.average_duration_ms, 30.0);
        assert_eq!(app.status_codes.get(&200), Some(&1));
        assert_eq!(app.status_codes.get(&404), Some(&1));
        assert!(app.last_access.is_some());

        let other = stats.host("other.example.com").unwrap();
        assert_eq!(other.requests, 1);
        assert_eq!(other.errors, 1);
        assert_eq!(other.responses, 0);
    }

    #[test]
    fn test_aggregated() {
        let stats = StatsCollector::new();

        for _ in 0..3 {
            stats.record_request("a");
        }
        stats.record_response("a", 200, 30);
        stats.record_response("a", 200, 60);
        stats.record_error("a");
        stats.record_request("b");
        stats.record_response("b", 500, 10);

        let agg = stats.aggregated();
        assert_eq!(agg.total_requests, 4);
        assert_eq!(agg.total_responses, 3);
        assert_eq!(agg.total_errors, 1);
        assert_eq!(agg.hosts, 2);
        assert!((agg.average_duration_ms - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(agg.error_rate_percent, 25.0);
    }

    #[test]
    fn test_error_rate_rounding() {
        let stats = StatsCollector::new();
        stats.record_request("a");
        stats.record_request("a");
        stats.record_request("a");
        stats.record_error("a");

        // 1/3 → 33.33, not a long fraction
        assert_eq!(stats.aggregated().error_rate_percent, 33.33);
    }

    #[test]
    fn test_empty_aggregate_is_zeroed() {
        let stats = StatsCollector::new();
        let agg = stats.aggregated();
        assert_eq!(agg.total_requests, 0);
        assert_eq!(agg.average_duration_ms, 0.0);
        assert_eq!(agg.error_rate_percent, 0.0);
        assert_eq!(agg.hosts, 0);
    }

    #[test]
    fn test_clear() {
        let stats = StatsCollector::new();
        stats.record_request("a");
        stats.clear();
        assert!(stats.host("a").is_none());
        assert_eq!(stats.snapshot().len(), 0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let stats = StatsCollector::new();
        stats.record_request("a");
        stats.record_response("a", 200, 5);

        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"averageDurationMs\""));
        assert!(json.contains("\"statusCodes\""));
        assert!(json.contains("\"lastAccess\""));
    }
}
