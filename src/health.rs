//! Health checking for registered projects
//!
//! Probes each project's health endpoint with retries and exponential
//! backoff, keeps a bounded history per project, and derives uptime stats
//! and diagnostics from it. Check outcomes feed project status back into
//! the registry.

use crate::config::HealthConfig;
use crate::error::RegistryError;
use crate::registry::{Project, ProjectStatus, Registry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Entries kept per project before the oldest are dropped
const HISTORY_CAP: usize = 100;

/// Response times above this are flagged in diagnostics (milliseconds)
const SLOW_RESPONSE_MS: u64 = 5000;

/// Outcome of one health check (after retries)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub subdomain: String,
    pub project: String,
    pub port: u16,
    pub healthy: bool,
    /// 0 when no HTTP status was obtained (refused, timeout)
    pub status_code: u16,
    /// Total elapsed including retries and backoff
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub details: HealthDetails,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    /// Attempts used (1 when the first try decided it)
    pub attempts: u32,
    pub error: Option<String>,
    pub timed_out: bool,
    pub server: Option<String>,
    pub content_length: Option<u64>,
}

/// Uptime over a trailing window, derived from history
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeStats {
    pub uptime_percent: u32,
    pub total_checks: usize,
    pub healthy_checks: usize,
    /// Average over healthy entries only
    pub avg_response_ms: f64,
    pub period_hours: i64,
}

impl UptimeStats {
    fn empty(period_hours: i64) -> Self {
        Self {
            uptime_percent: 0,
            total_checks: 0,
            healthy_checks: 0,
            avg_response_ms: 0.0,
            period_hours,
        }
    }
}

/// Fleet-wide rollup of the latest known statuses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub average_response_ms: f64,
}

/// Everything the diagnostics endpoint reports for one project
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub project: Project,
    pub current: Option<HealthRecord>,
    pub uptime: UptimeStats,
    pub consecutive_failures: usize,
    pub recent_checks: Vec<HealthRecord>,
    pub recommendations: Vec<String>,
}

/// Health checker for all registered projects
pub struct HealthChecker {
    registry: Arc<Registry>,
    config: HealthConfig,
    client: reqwest::Client,
    last: DashMap<String, HealthRecord>,
    history: DashMap<String, VecDeque<HealthRecord>>,
}

impl HealthChecker {
    pub fn new(registry: Arc<Registry>, config: HealthConfig) -> anyhow::Result<Self> {
        // Redirects are not followed: a 3xx from the service is itself a
        // healthy answer, and following could leave localhost.
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("subgate-health/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            registry,
            config,
            client,
            last: DashMap::new(),
            history: DashMap::new(),
        })
    }

    /// Run scheduled full passes until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            "Health checker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    self.check_all().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check one project. 2xx/3xx is healthy; 4xx decides immediately;
    /// 5xx and transport errors retry with capped exponential backoff.
    /// Updates history, the last-known record and the registry status.
    pub async fn check_project(&self, project: &Project) -> HealthRecord {
        let url = format!(
            "http://localhost:{}{}",
            project.port, project.health_check_path
        );
        let started = Instant::now();
        let mut attempt: u32 = 1;
        let mut last_error: Option<String> = None;
        let mut last_status: u16 = 0;
        let mut timed_out = false;

        let record = loop {
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status < 500 {
                        // 2xx/3xx pass, 4xx fail; neither is retried
                        let healthy = (200..400).contains(&status);
                        let server = response
                            .headers()
                            .get("server")
                            .and_then(|v| v.to_str().ok())
                            .map(|s| s.to_string());
                        let content_length = response.content_length();
                        break self.build_record(
                            project,
                            healthy,
                            status,
                            started.elapsed(),
                            HealthDetails {
                                attempts: attempt,
                                error: if healthy {
                                    None
                                } else {
                                    Some(format!("HTTP {}", status))
                                },
                                timed_out: false,
                                server,
                                content_length,
                            },
                        );
                    }
                    last_status = status;
                    last_error = Some(format!("HTTP {}", status));
                    timed_out = false;
                }
                Err(e) => {
                    timed_out = e.is_timeout();
                    last_error = Some(e.to_string());
                    last_status = 0;
                }
            }

            if attempt >= self.config.max_retries {
                break self.build_record(
                    project,
                    false,
                    last_status,
                    started.elapsed(),
                    HealthDetails {
                        attempts: attempt,
                        error: last_error,
                        timed_out,
                        server: None,
                        content_length: None,
                    },
                );
            }

            let delay = backoff_delay(attempt);
            debug!(
                subdomain = %project.subdomain,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Health check attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        if record.healthy {
            debug!(
                subdomain = %record.subdomain,
                status = record.status_code,
                ms = record.response_time_ms,
                "Health check passed"
            );
        } else {
            warn!(
                subdomain = %record.subdomain,
                status = record.status_code,
                attempts = record.details.attempts,
                error = record.details.error.as_deref().unwrap_or("none"),
                "Health check failed"
            );
        }

        self.push_record(record.clone());
        let status = if record.healthy {
            ProjectStatus::Healthy
        } else {
            ProjectStatus::Unhealthy
        };
        self.registry.set_status(&project.subdomain, status);

        record
    }

    /// Check every registered project. One record per project by
    /// construction; a failing project yields an unhealthy record and never
    /// aborts the pass.
    pub async fn check_all(&self) -> Vec<HealthRecord> {
        let projects = self.registry.list();
        let mut records = Vec::with_capacity(projects.len());
        for project in &projects {
            records.push(self.check_project(project).await);
        }

        let healthy = records.iter().filter(|r| r.healthy).count();
        info!(
            checked = records.len(),
            healthy,
            unhealthy = records.len() - healthy,
            "Health pass complete"
        );
        records
    }

    /// Immediate one-off check for the API.
    pub async fn check_subdomain(&self, subdomain: &str) -> Result<HealthRecord, RegistryError> {
        let project = self
            .registry
            .get(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;
        Ok(self.check_project(&project).await)
    }

    /// False when the project was never checked.
    pub fn is_healthy(&self, subdomain: &str) -> bool {
        self.last
            .get(subdomain)
            .map(|record| record.healthy)
            .unwrap_or(false)
    }

    pub fn last_record(&self, subdomain: &str) -> Option<HealthRecord> {
        self.last.get(subdomain).map(|record| record.clone())
    }

    pub fn last_check(&self, subdomain: &str) -> Option<DateTime<Utc>> {
        self.last.get(subdomain).map(|record| record.timestamp)
    }

    /// Most recent `limit` history entries, newest last.
    pub fn history(&self, subdomain: &str, limit: usize) -> Vec<HealthRecord> {
        match self.history.get(subdomain) {
            Some(history) => {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Uptime over the trailing window. Entries outside the window are
    /// ignored; no entries inside yields zeroed stats.
    pub fn uptime(&self, subdomain: &str, window_hours: i64) -> UptimeStats {
        let cutoff = Utc::now() - chrono::Duration::hours(window_hours);
        let entries: Vec<HealthRecord> = match self.history.get(subdomain) {
            Some(history) => history
                .iter()
                .filter(|record| record.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if entries.is_empty() {
            return UptimeStats::empty(window_hours);
        }

        let total_checks = entries.len();
        let healthy: Vec<&HealthRecord> = entries.iter().filter(|r| r.healthy).collect();
        let healthy_checks = healthy.len();
        let avg_response_ms = if healthy_checks > 0 {
            healthy.iter().map(|r| r.response_time_ms).sum::<u64>() as f64 / healthy_checks as f64
        } else {
            0.0
        };

        UptimeStats {
            uptime_percent: ((healthy_checks as f64 / total_checks as f64) * 100.0).round() as u32,
            total_checks,
            healthy_checks,
            avg_response_ms,
            period_hours: window_hours,
        }
    }

    pub fn summary(&self) -> HealthSummary {
        let mut total = 0usize;
        let mut healthy = 0usize;
        let mut duration_sum = 0u64;
        for entry in self.last.iter() {
            total += 1;
            if entry.healthy {
                healthy += 1;
            }
            duration_sum += entry.response_time_ms;
        }
        HealthSummary {
            total,
            healthy,
            unhealthy: total - healthy,
            average_response_ms: if total > 0 {
                duration_sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Failures since the last healthy entry, scanning history backward.
    pub fn consecutive_failures(&self, subdomain: &str) -> usize {
        match self.history.get(subdomain) {
            Some(history) => history.iter().rev().take_while(|r| !r.healthy).count(),
            None => 0,
        }
    }

    /// Diagnostics by project name or subdomain. Name wins when both match
    /// different projects.
    pub fn diagnostics(&self, key: &str) -> Option<Diagnostics> {
        let project = self
            .registry
            .find_by_name(key)
            .or_else(|| self.registry.get(key))?;

        let subdomain = project.subdomain.clone();
        let current = self.last_record(&subdomain);
        let uptime = self.uptime(&subdomain, self.config.uptime_window_hours);
        let consecutive_failures = self.consecutive_failures(&subdomain);
        let recent_checks = self.history(&subdomain, 10);

        let mut recommendations = Vec::new();
        let currently_down = current.as_ref().map(|r| !r.healthy).unwrap_or(false);
        if currently_down {
            recommendations.push(format!(
                "Service is not responding - check that something is listening on port {}",
                project.port
            ));
        }
        if let Some(record) = &current {
            if record.healthy && record.response_time_ms > SLOW_RESPONSE_MS {
                recommendations.push(format!(
                    "Responses are slow ({} ms) - check upstream load",
                    record.response_time_ms
                ));
            }
        }
        if uptime.total_checks > 0 && uptime.uptime_percent < 95 {
            recommendations.push(format!(
                "Uptime is {}% over the last {}h - service is flapping",
                uptime.uptime_percent, uptime.period_hours
            ));
        }
        if consecutive_failures >= 5 {
            recommendations.push(format!(
                "{} consecutive failures - restart the service or check its logs",
                consecutive_failures
            ));
        }

        Some(Diagnostics {
            project,
            current,
            uptime,
            consecutive_failures,
            recent_checks,
            recommendations,
        })
    }

    fn build_record(
        &self,
        project: &Project,
        healthy: bool,
        status_code: u16,
        elapsed: Duration,
        details: HealthDetails,
    ) -> HealthRecord {
        HealthRecord {
            subdomain: project.subdomain.clone(),
            project: project.name.clone(),
            port: project.port,
            healthy,
            status_code,
            response_time_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
            details,
        }
    }

    fn push_record(&self, record: HealthRecord) {
        self.last.insert(record.subdomain.clone(), record.clone());
        let mut history = self.history.entry(record.subdomain.clone()).or_default();
        history.push_back(record);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn push_for_test(&self, record: HealthRecord) {
        self.push_record(record);
    }
}

/// 1s, 2s, 4s, ... capped at 5s
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((1000u64 << exp).min(5000))
}
