//! Container metrics and diagnostics.
//!
//! The collector samples resource usage from the runtime on an interval and
//! keeps a bounded history per service. Samples are checked against
//! thresholds together with the tracker's restart history; crossing one
//! publishes an alert once until the condition clears.

use crate::events::{EventStreamer, StreamEvent};
use crate::runtime::{ContainerRuntime, ContainerStats};
use crate::state::ServiceRuntimeState;
use crate::tracker::RuntimeStateTracker;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smol::Timer;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Restarts are counted over this window
pub const RESTART_WINDOW: Duration = Duration::from_secs(3600);

/// Most recent log lines scanned by a diagnosis
const LOG_SCAN_LINES: usize = 100;

/// A log tail is considered drained after this much silence
const LOG_QUIET: Duration = Duration::from_millis(200);

/// Longest log excerpt quoted in a diagnostic
const EXCERPT_CHARS: usize = 200;

/// Levels at which usage turns into a diagnostic
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// CPU percent for a warning
    pub cpu_warning: f64,
    /// CPU percent for a critical issue
    pub cpu_critical: f64,
    /// Memory percent for a warning
    pub memory_warning: f64,
    /// Memory percent for a critical issue
    pub memory_critical: f64,
    /// Restarts within [`RESTART_WINDOW`] for a warning
    pub restart_warning: usize,
    /// Restarts within [`RESTART_WINDOW`] that mean a crash loop
    pub restart_critical: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 85.0,
            memory_critical: 95.0,
            restart_warning: 3,
            restart_critical: 5,
        }
    }
}

/// Collector configuration
#[derive(Debug, Clone)]
pub struct MetricsSettings {
    /// Interval between samples
    pub interval: Duration,
    /// Samples kept per service
    pub history: usize,
    /// Alert thresholds
    pub thresholds: Thresholds,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            history: 120,
            thresholds: Thresholds::default(),
        }
    }
}

/// One resource usage sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Raw counters from the runtime
    #[serde(flatten)]
    pub stats: ContainerStats,
    /// Receive rate since the previous sample, bytes per second
    pub network_rx_rate: f64,
    /// Transmit rate since the previous sample, bytes per second
    pub network_tx_rate: f64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
}

impl MetricsSample {
    fn new(stats: ContainerStats, previous: Option<&MetricsSample>, timestamp: DateTime<Utc>) -> Self {
        let rate = |current: u64, earlier: u64, since: DateTime<Utc>| {
            let seconds = (timestamp - since).num_milliseconds() as f64 / 1000.0;
            // Counters reset when the container restarts
            if seconds <= 0.0 || current < earlier {
                0.0
            } else {
                (current - earlier) as f64 / seconds
            }
        };
        let (network_rx_rate, network_tx_rate) = match previous {
            Some(previous) => (
                rate(stats.network_rx_bytes, previous.stats.network_rx_bytes, previous.timestamp),
                rate(stats.network_tx_bytes, previous.stats.network_tx_bytes, previous.timestamp),
            ),
            None => (0.0, 0.0),
        };
        Self {
            stats,
            network_rx_rate,
            network_tx_rate,
            timestamp,
        }
    }
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth watching
    Warning,
    /// Needs attention now
    Critical,
}

/// A detected problem with a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Affected service
    pub service: String,
    /// Short issue title
    pub issue: String,
    /// What was observed
    pub description: String,
    /// How bad it is
    pub severity: Severity,
    /// Suggested next step
    pub recommendation: String,
    /// Whether restarting the service is likely to clear it
    pub restart_helps: bool,
}

impl Diagnostic {
    fn new(service: &str, issue: &str, description: String, severity: Severity, recommendation: &str) -> Self {
        Self {
            service: service.to_string(),
            issue: issue.to_string(),
            description,
            severity,
            recommendation: recommendation.to_string(),
            restart_helps: false,
        }
    }

    fn restart_helps(mut self) -> Self {
        self.restart_helps = true;
        self
    }
}

/// Full diagnosis of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    /// Diagnosed service
    pub service: String,
    /// Cached runtime state, if the service has a container
    pub state: Option<ServiceRuntimeState>,
    /// Latest metrics sample
    pub metrics: Option<MetricsSample>,
    /// Restarts performed by the runtime within the last hour
    pub restarts_last_hour: usize,
    /// Issues found, most severe first
    pub issues: Vec<Diagnostic>,
    /// Whether a restart is worth trying
    pub restart_recommended: bool,
}

/// Threshold checks for one sample
pub fn analyze_metrics(sample: &MetricsSample, thresholds: &Thresholds) -> Vec<Diagnostic> {
    let service = sample.stats.service.as_str();
    let cpu = sample.stats.cpu_percent;
    let memory = sample.stats.memory_percent;
    let mut issues = Vec::new();

    if cpu >= thresholds.cpu_critical {
        issues.push(Diagnostic::new(
            service,
            "Critical CPU usage",
            format!("CPU usage is at {:.1}%", cpu),
            Severity::Critical,
            "Consider scaling or optimizing the service. Check for runaway work.",
        ));
    } else if cpu >= thresholds.cpu_warning {
        issues.push(Diagnostic::new(
            service,
            "High CPU usage",
            format!("CPU usage is at {:.1}%", cpu),
            Severity::Warning,
            "Monitor for continued high usage. May need resource adjustment.",
        ));
    }

    if memory >= thresholds.memory_critical {
        issues.push(
            Diagnostic::new(
                service,
                "Critical memory usage",
                format!("Memory usage is at {:.1}%", memory),
                Severity::Critical,
                "Service may crash soon. Consider increasing the memory limit or restarting.",
            )
            .restart_helps(),
        );
    } else if memory >= thresholds.memory_warning {
        issues.push(Diagnostic::new(
            service,
            "High memory usage",
            format!("Memory usage is at {:.1}%", memory),
            Severity::Warning,
            "Monitor memory growth. Check for memory leaks.",
        ));
    }
    issues
}

/// Crash loop detection from the number of recent restarts
pub fn analyze_restarts(service: &str, restarts: usize, thresholds: &Thresholds) -> Option<Diagnostic> {
    let description = format!("Service has restarted {} times in the last hour", restarts);
    if restarts >= thresholds.restart_critical {
        Some(Diagnostic::new(
            service,
            "Crash loop detected",
            description,
            Severity::Critical,
            "Service is in a crash loop. Check logs for the root cause before restarting again.",
        ))
    } else if restarts >= thresholds.restart_warning {
        Some(Diagnostic::new(
            service,
            "Frequent restarts",
            description,
            Severity::Warning,
            "Monitor service stability. Check logs for errors.",
        ))
    } else {
        None
    }
}

struct LogPattern {
    pattern: Regex,
    issue: &'static str,
    severity: Severity,
    recommendation: &'static str,
    restart_helps: bool,
}

static LOG_PATTERNS: LazyLock<Vec<LogPattern>> = LazyLock::new(|| {
    let known = [
        (
            r"(?i)(out of memory|\boom\b|killed process|memory allocation failed)",
            "Container ran out of memory",
            Severity::Critical,
            "Increase the memory limit or reduce memory usage. A restart may help temporarily.",
            true,
        ),
        (
            r"(?i)(connection refused|econnrefused)",
            "Service cannot connect to a dependency",
            Severity::Warning,
            "Verify dependent services are running and reachable.",
            false,
        ),
        (
            r"(?i)(health ?check).*(fail|error|timeout)",
            "Health check is failing",
            Severity::Warning,
            "Check service logs and verify its dependencies are healthy.",
            false,
        ),
    ];
    known
        .into_iter()
        .filter_map(|(source, issue, severity, recommendation, restart_helps)| {
            match Regex::new(source) {
                Ok(pattern) => Some(LogPattern {
                    pattern,
                    issue,
                    severity,
                    recommendation,
                    restart_helps,
                }),
                Err(e) => {
                    warn!("Ignoring log pattern {}: {}", source, e);
                    None
                }
            }
        })
        .collect()
});

/// Known error patterns in the most recent log lines, one diagnostic per pattern
pub fn analyze_logs(service: &str, lines: &[String]) -> Vec<Diagnostic> {
    let recent = &lines[lines.len().saturating_sub(LOG_SCAN_LINES)..];
    LOG_PATTERNS
        .iter()
        .filter_map(|known| {
            let line = recent.iter().find(|line| known.pattern.is_match(line))?;
            let excerpt: String = line.chars().take(EXCERPT_CHARS).collect();
            let mut diagnostic = Diagnostic::new(
                service,
                known.issue,
                format!("Found in logs: {}", excerpt),
                known.severity,
                known.recommendation,
            );
            diagnostic.restart_helps = known.restart_helps;
            Some(diagnostic)
        })
        .collect()
}

/// Restart is only worth it for critical issues it can clear, and never
/// for a service that keeps restarting anyway
pub fn restart_recommended(issues: &[Diagnostic], restarts: usize, thresholds: &Thresholds) -> bool {
    restarts < thresholds.restart_warning
        && issues
            .iter()
            .any(|issue| issue.restart_helps && issue.severity == Severity::Critical)
}

/// Samples container metrics and raises alerts
pub struct MetricsCollector {
    runtime: Arc<dyn ContainerRuntime>,
    tracker: Arc<RuntimeStateTracker>,
    settings: MetricsSettings,
    history: RwLock<BTreeMap<String, VecDeque<MetricsSample>>>,
}

impl MetricsCollector {
    /// Create a collector with empty history
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        tracker: Arc<RuntimeStateTracker>,
        settings: MetricsSettings,
    ) -> Self {
        Self {
            runtime,
            tracker,
            settings,
            history: RwLock::new(BTreeMap::new()),
        }
    }

    /// Alert thresholds in use
    pub fn thresholds(&self) -> &Thresholds {
        &self.settings.thresholds
    }

    /// Take one sample of every running container and append it to history
    pub async fn collect(&self) -> Result<Vec<MetricsSample>> {
        let stats = self
            .runtime
            .stats()
            .await
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;
        let now = Utc::now();
        let capacity = self.settings.history.max(1);

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let samples: Vec<MetricsSample> = stats
            .into_iter()
            .map(|stats| {
                let series = history.entry(stats.service.clone()).or_default();
                let sample = MetricsSample::new(stats, series.back(), now);
                series.push_back(sample.clone());
                while series.len() > capacity {
                    series.pop_front();
                }
                sample
            })
            .collect();
        Ok(samples)
    }

    /// Most recent sample of every service
    pub fn latest(&self) -> Vec<MetricsSample> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|series| series.back().cloned())
            .collect()
    }

    /// Most recent sample of one service
    pub fn latest_for(&self, service: &str) -> Option<MetricsSample> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .and_then(|series| series.back().cloned())
    }

    /// Retained samples of one service, oldest first
    pub fn history(&self, service: &str) -> Vec<MetricsSample> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|series| series.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Metrics and restart issues of one service, without reading logs
    pub fn issues(&self, service: &str) -> Vec<Diagnostic> {
        let thresholds = &self.settings.thresholds;
        let mut issues: Vec<Diagnostic> = self
            .latest_for(service)
            .map(|sample| analyze_metrics(&sample, thresholds))
            .unwrap_or_default();
        let restarts = self.tracker.restarts_within(service, RESTART_WINDOW);
        issues.extend(analyze_restarts(service, restarts, thresholds));
        issues
    }

    /// Diagnose one service from its state, metrics, restarts and recent logs
    pub async fn diagnose(&self, service: &str) -> DiagnosticReport {
        let thresholds = &self.settings.thresholds;
        let restarts = self.tracker.restarts_within(service, RESTART_WINDOW);

        let mut issues = self.issues(service);
        issues.extend(analyze_logs(service, &self.recent_logs(service).await));
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));

        let restart_recommended = restart_recommended(&issues, restarts, thresholds);
        debug!("Diagnosed {}: {} issues", service, issues.len());
        DiagnosticReport {
            service: service.to_string(),
            state: self.tracker.state(service),
            metrics: self.latest_for(service),
            restarts_last_hour: restarts,
            issues,
            restart_recommended,
        }
    }

    /// Recent log lines, read until the tail goes quiet
    async fn recent_logs(&self, service: &str) -> Vec<String> {
        let mut stream = match self.runtime.logs(service, LOG_SCAN_LINES).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("No logs for {}: {}", service, e);
                return Vec::new();
            }
        };

        let mut lines = Vec::new();
        while lines.len() < LOG_SCAN_LINES {
            let next = async { stream.next().await };
            let quiet = async {
                Timer::after(LOG_QUIET).await;
                None
            };
            match smol::future::or(next, quiet).await {
                Some(line) => lines.push(line),
                None => break,
            }
        }
        lines
    }

    /// Spawn the sampling loop. Dropping the task stops it.
    ///
    /// Every sample is published as a metrics event. An alert event is
    /// published when an issue first appears; it is raised again only after
    /// clearing.
    pub fn spawn(self: &Arc<Self>, streamer: EventStreamer) -> smol::Task<()> {
        let collector = Arc::clone(self);
        info!(
            "Starting metrics collector with interval {:?}",
            collector.settings.interval
        );
        smol::spawn(async move {
            let mut raised: BTreeSet<(String, String)> = BTreeSet::new();
            let mut reachable = true;
            loop {
                match collector.collect().await {
                    Ok(samples) => {
                        reachable = true;
                        let mut active = BTreeSet::new();
                        for sample in &samples {
                            streamer.publish(StreamEvent::metrics(sample));
                            for issue in collector.issues(&sample.stats.service) {
                                let key = (issue.service.clone(), issue.issue.clone());
                                if !raised.contains(&key) {
                                    warn!("{}: {} ({})", issue.service, issue.issue, issue.description);
                                    streamer.publish(StreamEvent::alert(&issue));
                                }
                                active.insert(key);
                            }
                        }
                        raised = active;
                    }
                    Err(e) if reachable => {
                        warn!("Metrics collection failed: {}", e);
                        reachable = false;
                    }
                    Err(e) => debug!("Metrics collection failed: {}", e),
                }
                Timer::after(collector.settings.interval).await;
            }
        })
    }
}
