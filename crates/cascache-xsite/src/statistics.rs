//! Cross-site replication counters.
//!
//! Counters are collected per cache. While statistics are disabled every
//! read returns `-1`. Exposed in Prometheus text exposition format.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "cascache_xsite_conflicts_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: i64,
}

impl Metric {
    /// Create a counter metric.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: i64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// Create a gauge metric.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: i64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    /// Format as Prometheus text exposition.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));

        if self.labels.is_empty() {
            output.push_str(&format!("{} {}\n", self.name, self.value));
        } else {
            let label_str = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(",");
            output.push_str(&format!("{}{{{}}} {}\n", self.name, label_str, self.value));
        }
        output
    }
}

/// How a detected conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The local entry was kept.
    LocalWins,
    /// The remote entry replaced the local one.
    RemoteWins,
    /// The policy produced a new entry.
    Merged,
}

/// Replication counters of one cache.
#[derive(Debug)]
pub struct XSiteStatistics {
    enabled: AtomicBool,
    queue_size: AtomicU64,
    conflicts: AtomicU64,
    local_wins: AtomicU64,
    remote_wins: AtomicU64,
    merged: AtomicU64,
    discards: AtomicU64,
}

impl Default for XSiteStatistics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl XSiteStatistics {
    /// Create counters, collecting from start if `enabled`.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            queue_size: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            local_wins: AtomicU64::new(0),
            remote_wins: AtomicU64::new(0),
            merged: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Toggle collection at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether statistics are collected.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.conflicts,
            &self.local_wins,
            &self.remote_wins,
            &self.merged,
            &self.discards,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn read(&self, counter: &AtomicU64) -> i64 {
        if self.is_enabled() {
            counter.load(Ordering::Relaxed) as i64
        } else {
            -1
        }
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.is_enabled() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keys waiting for delivery to at least one backup site.
    pub fn queue_size(&self) -> i64 {
        self.read(&self.queue_size)
    }

    /// Conflicts detected by this site.
    pub fn conflicts(&self) -> i64 {
        self.read(&self.conflicts)
    }

    /// Conflicts where the local entry was kept.
    pub fn conflicts_local_wins(&self) -> i64 {
        self.read(&self.local_wins)
    }

    /// Conflicts where the remote entry was applied.
    pub fn conflicts_remote_wins(&self) -> i64 {
        self.read(&self.remote_wins)
    }

    /// Conflicts resolved to a new entry.
    pub fn conflicts_merged(&self) -> i64 {
        self.read(&self.merged)
    }

    /// Remote updates dropped as stale or after a failed merge.
    pub fn discards(&self) -> i64 {
        self.read(&self.discards)
    }

    /// Record the current pending-key count.
    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size as u64, Ordering::Relaxed);
    }

    /// Record a resolved conflict.
    pub fn record_conflict(&self, outcome: ConflictOutcome) {
        self.bump(&self.conflicts);
        match outcome {
            ConflictOutcome::LocalWins => self.bump(&self.local_wins),
            ConflictOutcome::RemoteWins => self.bump(&self.remote_wins),
            ConflictOutcome::Merged => self.bump(&self.merged),
        }
    }

    /// Record a conflict whose merge failed.
    pub fn record_failed_merge(&self) {
        self.bump(&self.conflicts);
        self.bump(&self.discards);
    }

    /// Record a dropped remote update.
    pub fn record_discard(&self) {
        self.bump(&self.discards);
    }

    /// Prometheus metrics labelled with the cache and site.
    pub fn to_metrics(&self, cache: &str, site: &str) -> Vec<Metric> {
        let labels = vec![
            ("cache".to_string(), cache.to_string()),
            ("site".to_string(), site.to_string()),
        ];
        vec![
            Metric::gauge(
                "cascache_xsite_queue_size",
                "Keys waiting for delivery to a backup site",
                labels.clone(),
                self.queue_size(),
            ),
            Metric::counter(
                "cascache_xsite_conflicts_total",
                "Conflicts detected",
                labels.clone(),
                self.conflicts(),
            ),
            Metric::counter(
                "cascache_xsite_conflicts_local_wins_total",
                "Conflicts resolved in favour of the local entry",
                labels.clone(),
                self.conflicts_local_wins(),
            ),
            Metric::counter(
                "cascache_xsite_conflicts_remote_wins_total",
                "Conflicts resolved in favour of the remote entry",
                labels.clone(),
                self.conflicts_remote_wins(),
            ),
            Metric::counter(
                "cascache_xsite_conflicts_merged_total",
                "Conflicts resolved to a merged entry",
                labels.clone(),
                self.conflicts_merged(),
            ),
            Metric::counter(
                "cascache_xsite_discards_total",
                "Remote updates discarded",
                labels,
                self.discards(),
            ),
        ]
    }

    /// Format all metrics as Prometheus text exposition.
    pub fn format_prometheus(&self, cache: &str, site: &str) -> String {
        self.to_metrics(cache, site)
            .iter()
            .map(|m| m.format())
            .collect::<Vec<_>>()
            .join("")
    }
}
