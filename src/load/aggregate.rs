//! Result aggregation over the raw JTL files written by the load tool.
//!
//! Aggregation is a pure function of the file contents: labels are grouped
//! in a `BTreeMap`, so two calls over the same file serialize to identical
//! bytes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{metrics_file, result_file};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("result file {path} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is malformed at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

/// Output shape of the load result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultFormat {
    /// Raw samples grouped per label.
    #[default]
    Normal,
    /// Per-label statistics.
    Aggregate,
}

impl ResultFormat {
    /// Unknown or absent names select the default.
    pub fn parse_lenient(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("normal") => ResultFormat::Normal,
            Some("aggregate") => ResultFormat::Aggregate,
            Some(other) => {
                debug!(format = other, "unknown result format, using default");
                ResultFormat::Normal
            }
        }
    }
}

/// Output shape of the host metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetricsFormat {
    /// Time series per metric.
    #[default]
    Normal,
    /// min / avg / max per metric.
    Aggregate,
}

impl MetricsFormat {
    pub fn parse_lenient(name: Option<&str>) -> Self {
        match ResultFormat::parse_lenient(name) {
            ResultFormat::Normal => MetricsFormat::Normal,
            ResultFormat::Aggregate => MetricsFormat::Aggregate,
        }
    }
}

/// Whether the writer may still be appending to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// PENDING or RUNNING: a missing file is empty, a torn last line is skipped.
    Live,
    /// Terminal phase: the file is final and must be well formed.
    Settled,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRawData {
    /// Sample start, epoch milliseconds.
    pub timestamp: i64,
    pub elapsed: i64,
    pub response_code: String,
    pub bytes: u64,
    pub sent_bytes: u64,
    pub latency: i64,
    pub connect_time: i64,
    pub url: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub label: String,
    pub results: Vec<ResultRawData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestStatistics {
    pub label: String,
    pub request_count: usize,
    pub average: f64,
    pub median: i64,
    pub ninety_percent: i64,
    pub ninety_five: i64,
    pub ninety_nine: i64,
    pub min_time: i64,
    pub max_time: i64,
    pub error_percent: f64,
    /// Requests per second over the label's sample span.
    pub throughput: f64,
    pub received_kb: f64,
    pub sent_kb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultOutput {
    Normal(Vec<ResultSummary>),
    Aggregate(Vec<LoadTestStatistics>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRawData {
    pub timestamp: i64,
    pub value: f64,
    pub unit: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub label: String,
    pub metrics: Vec<MetricsRawData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsStatistics {
    pub label: String,
    pub unit: String,
    pub count: usize,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricsOutput {
    Normal(Vec<MetricsSummary>),
    Aggregate(Vec<MetricsStatistics>),
}

// ---------------------------------------------------------------------------
// JTL parsing
// ---------------------------------------------------------------------------

/// One JTL CSV row. Columns not listed here are ignored.
#[derive(Debug, Deserialize)]
struct JtlRow {
    #[serde(rename = "timeStamp")]
    timestamp: i64,
    elapsed: i64,
    label: String,
    #[serde(rename = "responseCode", default)]
    response_code: String,
    success: bool,
    #[serde(default)]
    bytes: u64,
    #[serde(rename = "sentBytes", default)]
    sent_bytes: u64,
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(rename = "Latency", default)]
    latency: i64,
    #[serde(rename = "Connect", default)]
    connect: i64,
}

/// Read `path` into per-label groups.
fn read_grouped(path: &Path, source: SampleSource) -> Result<BTreeMap<String, Vec<JtlRow>>, AggregateError> {
    let mut grouped: BTreeMap<String, Vec<JtlRow>> = BTreeMap::new();

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return match source {
                SampleSource::Live => Ok(grouped),
                SampleSource::Settled => Err(AggregateError::Missing {
                    path: path.to_path_buf(),
                }),
            };
        }
        Err(e) => {
            return Err(AggregateError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|e| AggregateError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(content.as_slice());
    let mut rows = reader.deserialize::<JtlRow>().peekable();

    while let Some(row) = rows.next() {
        match row {
            Ok(row) => grouped.entry(row.label.clone()).or_default().push(row),
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                if source == SampleSource::Live && rows.peek().is_none() {
                    debug!(path = %path.display(), line, "skipping partially written last row");
                    break;
                }
                return Err(AggregateError::Corrupt {
                    path: path.to_path_buf(),
                    line,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(grouped)
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[i64], pct: usize) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() * pct).div_ceil(100).max(1);
    sorted[rank - 1]
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn label_statistics(label: &str, rows: &[JtlRow]) -> LoadTestStatistics {
    let count = rows.len();
    let mut elapsed: Vec<i64> = rows.iter().map(|r| r.elapsed).collect();
    elapsed.sort_unstable();

    let total: i64 = elapsed.iter().sum();
    let errors = rows.iter().filter(|r| !r.success).count();
    let received: u64 = rows.iter().map(|r| r.bytes).sum();
    let sent: u64 = rows.iter().map(|r| r.sent_bytes).sum();

    let first_start = rows.iter().map(|r| r.timestamp).min().unwrap_or(0);
    let last_end = rows.iter().map(|r| r.timestamp + r.elapsed).max().unwrap_or(0);
    let span_secs = (last_end - first_start).max(0) as f64 / 1000.0;
    let per_sec = |v: f64| if span_secs > 0.0 { v / span_secs } else { v };

    LoadTestStatistics {
        label: label.to_string(),
        request_count: count,
        average: if count == 0 { 0.0 } else { round2(total as f64 / count as f64) },
        median: percentile(&elapsed, 50),
        ninety_percent: percentile(&elapsed, 90),
        ninety_five: percentile(&elapsed, 95),
        ninety_nine: percentile(&elapsed, 99),
        min_time: elapsed.first().copied().unwrap_or(0),
        max_time: elapsed.last().copied().unwrap_or(0),
        error_percent: if count == 0 { 0.0 } else { round2(errors as f64 * 100.0 / count as f64) },
        throughput: round2(per_sec(count as f64)),
        received_kb: round2(per_sec(received as f64 / 1024.0)),
        sent_kb: round2(per_sec(sent as f64 / 1024.0)),
    }
}

/// Unit for a PerfMon metric label such as `10.0.0.30 CPU`.
fn metric_unit(label: &str) -> &'static str {
    let lower = label.to_ascii_lowercase();
    if lower.contains("cpu") || lower.contains("memory") || lower.contains("swap") {
        "%"
    } else if lower.contains("disk") || lower.contains("network") {
        "bytes"
    } else {
        ""
    }
}

/// PerfMon stores `value * 1000` in the elapsed column.
fn metric_value(row: &JtlRow) -> f64 {
    row.elapsed as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// ResultAggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResultAggregator {
    result_dir: PathBuf,
}

impl ResultAggregator {
    pub fn new(result_dir: impl Into<PathBuf>) -> Self {
        Self {
            result_dir: result_dir.into(),
        }
    }

    /// Load results for `test_key` in the requested shape.
    pub fn aggregate_result(
        &self,
        test_key: &str,
        format: ResultFormat,
        source: SampleSource,
    ) -> Result<ResultOutput, AggregateError> {
        let grouped = read_grouped(&result_file(&self.result_dir, test_key), source)?;

        let output = match format {
            ResultFormat::Normal => ResultOutput::Normal(
                grouped
                    .into_iter()
                    .map(|(label, rows)| ResultSummary {
                        label,
                        results: rows
                            .into_iter()
                            .map(|r| ResultRawData {
                                timestamp: r.timestamp,
                                elapsed: r.elapsed,
                                response_code: r.response_code,
                                bytes: r.bytes,
                                sent_bytes: r.sent_bytes,
                                latency: r.latency,
                                connect_time: r.connect,
                                url: r.url,
                                is_error: !r.success,
                            })
                            .collect(),
                    })
                    .collect(),
            ),
            ResultFormat::Aggregate => ResultOutput::Aggregate(
                grouped
                    .iter()
                    .map(|(label, rows)| label_statistics(label, rows))
                    .collect(),
            ),
        };
        Ok(output)
    }

    /// Load host metrics for `test_key` in the requested shape.
    pub fn aggregate_metrics(
        &self,
        test_key: &str,
        format: MetricsFormat,
        source: SampleSource,
    ) -> Result<MetricsOutput, AggregateError> {
        let grouped = read_grouped(&metrics_file(&self.result_dir, test_key), source)?;

        let output = match format {
            MetricsFormat::Normal => MetricsOutput::Normal(
                grouped
                    .into_iter()
                    .map(|(label, rows)| {
                        let unit = metric_unit(&label);
                        MetricsSummary {
                            metrics: rows
                                .iter()
                                .map(|r| MetricsRawData {
                                    timestamp: r.timestamp,
                                    value: metric_value(r),
                                    unit: unit.to_string(),
                                    is_error: !r.success,
                                })
                                .collect(),
                            label,
                        }
                    })
                    .collect(),
            ),
            MetricsFormat::Aggregate => MetricsOutput::Aggregate(
                grouped
                    .iter()
                    .map(|(label, rows)| {
                        let values: Vec<f64> = rows.iter().map(metric_value).collect();
                        let count = values.len();
                        let sum: f64 = values.iter().sum();
                        MetricsStatistics {
                            label: label.clone(),
                            unit: metric_unit(label).to_string(),
                            count,
                            min: values.iter().copied().fold(f64::INFINITY, f64::min),
                            avg: if count == 0 { 0.0 } else { round2(sum / count as f64) },
                            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        }
                    })
                    .collect(),
            ),
        };
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
