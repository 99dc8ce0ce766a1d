//! Performance Monitor for the Query Governor
//!
//! Groups every executed statement under a literal-free signature and keeps
//! per-signature latency aggregates, a process-wide running average and a bounded
//! window of recent latencies for percentile reporting.
//!
//! Signatures are truncated to `max_signature_length` characters, so two long
//! statements that only differ past that point share one entry.

use crate::utils::{lock_or_recover, truncate_chars, Logger};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{LazyLock, Mutex};

const WILDCARD: &str = "?";

static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal pattern"));
static POSITIONAL_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d+").expect("valid positional parameter pattern"));
// `::type` casts are left alone: the colon must not follow another colon or a word char
static NAMED_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^:\w]):[A-Za-z_]\w*").expect("valid named parameter pattern")
});
static NUMERIC_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b").expect("valid numeric literal pattern")
});
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Normalized statement text used to group executions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySignature(String);

impl QuerySignature {
    /// Double-quoted text is an identifier in SQL and is kept verbatim.
    pub fn normalize(query: &str, max_length: usize) -> Self {
        let text = SINGLE_QUOTED.replace_all(query, WILDCARD);
        let text = POSITIONAL_PARAM.replace_all(&text, WILDCARD);
        let text = NAMED_PARAM.replace_all(&text, format!("${{1}}{}", WILDCARD));
        let text = NUMERIC_LITERAL.replace_all(&text, WILDCARD);
        let text = WHITESPACE.replace_all(&text, " ");
        Self(truncate_chars(text.trim(), max_length).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// How an execution ended, as far as latency accounting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Timeout,
    Failed,
}

/// Aggregates for one signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureStats {
    pub signature: String,
    pub count: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub max_time_ms: f64,
    pub last_executed_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    /// Executions above the slow threshold
    pub slow_count: u64,
    /// Executions that timed out or failed
    pub error_count: u64,
}

impl SignatureStats {
    fn new(signature: String, now: DateTime<Utc>) -> Self {
        Self {
            signature,
            count: 0,
            total_time_ms: 0.0,
            avg_time_ms: 0.0,
            max_time_ms: 0.0,
            last_executed_at: now,
            first_seen_at: now,
            slow_count: 0,
            error_count: 0,
        }
    }

    fn observe(&mut self, elapsed_ms: f64, is_slow: bool, outcome: ExecutionOutcome, now: DateTime<Utc>) {
        self.count += 1;
        self.total_time_ms += elapsed_ms;
        self.avg_time_ms = self.total_time_ms / self.count as f64;
        self.max_time_ms = self.max_time_ms.max(elapsed_ms);
        self.last_executed_at = now;
        if is_slow {
            self.slow_count += 1;
        }
        if outcome != ExecutionOutcome::Success {
            self.error_count += 1;
        }
    }
}

/// What `record` concluded about one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExecution {
    pub signature: QuerySignature,
    pub elapsed_ms: f64,
    pub is_slow: bool,
}

/// Process-wide view of everything recorded so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecorderSummary {
    pub recorded_executions: u64,
    pub avg_time_ms: f64,
    pub slow_queries: u64,
    /// Signatures with at least one slow execution
    pub slow_signature_count: usize,
    /// Most recent latencies, oldest first
    pub recent_latencies_ms: Vec<f64>,
}

#[derive(Debug, Default)]
struct MonitorState {
    signatures: HashMap<QuerySignature, SignatureStats>,
    recent_latencies_ms: VecDeque<f64>,
    recorded_executions: u64,
    avg_time_ms: f64,
    slow_queries: u64,
}

pub struct PerformanceMonitor {
    slow_query_threshold_ms: f64,
    max_signature_length: usize,
    latency_sample_size: usize,
    state: Mutex<MonitorState>,
    logger: Logger,
}

impl PerformanceMonitor {
    pub fn new(
        slow_query_threshold_ms: u64,
        max_signature_length: usize,
        latency_sample_size: usize,
    ) -> Self {
        Self {
            slow_query_threshold_ms: slow_query_threshold_ms as f64,
            max_signature_length,
            latency_sample_size,
            state: Mutex::new(MonitorState::default()),
            logger: Logger::for_component("performance_monitor"),
        }
    }

    pub fn signature_for(&self, query: &str) -> QuerySignature {
        QuerySignature::normalize(query, self.max_signature_length)
    }

    /// Account one execution, whatever its outcome.
    pub fn record(
        &self,
        query: &str,
        elapsed_ms: f64,
        outcome: ExecutionOutcome,
    ) -> RecordedExecution {
        let signature = self.signature_for(query);
        let is_slow = elapsed_ms > self.slow_query_threshold_ms;
        let now = Utc::now();

        {
            let mut state = lock_or_recover(&self.state);

            state.recorded_executions += 1;
            let n = state.recorded_executions as f64;
            state.avg_time_ms += (elapsed_ms - state.avg_time_ms) / n;
            if is_slow {
                state.slow_queries += 1;
            }

            if state.recent_latencies_ms.len() >= self.latency_sample_size {
                state.recent_latencies_ms.pop_front();
            }
            state.recent_latencies_ms.push_back(elapsed_ms);

            state
                .signatures
                .entry(signature.clone())
                .or_insert_with(|| SignatureStats::new(signature.as_str().to_string(), now))
                .observe(elapsed_ms, is_slow, outcome, now);
        }

        if is_slow {
            self.logger.warn_with_meta(
                "Slow query detected",
                Some(&serde_json::json!({
                    "signature": signature.as_str(),
                    "elapsed_ms": elapsed_ms,
                    "threshold_ms": self.slow_query_threshold_ms,
                    "outcome": outcome,
                })),
            );
        }

        RecordedExecution {
            signature,
            elapsed_ms,
            is_slow,
        }
    }

    pub fn stats_for(&self, signature: &QuerySignature) -> Option<SignatureStats> {
        lock_or_recover(&self.state).signatures.get(signature).cloned()
    }

    /// All signatures, most frequent first.
    pub fn signature_stats(&self) -> Vec<SignatureStats> {
        let mut stats: Vec<SignatureStats> =
            lock_or_recover(&self.state).signatures.values().cloned().collect();
        stats.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        stats
    }

    /// Signatures with the highest average latency.
    pub fn top_slow_signatures(&self, limit: usize) -> Vec<SignatureStats> {
        let mut stats: Vec<SignatureStats> =
            lock_or_recover(&self.state).signatures.values().cloned().collect();
        stats.sort_by(|a, b| {
            b.avg_time_ms
                .total_cmp(&a.avg_time_ms)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        stats.truncate(limit);
        stats
    }

    pub fn summary(&self) -> RecorderSummary {
        let state = lock_or_recover(&self.state);
        RecorderSummary {
            recorded_executions: state.recorded_executions,
            avg_time_ms: state.avg_time_ms,
            slow_queries: state.slow_queries,
            slow_signature_count: state
                .signatures
                .values()
                .filter(|s| s.slow_count > 0)
                .count(),
            recent_latencies_ms: state.recent_latencies_ms.iter().copied().collect(),
        }
    }
}
