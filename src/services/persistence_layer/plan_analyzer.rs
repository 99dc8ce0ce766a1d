//! Plan Analyzer
//!
//! Requests a diagnostic plan for a slow statement and turns its text into a
//! [`PlanAnalysis`]. Plan text is pattern-matched, never parsed as a grammar; each
//! backend dialect supplies its own [`PlanParser`].

use crate::utils::{GovernorError, GovernorResult, Logger};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use super::connection_pool::ConnectionPool;
use super::query_cache::is_cacheable_statement;

/// Scan strategies recognized in plan output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    SequentialScan,
    IndexScan,
    IndexOnlyScan,
    BitmapHeapScan,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::SequentialScan => "sequential_scan",
            ScanType::IndexScan => "index_scan",
            ScanType::IndexOnlyScan => "index_only_scan",
            ScanType::BitmapHeapScan => "bitmap_heap_scan",
        }
    }
}

/// Structured metrics extracted from one plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanAnalysis {
    pub dialect: String,
    pub total_cost: Option<f64>,
    pub startup_cost: Option<f64>,
    pub actual_time_ms: Option<f64>,
    pub row_estimate: Option<u64>,
    pub scan_types: BTreeSet<ScanType>,
    pub indexes_used: BTreeSet<String>,
    pub warnings: Vec<String>,
}

impl PlanAnalysis {
    pub fn new(dialect: &str) -> Self {
        Self {
            dialect: dialect.to_string(),
            ..Default::default()
        }
    }

    pub fn has_sequential_scan(&self) -> bool {
        self.scan_types.contains(&ScanType::SequentialScan)
    }

    pub fn uses_index(&self, index_name: &str) -> bool {
        self.indexes_used.contains(index_name)
    }
}

/// Dialect-specific plan retrieval and parsing.
pub trait PlanParser: Send + Sync {
    fn dialect(&self) -> &'static str;

    /// Statement that asks the backend for a plan of `query`.
    fn explain_statement(&self, query: &str) -> String;

    fn parse(&self, plan_text: &str) -> GovernorResult<PlanAnalysis>;
}

fn unrecognized_plan(dialect: &str, plan_text: &str) -> GovernorError {
    let preview: String = plan_text.chars().take(120).collect();
    crate::governor_error!(
        crate::utils::ErrorKind::AnalysisError,
        format!("Unrecognized {} plan output", dialect),
        "dialect" => dialect,
        "plan_preview" => preview
    )
    .with_code("ANALYSIS_ERROR")
}

fn clean_identifier(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '"' || c == '`' || c == '[' || c == ']' || c == ',')
        .to_string()
}

// ============= POSTGRES =============

static PG_COST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"cost=(\d+(?:\.\d+)?)\.\.(\d+(?:\.\d+)?)(?:\s+rows=(\d+))?")
        .expect("valid cost pattern")
});
static PG_ACTUAL_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"actual time=(\d+(?:\.\d+)?)\.\.(\d+(?:\.\d+)?)").expect("valid actual time pattern")
});
static PG_EXECUTION_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Execution Time:\s*(\d+(?:\.\d+)?)\s*ms").expect("valid execution time pattern")
});
static PG_SEQ_SCAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Seq Scan on (\S+)").expect("valid seq scan pattern"));
static PG_INDEX_SCAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Index Scan(?: Backward)? using (\S+)").expect("valid index scan pattern")
});
static PG_INDEX_ONLY_SCAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Index Only Scan(?: Backward)? using (\S+)").expect("valid index only scan pattern")
});
static PG_BITMAP_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bitmap Index Scan on (\S+)").expect("valid bitmap index pattern")
});

/// Parses `EXPLAIN (ANALYZE, BUFFERS)` text output.
#[derive(Debug, Clone)]
pub struct PostgresPlanParser {
    seq_scan_row_threshold: u64,
}

impl PostgresPlanParser {
    pub fn new(seq_scan_row_threshold: u64) -> Self {
        Self {
            seq_scan_row_threshold,
        }
    }
}

impl Default for PostgresPlanParser {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl PlanParser for PostgresPlanParser {
    fn dialect(&self) -> &'static str {
        "postgres"
    }

    /// ANALYZE executes the statement, so writes only get an estimated plan.
    fn explain_statement(&self, query: &str) -> String {
        if is_cacheable_statement(query) {
            format!("EXPLAIN (ANALYZE, BUFFERS) {}", query)
        } else {
            format!("EXPLAIN {}", query)
        }
    }

    fn parse(&self, plan_text: &str) -> GovernorResult<PlanAnalysis> {
        let mut analysis = PlanAnalysis::new(self.dialect());

        // top node carries the plan-wide figures
        if let Some(caps) = PG_COST.captures(plan_text) {
            analysis.startup_cost = caps.get(1).and_then(|m| m.as_str().parse().ok());
            analysis.total_cost = caps.get(2).and_then(|m| m.as_str().parse().ok());
            analysis.row_estimate = caps.get(3).and_then(|m| m.as_str().parse().ok());
        }
        analysis.actual_time_ms = PG_ACTUAL_TIME
            .captures(plan_text)
            .and_then(|caps| caps.get(2))
            .or_else(|| PG_EXECUTION_TIME.captures(plan_text).and_then(|caps| caps.get(1)))
            .and_then(|m| m.as_str().parse().ok());

        for line in plan_text.lines() {
            if let Some(caps) = PG_SEQ_SCAN.captures(line) {
                analysis.scan_types.insert(ScanType::SequentialScan);
                let table = clean_identifier(&caps[1]);
                let rows = PG_COST
                    .captures(line)
                    .and_then(|c| c.get(3))
                    .and_then(|m| m.as_str().parse::<u64>().ok());
                match rows {
                    Some(rows) if rows > self.seq_scan_row_threshold => {
                        analysis.warnings.push(format!(
                            "Sequential scan on {} (~{} rows estimated)",
                            table, rows
                        ));
                    }
                    Some(_) => {}
                    None => analysis
                        .warnings
                        .push(format!("Sequential scan on {} (row estimate unavailable)", table)),
                }
            }
            if let Some(caps) = PG_INDEX_ONLY_SCAN.captures(line) {
                analysis.scan_types.insert(ScanType::IndexOnlyScan);
                analysis.indexes_used.insert(clean_identifier(&caps[1]));
            } else if let Some(caps) = PG_INDEX_SCAN.captures(line) {
                analysis.scan_types.insert(ScanType::IndexScan);
                analysis.indexes_used.insert(clean_identifier(&caps[1]));
            }
            if line.contains("Bitmap Heap Scan") {
                analysis.scan_types.insert(ScanType::BitmapHeapScan);
            }
            if let Some(caps) = PG_BITMAP_INDEX.captures(line) {
                analysis.indexes_used.insert(clean_identifier(&caps[1]));
            }
            if line.contains("Sort Method: external") {
                analysis
                    .warnings
                    .push("Sort spilled to disk (external sort)".to_string());
            }
        }

        if analysis.total_cost.is_none() && analysis.scan_types.is_empty() {
            return Err(unrecognized_plan(self.dialect(), plan_text));
        }
        Ok(analysis)
    }
}

// ============= SQLITE / D1 =============

static SQLITE_SCAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSCAN (?:TABLE )?(\S+)").expect("valid scan pattern"));
static SQLITE_SEARCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSEARCH (?:TABLE )?(\S+)").expect("valid search pattern"));
static SQLITE_COVERING_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"USING COVERING INDEX (\S+)").expect("valid covering index pattern")
});
static SQLITE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"USING INDEX (\S+)").expect("valid index pattern"));

/// Parses `EXPLAIN QUERY PLAN` output from SQLite and D1.
#[derive(Debug, Clone, Default)]
pub struct SqlitePlanParser;

impl SqlitePlanParser {
    pub fn new() -> Self {
        Self
    }
}

impl PlanParser for SqlitePlanParser {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    fn explain_statement(&self, query: &str) -> String {
        format!("EXPLAIN QUERY PLAN {}", query)
    }

    fn parse(&self, plan_text: &str) -> GovernorResult<PlanAnalysis> {
        let mut analysis = PlanAnalysis::new(self.dialect());
        let mut recognized = false;

        for line in plan_text.lines() {
            let table = SQLITE_SEARCH
                .captures(line)
                .or_else(|| SQLITE_SCAN.captures(line))
                .map(|caps| clean_identifier(&caps[1]));
            let Some(table) = table else {
                if line.contains("USE TEMP B-TREE") {
                    analysis
                        .warnings
                        .push(format!("Temporary B-tree: {}", line.trim_start_matches(['|', '`', '-', ' '])));
                }
                continue;
            };
            if line.contains("CONSTANT ROW") {
                continue;
            }
            recognized = true;

            if let Some(caps) = SQLITE_COVERING_INDEX.captures(line) {
                analysis.scan_types.insert(ScanType::IndexOnlyScan);
                analysis.indexes_used.insert(clean_identifier(&caps[1]));
            } else if let Some(caps) = SQLITE_INDEX.captures(line) {
                analysis.scan_types.insert(ScanType::IndexScan);
                analysis.indexes_used.insert(clean_identifier(&caps[1]));
            } else if line.contains("USING INTEGER PRIMARY KEY") || line.contains("USING ROWID") {
                analysis.scan_types.insert(ScanType::IndexScan);
            } else {
                analysis.scan_types.insert(ScanType::SequentialScan);
                analysis
                    .warnings
                    .push(format!("Full table scan on {}", table));
            }
        }

        if !recognized {
            return Err(unrecognized_plan(self.dialect(), plan_text));
        }
        Ok(analysis)
    }
}

// ============= ANALYZER =============

pub struct PlanAnalyzer {
    pool: Arc<ConnectionPool>,
    parser: Arc<dyn PlanParser>,
    logger: Logger,
}

impl PlanAnalyzer {
    pub fn new(pool: Arc<ConnectionPool>, parser: Arc<dyn PlanParser>) -> Self {
        Self {
            pool,
            parser,
            logger: Logger::for_component("plan_analyzer"),
        }
    }

    pub fn dialect(&self) -> &'static str {
        self.parser.dialect()
    }

    /// Fetch and parse a plan for `query`. Not bounded by any caller deadline.
    /// Every failure comes back as an analysis error.
    pub async fn analyze(&self, query: &str, params: &[Value]) -> GovernorResult<PlanAnalysis> {
        let statement = self.parser.explain_statement(query);

        let plan_text = {
            let mut conn = self.pool.acquire().await.map_err(|e| {
                GovernorError::analysis_error(format!("No connection for plan analysis: {}", e))
            })?;
            conn.explain(&statement, params).await.map_err(|e| {
                GovernorError::analysis_error(format!("Plan request failed: {}", e))
            })?
        };

        let analysis = self.parser.parse(&plan_text)?;
        self.logger.debug_with_meta(
            "Plan analyzed",
            Some(&serde_json::json!({
                "dialect": analysis.dialect,
                "total_cost": analysis.total_cost,
                "actual_time_ms": analysis.actual_time_ms,
                "scan_types": analysis.scan_types.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                "warnings": analysis.warnings.len(),
            })),
        );
        Ok(analysis)
    }
}
