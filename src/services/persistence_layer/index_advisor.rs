//! Index Advisor
//!
//! Turns a slow statement plus its [`PlanAnalysis`] into index-creation proposals.
//! The statement is scanned lexically: the table comes from the source clause and
//! the candidate columns from comparison predicates in the filter clause.

use crate::utils::{generate_uuid, lock_or_recover, Logger};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, Mutex};

use super::plan_analyzer::PlanAnalysis;

pub const SINGLE_COLUMN_BENEFIT: &str = "70-90% latency reduction";
pub const COMPOSITE_BENEFIT: &str = "unknown until the access pattern is investigated";

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal pattern"));
static SOURCE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(?:FROM|UPDATE)\s+((?:"?[A-Za-z_]\w*"?\.)?"?[A-Za-z_]\w*"?)(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?"#,
    )
    .expect("valid source table pattern")
});
static FILTER_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bLIMIT\b|\bHAVING\b|\bOFFSET\b|\bRETURNING\b|;|$)",
    )
    .expect("valid filter clause pattern")
});
static PREDICATE_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)((?:[A-Za-z_]\w*\.)?[A-Za-z_]\w*)\s*(?:<>|!=|<=|>=|=|<|>|\bNOT\s+(?:LIKE|ILIKE|IN|BETWEEN)\b|\bLIKE\b|\bILIKE\b|\bIN\b|\bBETWEEN\b|\bIS\b)",
    )
    .expect("valid predicate column pattern")
});

const SQL_KEYWORDS: &[&str] = &[
    "AND", "OR", "NOT", "NULL", "TRUE", "FALSE", "WHERE", "CASE", "WHEN", "THEN", "ELSE", "END",
    "EXISTS", "SELECT", "ANY", "ALL", "SOME",
];

// Words that can follow a table name without being its alias
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "SET", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "ON", "USING",
    "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "RETURNING", "WINDOW", "UNION", "EXCEPT",
    "INTERSECT", "FOR", "WITH",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    #[serde(rename = "single-column")]
    SingleColumn,
    #[serde(rename = "composite")]
    Composite,
}

/// Ordered so that `Critical` sorts above `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionPriority {
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSuggestion {
    pub id: String,
    pub kind: IndexKind,
    pub table: String,
    pub column: Option<String>,
    pub ddl: String,
    pub reason: String,
    pub priority: SuggestionPriority,
    pub estimated_benefit: String,
    /// Signature of the statement that prompted the suggestion
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub applied: bool,
}

impl IndexSuggestion {
    /// Composite suggestions carry a comment instead of runnable DDL.
    pub fn is_executable(&self) -> bool {
        self.kind == IndexKind::SingleColumn
    }
}

/// Conventional index name for a single column: `<table>_<column>_idx`, schema dropped.
pub fn conventional_index_name(table: &str, column: &str) -> String {
    let base = table.rsplit('.').next().unwrap_or(table);
    format!("{}_{}_idx", base, column)
}

/// Table a statement reads from or writes to, with its alias if one is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub name: String,
    pub alias: Option<String>,
}

impl SourceTable {
    /// Whether a column qualifier names this table, by alias, bare or schema-qualified name.
    pub fn is_named_by(&self, qualifier: &str) -> bool {
        let qualifier = qualifier.trim_matches('"');
        let bare = self.name.rsplit('.').next().unwrap_or(&self.name);
        qualifier.eq_ignore_ascii_case(&self.name)
            || qualifier.eq_ignore_ascii_case(bare)
            || self
                .alias
                .as_deref()
                .is_some_and(|alias| qualifier.eq_ignore_ascii_case(alias))
    }
}

/// First FROM or UPDATE target outside any parentheses, so `EXTRACT(YEAR FROM x)`
/// and subqueries are skipped. For `INSERT INTO .. SELECT` this is the table read.
pub fn extract_source_table(query: &str) -> Option<SourceTable> {
    let stripped = STRING_LITERAL.replace_all(query, "?");
    SOURCE_TABLE
        .captures_iter(&stripped)
        .find(|caps| caps.get(0).is_some_and(|m| paren_depth(&stripped[..m.start()]) == 0))
        .map(|caps| SourceTable {
            name: caps[1].replace('"', ""),
            alias: caps
                .get(2)
                .map(|m| m.as_str())
                .filter(|word| !CLAUSE_KEYWORDS.contains(&word.to_ascii_uppercase().as_str()))
                .map(str::to_string),
        })
}

pub fn extract_table(query: &str) -> Option<String> {
    extract_source_table(query).map(|source| source.name)
}

fn paren_depth(text: &str) -> i32 {
    text.chars().fold(0, |depth, c| match c {
        '(' => depth + 1,
        ')' => depth - 1,
        _ => depth,
    })
}

/// Filter predicates split by whether they can be served by an index on the source table.
#[derive(Debug, Default, PartialEq, Eq)]
struct FilterColumns {
    own: Vec<String>,
    /// Predicates qualified with another table's name or alias
    foreign: usize,
}

fn scan_filter_columns(query: &str, source: &SourceTable) -> FilterColumns {
    let stripped = STRING_LITERAL.replace_all(query, "?");
    let mut found = FilterColumns::default();
    let Some(filter) = FILTER_CLAUSE.captures(&stripped).and_then(|caps| caps.get(1)) else {
        return found;
    };

    for caps in PREDICATE_COLUMN.captures_iter(filter.as_str()) {
        let raw = &caps[1];
        let (qualifier, column) = match raw.rsplit_once('.') {
            Some((qualifier, column)) => (Some(qualifier), column),
            None => (None, raw),
        };
        if SQL_KEYWORDS.contains(&column.to_ascii_uppercase().as_str()) {
            continue;
        }
        if qualifier.is_some_and(|q| !source.is_named_by(q)) {
            found.foreign += 1;
            continue;
        }
        if !found.own.iter().any(|c| c == column) {
            found.own.push(column.to_string());
        }
    }
    found
}

/// Columns of `source` compared in the WHERE clause, qualifiers stripped, first
/// occurrence order. Columns qualified with another table are left out.
pub fn extract_filter_columns(query: &str, source: &SourceTable) -> Vec<String> {
    scan_filter_columns(query, source).own
}

pub struct IndexAdvisor {
    deduplicate: bool,
    suggestions: Mutex<Vec<IndexSuggestion>>,
    logger: Logger,
}

impl IndexAdvisor {
    pub fn new(deduplicate: bool) -> Self {
        Self {
            deduplicate,
            suggestions: Mutex::new(Vec::new()),
            logger: Logger::for_component("index_advisor"),
        }
    }

    /// Proposals for one analyzed statement. Does not touch the suggestion log.
    pub fn suggest(&self, query: &str, signature: &str, analysis: &PlanAnalysis) -> Vec<IndexSuggestion> {
        let Some(source) = extract_source_table(query) else {
            self.logger
                .debug(&format!("No source table found for index advice: {}", signature));
            return Vec::new();
        };
        let FilterColumns { own: columns, foreign } = scan_filter_columns(query, &source);
        let table = source.name;
        let now = Utc::now();

        if columns.is_empty() {
            // filtering happens on a joined table, an index here would not help
            if foreign > 0 || !analysis.has_sequential_scan() {
                return Vec::new();
            }
            return vec![IndexSuggestion {
                id: generate_uuid(),
                kind: IndexKind::Composite,
                table: table.clone(),
                column: None,
                ddl: format!(
                    "-- composite index on {} needs manual investigation for: {}",
                    table, signature
                ),
                reason: format!(
                    "Sequential scan on {} with no filter columns that could be extracted",
                    table
                ),
                priority: SuggestionPriority::Critical,
                estimated_benefit: COMPOSITE_BENEFIT.to_string(),
                signature: signature.to_string(),
                created_at: now,
                applied: false,
            }];
        }

        columns
            .into_iter()
            .filter_map(|column| {
                let index_name = conventional_index_name(&table, &column);
                if analysis.uses_index(&index_name) {
                    return None;
                }
                Some(IndexSuggestion {
                    id: generate_uuid(),
                    kind: IndexKind::SingleColumn,
                    ddl: format!(
                        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                        index_name, table, column
                    ),
                    reason: format!("Filter on {}.{} is not served by an index", table, column),
                    table: table.clone(),
                    column: Some(column),
                    priority: SuggestionPriority::High,
                    estimated_benefit: SINGLE_COLUMN_BENEFIT.to_string(),
                    signature: signature.to_string(),
                    created_at: now,
                    applied: false,
                })
            })
            .collect()
    }

    /// Append to the log, skipping DDL already present when deduplication is on.
    /// Returns what was actually appended.
    pub fn record(&self, suggestions: Vec<IndexSuggestion>) -> Vec<IndexSuggestion> {
        let mut log = lock_or_recover(&self.suggestions);
        let mut appended = Vec::new();
        for suggestion in suggestions {
            if self.deduplicate && log.iter().any(|s| s.ddl == suggestion.ddl) {
                continue;
            }
            log.push(suggestion.clone());
            appended.push(suggestion);
        }
        drop(log);

        for suggestion in &appended {
            self.logger.info_with_meta(
                "Index suggestion recorded",
                Some(&serde_json::json!({
                    "table": suggestion.table,
                    "column": suggestion.column,
                    "priority": suggestion.priority,
                    "ddl": suggestion.ddl,
                })),
            );
        }
        appended
    }

    pub fn suggest_and_record(
        &self,
        query: &str,
        signature: &str,
        analysis: &PlanAnalysis,
    ) -> Vec<IndexSuggestion> {
        let suggestions = self.suggest(query, signature, analysis);
        self.record(suggestions)
    }

    /// Un-applied suggestions, critical first, oldest first within a priority.
    pub fn pending(&self, limit: usize) -> Vec<IndexSuggestion> {
        let log = lock_or_recover(&self.suggestions);
        // log is in insertion order and the sort is stable
        let mut pending: Vec<IndexSuggestion> = log.iter().filter(|s| !s.applied).cloned().collect();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority));
        pending.truncate(limit);
        pending
    }

    /// Mark every logged suggestion carrying this DDL as applied.
    pub fn mark_applied(&self, ddl: &str) -> usize {
        let mut log = lock_or_recover(&self.suggestions);
        let mut marked = 0;
        for suggestion in log.iter_mut().filter(|s| s.ddl == ddl && !s.applied) {
            suggestion.applied = true;
            marked += 1;
        }
        marked
    }

    pub fn suggestion_count(&self) -> usize {
        lock_or_recover(&self.suggestions).len()
    }
}
