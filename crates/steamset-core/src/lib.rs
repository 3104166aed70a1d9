//! Core domain model for the steamset harvest + materialization pipeline.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "steamset-core";

/// Externally assigned catalog identifier (Steam appid).
pub type CatalogId = u64;

/// One row of the upstream bulk listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogListing {
    pub identifier: CatalogId,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Pending => "pending",
            FetchStatus::Success => "success",
            FetchStatus::Failed => "failed",
            FetchStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(FetchStatus::Pending),
            "success" => Some(FetchStatus::Success),
            "failed" => Some(FetchStatus::Failed),
            "skipped" => Some(FetchStatus::Skipped),
            _ => None,
        }
    }
}

/// Which validation layer rejected a detail fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    Network,
    Http,
    Parse,
    Application,
}

impl fmt::Display for FetchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FetchFailureKind::Network => "network",
            FetchFailureKind::Http => "http",
            FetchFailureKind::Parse => "parse",
            FetchFailureKind::Application => "application",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub detail: String,
}

/// Per-identifier result record kept in the raw corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub identifier: CatalogId,
    pub display_name: String,
    #[serde(default)]
    pub raw_payload: Option<JsonValue>,
    #[serde(default)]
    pub entity_type: Option<String>,
    pub fetch_status: FetchStatus,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchFailure>,
}

impl CatalogEntry {
    pub fn is_success(&self) -> bool {
        self.fetch_status == FetchStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    Replaced,
    Unchanged,
}

/// Ordered, identifier-unique collection of catalog entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<CatalogEntry>", into = "Vec<CatalogEntry>")]
pub struct Corpus {
    entries: Vec<CatalogEntry>,
    index: HashMap<CatalogId, usize>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identifier: CatalogId) -> bool {
        self.index.contains_key(&identifier)
    }

    pub fn get(&self, identifier: CatalogId) -> Option<&CatalogEntry> {
        self.index.get(&identifier).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    /// Appends a newly attempted identifier. Returns `false` and leaves the corpus
    /// untouched when the identifier is already present.
    pub fn insert(&mut self, entry: CatalogEntry) -> bool {
        if self.index.contains_key(&entry.identifier) {
            return false;
        }
        self.index.insert(entry.identifier, self.entries.len());
        self.entries.push(entry);
        true
    }

    /// Merges a re-fetched entry. Only successes are merged, and an existing success is
    /// never overwritten.
    pub fn merge_success(&mut self, entry: CatalogEntry) -> MergeOutcome {
        if !entry.is_success() {
            return MergeOutcome::Unchanged;
        }
        match self.index.get(&entry.identifier) {
            Some(&i) if self.entries[i].is_success() => MergeOutcome::Unchanged,
            Some(&i) => {
                self.entries[i] = entry;
                MergeOutcome::Replaced
            }
            None => {
                self.insert(entry);
                MergeOutcome::Appended
            }
        }
    }

    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_success()).count()
    }

    pub fn identifiers(&self) -> BTreeSet<CatalogId> {
        self.index.keys().copied().collect()
    }

    pub fn success_identifiers(&self) -> BTreeSet<CatalogId> {
        self.entries
            .iter()
            .filter(|e| e.is_success())
            .map(|e| e.identifier)
            .collect()
    }
}

impl From<Vec<CatalogEntry>> for Corpus {
    fn from(entries: Vec<CatalogEntry>) -> Self {
        let mut corpus = Corpus::new();
        for entry in entries {
            if !corpus.insert(entry.clone()) {
                // duplicate on disk: a success wins, otherwise the first record stays
                corpus.merge_success(entry);
            }
        }
        corpus
    }
}

impl From<Corpus> for Vec<CatalogEntry> {
    fn from(corpus: Corpus) -> Self {
        corpus.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    PoolExhausted,
}

/// Metadata block of a checkpoint / output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub target_count: usize,
    pub actual_count: usize,
    pub attempted_count: usize,
    pub success_rate: f64,
    pub rate_limit_delay_seconds: f64,
    pub checkpoint_every: usize,
    #[serde(default)]
    pub wanted_type: Option<String>,
    pub id_threshold: CatalogId,
    /// Short SHA-256 fingerprint of the API credential; never the secret itself.
    #[serde(default)]
    pub credential_fingerprint: Option<String>,
    pub output_reference: String,
    #[serde(default)]
    pub recollection_passes: u32,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
}

/// One harvest invocation: metadata plus the corpus it owns. This is also the
/// checkpoint format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub metadata: RunMetadata,
    pub entries: Corpus,
}

impl CollectionRun {
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            metadata,
            entries: Corpus::new(),
        }
    }

    /// Recomputes `actual_count` and `success_rate` from the corpus.
    pub fn refresh_counts(&mut self) {
        self.metadata.actual_count = self.entries.success_count();
        self.metadata.success_rate = if self.metadata.attempted_count == 0 {
            0.0
        } else {
            self.metadata.actual_count as f64 / self.metadata.attempted_count as f64
        };
    }

    pub fn target_met(&self) -> bool {
        self.metadata.actual_count >= self.metadata.target_count
    }
}

/// A stored raw record projected onto one semi-structured source field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub identifier: CatalogId,
    pub source: Option<JsonValue>,
}

/// One derived text column value for one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedField {
    pub identifier: CatalogId,
    pub field_name: String,
    pub raw_source_path: String,
    pub value: Option<String>,
    pub parse_method: String,
}

/// Treats SQL NULL and the empty string as the same value.
pub fn normalize_nullable(value: Option<&str>) -> &str {
    value.unwrap_or("")
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidationScope {
    Sample { fraction: f64, seed: Option<u64> },
    Full,
}

impl ValidationScope {
    pub fn is_full(&self) -> bool {
        matches!(self, ValidationScope::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub identifier: CatalogId,
    pub field_name: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub scope: ValidationScope,
    pub generated_at: DateTime<Utc>,
    pub rows_examined: usize,
    pub rows_skipped: usize,
    pub total_comparisons: usize,
    pub mismatch_count: usize,
    pub mismatches: Vec<Mismatch>,
    pub pass_rate: f64,
}

impl ValidationReport {
    pub fn new(scope: ValidationScope) -> Self {
        Self {
            scope,
            generated_at: Utc::now(),
            rows_examined: 0,
            rows_skipped: 0,
            total_comparisons: 0,
            mismatch_count: 0,
            mismatches: Vec::new(),
            pass_rate: 1.0,
        }
    }

    pub fn record_comparison(
        &mut self,
        identifier: CatalogId,
        field_name: &str,
        expected: Option<&str>,
        actual: Option<&str>,
    ) {
        self.total_comparisons += 1;
        let expected = normalize_nullable(expected);
        let actual = normalize_nullable(actual);
        if expected != actual {
            self.mismatch_count += 1;
            self.mismatches.push(Mismatch {
                identifier,
                field_name: field_name.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    pub fn finalize(&mut self) {
        self.pass_rate = if self.total_comparisons == 0 {
            1.0
        } else {
            1.0 - (self.mismatch_count as f64 / self.total_comparisons as f64)
        };
    }

    /// Zero mismatches within the validated scope.
    pub fn passed(&self) -> bool {
        self.mismatch_count == 0
    }

    /// Development gate for iterative runs, e.g. `0.99` over a sample. Not a release gate.
    pub fn meets_pass_rate(&self, minimum: f64) -> bool {
        self.pass_rate >= minimum
    }

    /// Release gate: exhaustive scope and zero mismatches.
    pub fn certifies_release(&self) -> bool {
        self.scope.is_full() && self.passed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(identifier: CatalogId, status: FetchStatus) -> CatalogEntry {
        CatalogEntry {
            identifier,
            display_name: format!("App {identifier}"),
            raw_payload: None,
            entity_type: None,
            fetch_status: status,
            fetched_at: Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).single().unwrap(),
            error: None,
        }
    }

    #[test]
    fn corpus_rejects_duplicate_inserts() {
        let mut corpus = Corpus::new();
        assert!(corpus.insert(entry(10, FetchStatus::Failed)));
        assert!(!corpus.insert(entry(10, FetchStatus::Success)));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get(10).unwrap().fetch_status, FetchStatus::Failed);
    }

    #[test]
    fn merge_replaces_failures_but_never_an_existing_success() {
        let mut corpus = Corpus::new();
        corpus.insert(entry(1, FetchStatus::Failed));
        corpus.insert(entry(2, FetchStatus::Success));

        assert_eq!(corpus.merge_success(entry(1, FetchStatus::Success)), MergeOutcome::Replaced);
        let mut newer = entry(2, FetchStatus::Success);
        newer.display_name = "changed".into();
        assert_eq!(corpus.merge_success(newer), MergeOutcome::Unchanged);
        assert_eq!(corpus.get(2).unwrap().display_name, "App 2");
        assert_eq!(corpus.merge_success(entry(3, FetchStatus::Success)), MergeOutcome::Appended);
        assert_eq!(corpus.merge_success(entry(4, FetchStatus::Failed)), MergeOutcome::Unchanged);
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.success_identifiers(), BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn loading_collapses_duplicate_records_preferring_success() {
        let json = serde_json::to_string(&vec![
            entry(5, FetchStatus::Failed),
            entry(6, FetchStatus::Success),
            entry(5, FetchStatus::Success),
            entry(6, FetchStatus::Failed),
        ])
        .unwrap();
        let corpus: Corpus = serde_json::from_str(&json).unwrap();
        assert_eq!(corpus.len(), 2);
        assert!(corpus.get(5).unwrap().is_success());
        assert!(corpus.get(6).unwrap().is_success());
        assert_eq!(corpus.entries()[0].identifier, 5);
    }

    #[test]
    fn checkpoint_document_is_independently_loadable() {
        let mut run = CollectionRun::new(RunMetadata {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            target_count: 3,
            actual_count: 0,
            attempted_count: 2,
            success_rate: 0.0,
            rate_limit_delay_seconds: 1.5,
            checkpoint_every: 25,
            wanted_type: Some("game".into()),
            id_threshold: 2000,
            credential_fingerprint: Some("sha256:0a1b2c3d".into()),
            output_reference: "data/sample.json".into(),
            recollection_passes: 0,
            stop_reason: None,
        });
        run.entries.insert(entry(2001, FetchStatus::Success));
        run.entries.insert(entry(2002, FetchStatus::Failed));
        run.refresh_counts();

        let text = serde_json::to_string_pretty(&run).unwrap();
        let value: JsonValue = serde_json::from_str(&text).unwrap();
        let started_at = value["metadata"]["started_at"].as_str().unwrap();
        assert!(started_at.ends_with('Z') || started_at.contains("+00:00"));
        assert_eq!(value["entries"].as_array().unwrap().len(), 2);

        let loaded: CollectionRun = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.metadata.actual_count, 1);
        assert!((loaded.metadata.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn validation_report_treats_null_and_empty_as_equal() {
        let mut report = ValidationReport::new(ValidationScope::Full);
        report.record_comparison(1, "mat_ram_min", Some("8 GB"), Some("8 GB"));
        report.record_comparison(1, "mat_os_min", None, Some(""));
        report.record_comparison(2, "mat_ram_min", Some("4 GB"), None);
        report.finalize();

        assert_eq!(report.total_comparisons, 3);
        assert_eq!(report.mismatch_count, 1);
        assert_eq!(report.mismatches[0].expected, "4 GB");
        assert_eq!(report.mismatches[0].actual, "");
        assert!(!report.passed());
        assert!(!report.certifies_release());
    }

    #[test]
    fn sampled_pass_does_not_certify_release() {
        let mut report = ValidationReport::new(ValidationScope::Sample {
            fraction: 0.1,
            seed: None,
        });
        report.record_comparison(1, "mat_ram_min", Some("8 GB"), Some("8 GB"));
        report.finalize();
        assert!(report.passed());
        assert!(!report.certifies_release());
    }

    #[test]
    fn pass_rate_threshold_gates_iterative_runs_only() {
        let mut report = ValidationReport::new(ValidationScope::Full);
        for identifier in 0..200 {
            report.record_comparison(identifier, "mat_ram_min", Some("8 GB"), Some("8 GB"));
        }
        report.record_comparison(200, "mat_ram_min", Some("8 GB"), Some("4 GB"));
        report.finalize();

        assert!(report.meets_pass_rate(0.99));
        assert!(!report.meets_pass_rate(0.999));
        assert!(!report.passed());
        assert!(!report.certifies_release());
    }
}
