use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Page-number texts at or beyond this many characters are suspected of
/// having been cut off during migration.
pub const TRUNCATION_THRESHOLD: usize = 250;

/// `sourcelink.linktableid` value that ties a citation to the fact used for
/// date correlation.
pub const FACT_LINK_KIND: i64 = 2;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecoverError {
    #[error("update of source {source_id} affected {rows} rows; expected exactly 1")]
    UnexpectedRowCount { source_id: SourceId, rows: usize },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-line rendering of a page-number text for log output.
///
/// Every line feed and carriage return becomes one space, so `"\r\n"`
/// renders as two spaces.
#[must_use]
pub fn normalize_page_text(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

/// `true` when `prefix` starts `text` at position 0 and is not equal to it.
///
/// Compared byte-wise, as `instr` and `!=` do on `SQLite` text, so a prefix
/// cut in the middle of a multi-byte character still qualifies.
#[must_use]
pub fn is_proper_prefix(prefix: &[u8], text: &[u8]) -> bool {
    prefix.len() < text.len() && text.starts_with(prefix)
}

/// A reference-dataset citation whose page-number text is long enough to
/// have been truncated in the damaged copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruncatedCitation {
    pub id: SourceId,
    pub length: usize,
    /// Unmodified text; used for matching and for the repair write.
    pub page_text: String,
    pub correlation_date: i64,
    /// Number of fact links of [`FACT_LINK_KIND`] the date was aggregated over.
    pub linked_fact_count: usize,
}

impl TruncatedCitation {
    #[must_use]
    pub fn display_text(&self) -> String {
        normalize_page_text(&self.page_text)
    }

    /// `false` when the correlation date was picked as a maximum over
    /// several linked facts.
    #[must_use]
    pub fn has_single_fact_link(&self) -> bool {
        self.linked_fact_count <= 1
    }
}

/// One damaged-dataset citation joined to one fact of [`FACT_LINK_KIND`].
///
/// A citation linked to several facts yields one `Candidate` per link.
/// `page_text` holds the stored bytes, which need not be valid UTF-8.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub id: SourceId,
    pub page_text: Vec<u8>,
    pub date: i64,
}

impl Candidate {
    #[must_use]
    pub fn new(id: SourceId, page_text: impl Into<Vec<u8>>, date: i64) -> Self {
        Self { id, page_text: page_text.into(), date }
    }
}

/// Whether `candidate` may be the truncated copy of a reference citation
/// with the given text and correlation date.
#[must_use]
pub fn is_candidate(reference_text: &str, correlation_date: i64, candidate: &Candidate) -> bool {
    candidate.date == correlation_date
        && is_proper_prefix(&candidate.page_text, reference_text.as_bytes())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchResult {
    NoMatch,
    UniqueMatch { candidate_id: SourceId },
    Ambiguous { count: usize },
}

impl MatchResult {
    /// Classify a set of qualifying citation ids. Duplicate ids count once.
    #[must_use]
    pub fn from_candidate_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = SourceId>,
    {
        let distinct = ids.into_iter().collect::<BTreeSet<_>>();
        let mut iter = distinct.iter();
        match (iter.next(), distinct.len()) {
            (None, _) => Self::NoMatch,
            (Some(id), 1) => Self::UniqueMatch { candidate_id: *id },
            (Some(_), count) => Self::Ambiguous { count },
        }
    }

    #[must_use]
    pub fn candidate_id(self) -> Option<SourceId> {
        match self {
            Self::UniqueMatch { candidate_id } => Some(candidate_id),
            Self::NoMatch | Self::Ambiguous { .. } => None,
        }
    }

    #[must_use]
    pub fn candidate_count(self) -> usize {
        match self {
            Self::NoMatch => 0,
            Self::UniqueMatch { .. } => 1,
            Self::Ambiguous { count } => count,
        }
    }
}

/// Damaged-dataset candidates materialized once and keyed by fact date, so
/// matching a reference citation touches only candidates sharing its date.
#[derive(Debug, Clone, Default)]
pub struct CandidateIndex {
    by_date: BTreeMap<i64, Vec<Candidate>>,
    len: usize,
}

impl CandidateIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, candidate: Candidate) {
        self.by_date.entry(candidate.date).or_default().push(candidate);
        self.len += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn date_count(&self) -> usize {
        self.by_date.len()
    }

    #[must_use]
    pub fn matching_ids(&self, reference_text: &str, correlation_date: i64) -> BTreeSet<SourceId> {
        self.by_date
            .get(&correlation_date)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter(|candidate| is_candidate(reference_text, correlation_date, candidate))
                    .map(|candidate| candidate.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn classify(&self, reference_text: &str, correlation_date: i64) -> MatchResult {
        MatchResult::from_candidate_ids(self.matching_ids(reference_text, correlation_date))
    }

    /// The single qualifying candidate, or `None` when zero or several qualify.
    #[must_use]
    pub fn find_candidate_id(&self, reference_text: &str, correlation_date: i64) -> Option<SourceId> {
        self.classify(reference_text, correlation_date).candidate_id()
    }

    /// Mirror a repair write so later lookups see the new text. Returns the
    /// number of index entries touched.
    pub fn record_fix(&mut self, id: SourceId, page_text: &str) -> usize {
        let mut touched = 0;
        for candidate in self.by_date.values_mut().flatten().filter(|candidate| candidate.id == id) {
            candidate.page_text = page_text.as_bytes().to_vec();
            touched += 1;
        }
        touched
    }
}

impl FromIterator<Candidate> for CandidateIndex {
    fn from_iter<T: IntoIterator<Item = Candidate>>(iter: T) -> Self {
        let mut index = Self::new();
        for candidate in iter {
            index.insert(candidate);
        }
        index
    }
}

/// Terminal state of one reference citation after a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Updated { candidate_id: SourceId },
    WouldUpdate { candidate_id: SourceId },
    NoMatch,
    Ambiguous { count: usize },
    LinkIntegrity { linked_facts: usize },
}

impl RecordOutcome {
    /// Outcome for a classified citation that passed the link check.
    #[must_use]
    pub fn from_match(result: MatchResult, dry_run: bool) -> Self {
        match result {
            MatchResult::NoMatch => Self::NoMatch,
            MatchResult::Ambiguous { count } => Self::Ambiguous { count },
            MatchResult::UniqueMatch { candidate_id } if dry_run => {
                Self::WouldUpdate { candidate_id }
            }
            MatchResult::UniqueMatch { candidate_id } => Self::Updated { candidate_id },
        }
    }

    /// `false` when the damaged copy was left untouched and needs manual
    /// follow-up.
    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Updated { .. } | Self::WouldUpdate { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnresolvedCitation {
    pub source_id: SourceId,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub scanned: usize,
    pub updated: usize,
    pub would_update: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    pub link_integrity: usize,
    pub unresolved: Vec<UnresolvedCitation>,
}

impl RunSummary {
    pub fn record(&mut self, source_id: SourceId, outcome: RecordOutcome) {
        self.scanned += 1;
        match outcome {
            RecordOutcome::Updated { .. } => self.updated += 1,
            RecordOutcome::WouldUpdate { .. } => self.would_update += 1,
            RecordOutcome::NoMatch => self.unmatched += 1,
            RecordOutcome::Ambiguous { .. } => self.ambiguous += 1,
            RecordOutcome::LinkIntegrity { .. } => self.link_integrity += 1,
        }
        if !outcome.is_resolved() {
            self.unresolved.push(UnresolvedCitation { source_id, outcome });
        }
    }

    /// Citations left untouched for manual follow-up.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.unmatched + self.ambiguous + self.link_integrity
    }
}
