use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use citation_recover_core::{
    CandidateIndex, MatchResult, RecordOutcome, RecoverError, RunSummary, SourceId,
    TruncatedCitation, TRUNCATION_THRESHOLD,
};
use citation_recover_store_sqlite::{DamagedStore, ReferenceStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const RECORD_SEPARATOR: &str =
    "==================================================================================";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    /// Load the damaged tree's candidates once and match in memory.
    #[default]
    Indexed,
    /// Query the damaged tree once per reference citation.
    Sql,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub threshold: usize,
    pub matcher: MatcherKind,
    pub dry_run: bool,
    pub strict_links: bool,
    pub backup: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threshold: TRUNCATION_THRESHOLD,
            matcher: MatcherKind::default(),
            dry_run: false,
            strict_links: false,
            backup: None,
        }
    }
}

impl RunOptions {
    /// # Errors
    /// Returns [`RecoverError::Validation`] for a zero threshold.
    pub fn validate(&self) -> Result<(), RecoverError> {
        if self.threshold == 0 {
            return Err(RecoverError::Validation(
                "threshold must be at least 1 character".to_string(),
            ));
        }
        Ok(())
    }
}

/// Candidate lookup against the damaged tree, either through a preloaded
/// index or through per-citation queries.
enum Matcher {
    Indexed(CandidateIndex),
    Sql,
}

impl Matcher {
    fn load(kind: MatcherKind, damaged: &DamagedStore) -> Result<Self> {
        match kind {
            MatcherKind::Indexed => {
                let index = damaged.load_candidate_index()?;
                if index.is_empty() {
                    warn!("damaged tree has no dated fact-linked citations to match against");
                }
                debug!(
                    candidates = index.len(),
                    dates = index.date_count(),
                    "loaded damaged-tree candidate index"
                );
                Ok(Self::Indexed(index))
            }
            MatcherKind::Sql => Ok(Self::Sql),
        }
    }

    fn classify(&self, damaged: &DamagedStore, citation: &TruncatedCitation) -> Result<MatchResult> {
        match self {
            Self::Indexed(index) => {
                Ok(index.classify(&citation.page_text, citation.correlation_date))
            }
            Self::Sql => damaged.classify_match(&citation.page_text, citation.correlation_date),
        }
    }

    fn record_fix(&mut self, id: SourceId, page_text: &str) {
        if let Self::Indexed(index) = self {
            index.record_fix(id, page_text);
        }
    }
}

/// Open both trees and repair every uniquely matched truncated citation.
///
/// # Errors
/// Returns an error when the options are invalid, both paths name the same
/// file, a tree cannot be opened, the backup fails, or any stage fails.
pub fn run_paths(reference: &Path, damaged: &Path, options: &RunOptions) -> Result<RunSummary> {
    options.validate()?;
    reject_same_file(reference, damaged)?;

    let reference_store = ReferenceStore::open(reference)?;
    let mut damaged_store = DamagedStore::open(damaged)?;

    if let Some(backup) = options.backup.as_deref() {
        if options.dry_run {
            debug!(path = %backup.display(), "dry run; skipping backup");
        } else {
            damaged_store.backup_to(backup)?;
            info!(path = %backup.display(), "backed up damaged tree");
        }
    }

    run(&reference_store, &mut damaged_store, options)
}

/// Scan the reference tree, match each truncated citation against the
/// damaged tree, and apply unique matches.
///
/// Records are processed once each, in citation id order. A write that does
/// not affect exactly one row aborts the run; writes already applied stay.
///
/// # Errors
/// Returns an error when a query fails or a repair write is anomalous.
pub fn run(
    reference: &ReferenceStore,
    damaged: &mut DamagedStore,
    options: &RunOptions,
) -> Result<RunSummary> {
    options.validate()?;

    info!(count = reference.person_count()?, "total count of person records");
    info!(count = reference.source_count()?, "total count of citation records");
    info!(
        count = reference.truncation_suspect_count(options.threshold)?,
        threshold = options.threshold,
        "count of potentially truncated citations"
    );

    let citations = reference.scan_truncated(options.threshold)?;
    let mut matcher = Matcher::load(options.matcher, damaged)?;
    let mut summary = RunSummary::default();

    for citation in &citations {
        let outcome = reconcile_citation(citation, &mut matcher, damaged, options)?;
        summary.record(citation.id, outcome);
    }

    info!(
        scanned = summary.scanned,
        updated = summary.updated,
        would_update = summary.would_update,
        unmatched = summary.unmatched,
        ambiguous = summary.ambiguous,
        link_integrity = summary.link_integrity,
        skipped = summary.skipped(),
        "reconciliation finished"
    );
    Ok(summary)
}

fn reconcile_citation(
    citation: &TruncatedCitation,
    matcher: &mut Matcher,
    damaged: &mut DamagedStore,
    options: &RunOptions,
) -> Result<RecordOutcome> {
    info!("{RECORD_SEPARATOR}");
    debug!(
        id = %citation.id,
        length = citation.length,
        date = citation.correlation_date,
        "reference citation"
    );
    debug!("       {}", citation.display_text());

    if options.strict_links && !citation.has_single_fact_link() {
        warn!(
            ref_id = %citation.id,
            linked_facts = citation.linked_fact_count,
            "correlation date is ambiguous: citation links to several facts"
        );
        return Ok(RecordOutcome::LinkIntegrity { linked_facts: citation.linked_fact_count });
    }

    let result = matcher.classify(damaged, citation)?;
    debug!(
        ref_id = %citation.id,
        candidates = result.candidate_count(),
        "classified reference citation"
    );
    let outcome = RecordOutcome::from_match(result, options.dry_run);
    match outcome {
        RecordOutcome::NoMatch => {
            warn!(ref_id = %citation.id, matches = 0, "could not find any matches");
            info!("        {}", citation.display_text());
        }
        RecordOutcome::Ambiguous { count } => {
            warn!(ref_id = %citation.id, matches = count, "found multiple matches");
            info!("        {}", citation.display_text());
        }
        RecordOutcome::WouldUpdate { candidate_id } => {
            info!(truncated_id = %candidate_id, ref_id = %citation.id, "dry run; would update truncated source");
            info!("        {}", citation.display_text());
        }
        RecordOutcome::Updated { candidate_id } => {
            info!(truncated_id = %candidate_id, ref_id = %citation.id, "updating truncated source with reference text");
            if let Some(current) = damaged.page_text(candidate_id)? {
                debug!("  was: {}", citation_recover_core::normalize_page_text(&current));
            }
            info!("        {}", citation.display_text());
            let rows = damaged.apply_fix(candidate_id, &citation.page_text)?;
            info!(rows, "updated row count");
            matcher.record_fix(candidate_id, &citation.page_text);
        }
        RecordOutcome::LinkIntegrity { .. } => {}
    }
    Ok(outcome)
}

fn reject_same_file(reference: &Path, damaged: &Path) -> Result<()> {
    if let (Ok(lhs), Ok(rhs)) = (fs::canonicalize(reference), fs::canonicalize(damaged)) {
        if lhs == rhs {
            return Err(RecoverError::Validation(format!(
                "reference and damaged trees are the same file: {}",
                lhs.display()
            )))
            .context("refusing to repair a tree from itself");
        }
    }
    Ok(())
}
