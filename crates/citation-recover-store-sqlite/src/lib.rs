use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use citation_recover_core::{
    Candidate, CandidateIndex, MatchResult, RecoverError, SourceId, TruncatedCitation,
    FACT_LINK_KIND,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension};
use tracing::{debug, warn};

const REQUIRED_TABLES: [(&str, &[&str]); 4] = [
    ("person", &[]),
    ("source", &["id", "pagenumber"]),
    ("sourcelink", &["sourceid", "linkid", "linktableid"]),
    ("fact", &["id", "date"]),
];

const SCAN_TRUNCATED_SQL: &str = r"
SELECT
  s.id,
  length(s.pagenumber) AS len,
  s.pagenumber,
  mf.date,
  mf.links
FROM
  source s JOIN
  (
    SELECT
      sl.sourceid AS sourceid,
      MAX(COALESCE(f.date, 0)) AS date,
      COUNT(*) AS links
    FROM
      sourcelink sl JOIN
      fact f ON (f.id = sl.linkid AND sl.linktableid = ?2)
    GROUP BY
      sl.sourceid
  ) mf ON (mf.sourceid = s.id)
WHERE
  length(s.pagenumber) >= ?1
ORDER BY s.id ASC
";

const CANDIDATE_COUNT_SQL: &str = r"
SELECT
  COUNT(DISTINCT s.id)
FROM
  source s JOIN
  sourcelink sl ON (sl.sourceid = s.id) JOIN
  fact f ON (f.id = sl.linkid AND sl.linktableid = ?3)
WHERE
  instr(?1, s.pagenumber) = 1 AND
  s.pagenumber != ?1 AND
  f.date = ?2
";

const CANDIDATE_IDS_SQL: &str = r"
SELECT DISTINCT
  s.id
FROM
  source s JOIN
  sourcelink sl ON (sl.sourceid = s.id) JOIN
  fact f ON (f.id = sl.linkid AND sl.linktableid = ?3)
WHERE
  instr(?1, s.pagenumber) = 1 AND
  s.pagenumber != ?1 AND
  f.date = ?2
ORDER BY s.id ASC
";

const LOAD_CANDIDATES_SQL: &str = r"
SELECT
  s.id,
  s.pagenumber,
  f.date
FROM
  source s JOIN
  sourcelink sl ON (sl.sourceid = s.id) JOIN
  fact f ON (f.id = sl.linkid AND sl.linktableid = ?1)
WHERE
  s.pagenumber IS NOT NULL AND
  f.date IS NOT NULL
ORDER BY s.id ASC
";

/// Read-only handle on the trusted reference tree.
pub struct ReferenceStore {
    conn: Connection,
}

/// Read/write handle on the tree being repaired. The only writer in a run.
pub struct DamagedStore {
    conn: Connection,
}

impl ReferenceStore {
    /// Open an existing tree file read-only and check it has the tables the
    /// scan needs.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or lacks a required table or column.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open reference tree at {}", path.display()))?;
        verify_schema(&conn)
            .with_context(|| format!("reference tree {} is not usable", path.display()))?;
        debug!(path = %path.display(), "opened reference tree read-only");
        Ok(Self { conn })
    }

    /// Wrap an already-open connection after checking its schema.
    ///
    /// # Errors
    /// Returns an error when a required table or column is missing.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        verify_schema(&conn)?;
        Ok(Self { conn })
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn person_count(&self) -> Result<usize> {
        count(&self.conn, "SELECT COUNT(*) FROM person", [])
            .context("failed to count person records")
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn source_count(&self) -> Result<usize> {
        count(&self.conn, "SELECT COUNT(*) FROM source", [])
            .context("failed to count source records")
    }

    /// Number of citations long enough to be suspected of truncation,
    /// whether or not they carry a fact link.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn truncation_suspect_count(&self, threshold: usize) -> Result<usize> {
        count(
            &self.conn,
            "SELECT COUNT(*) FROM source WHERE length(pagenumber) >= ?1",
            params![to_sql_int(threshold)?],
        )
        .context("failed to count potentially truncated citations")
    }

    /// Every citation at or above `threshold` characters that has at least
    /// one fact link, with its correlation date.
    ///
    /// The date is the maximum linked fact date, absent dates counting as 0.
    /// Each call re-reads the tree.
    ///
    /// # Errors
    /// Returns an error when the scan query fails or a row cannot be decoded.
    pub fn scan_truncated(&self, threshold: usize) -> Result<Vec<TruncatedCitation>> {
        let mut stmt =
            self.conn.prepare(SCAN_TRUNCATED_SQL).context("failed to prepare truncation scan")?;
        let rows = stmt
            .query_map(params![to_sql_int(threshold)?, FACT_LINK_KIND], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("failed to run truncation scan")?;

        let mut citations = Vec::new();
        for row in rows {
            let (id, length, page_text, correlation_date, links) =
                row.context("failed to decode truncation scan row")?;
            citations.push(TruncatedCitation {
                id: SourceId(id),
                length: from_sql_int(length, "length")?,
                page_text,
                correlation_date,
                linked_fact_count: from_sql_int(links, "link count")?,
            });
        }
        Ok(citations)
    }
}

impl DamagedStore {
    /// Open an existing tree file for reading and in-place repair. The file
    /// is never created.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or lacks a required table or column.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open damaged tree at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .context("failed to configure sqlite busy timeout")?;
        verify_schema(&conn)
            .with_context(|| format!("damaged tree {} is not usable", path.display()))?;
        debug!(path = %path.display(), "opened damaged tree read-write");
        Ok(Self { conn })
    }

    /// Wrap an already-open connection after checking its schema.
    ///
    /// # Errors
    /// Returns an error when a required table or column is missing.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        verify_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Load every (citation, linked fact date) pair into memory for
    /// date-keyed matching.
    ///
    /// Page texts are kept as stored bytes, so cells that are not valid UTF-8
    /// compare the way the candidate queries compare them. Real-valued cells
    /// have no stable text form and are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error when the load query fails or a row cannot be decoded.
    pub fn load_candidate_index(&self) -> Result<CandidateIndex> {
        let mut stmt =
            self.conn.prepare(LOAD_CANDIDATES_SQL).context("failed to prepare candidate load")?;
        let rows = stmt
            .query_map(params![FACT_LINK_KIND], |row| {
                let page_text = match row.get_ref(1)? {
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(bytes.to_vec()),
                    ValueRef::Integer(value) => Some(value.to_string().into_bytes()),
                    ValueRef::Real(_) | ValueRef::Null => None,
                };
                Ok((SourceId(row.get(0)?), page_text, row.get::<_, i64>(2)?))
            })
            .context("failed to load candidate citations")?;

        let mut index = CandidateIndex::new();
        for row in rows {
            match row.context("failed to decode candidate row")? {
                (id, Some(page_text), date) => index.insert(Candidate::new(id, page_text, date)),
                (id, None, _) => {
                    warn!(source_id = %id, "skipping candidate whose page number is not text");
                }
            }
        }
        Ok(index)
    }

    /// Number of distinct citations that are a proper prefix of
    /// `reference_text` and link to a fact dated `correlation_date`.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_candidates(&self, reference_text: &str, correlation_date: i64) -> Result<usize> {
        count(
            &self.conn,
            CANDIDATE_COUNT_SQL,
            params![reference_text, correlation_date, FACT_LINK_KIND],
        )
        .context("failed to count candidate citations")
    }

    /// Ids of the citations [`Self::count_candidates`] counts, ascending.
    ///
    /// # Errors
    /// Returns an error when the id query fails.
    pub fn find_candidate_ids(
        &self,
        reference_text: &str,
        correlation_date: i64,
    ) -> Result<Vec<SourceId>> {
        let mut stmt =
            self.conn.prepare(CANDIDATE_IDS_SQL).context("failed to prepare candidate id query")?;
        let rows = stmt
            .query_map(params![reference_text, correlation_date, FACT_LINK_KIND], |row| {
                row.get::<_, i64>(0).map(SourceId)
            })
            .context("failed to query candidate ids")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to decode candidate id")
    }

    /// # Errors
    /// Returns an error when a candidate query fails.
    pub fn classify_match(&self, reference_text: &str, correlation_date: i64) -> Result<MatchResult> {
        match self.count_candidates(reference_text, correlation_date)? {
            0 => Ok(MatchResult::NoMatch),
            1 => {
                let ids = self.find_candidate_ids(reference_text, correlation_date)?;
                Ok(MatchResult::from_candidate_ids(ids))
            }
            count => Ok(MatchResult::Ambiguous { count }),
        }
    }

    /// The single qualifying citation, or `None` when zero or several qualify.
    ///
    /// # Errors
    /// Returns an error when the id query fails.
    pub fn find_candidate_id(
        &self,
        reference_text: &str,
        correlation_date: i64,
    ) -> Result<Option<SourceId>> {
        let ids = self.find_candidate_ids(reference_text, correlation_date)?;
        Ok(MatchResult::from_candidate_ids(ids).candidate_id())
    }

    /// Current page text of a citation for display. Bytes that are not valid
    /// UTF-8 are replaced.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn page_text(&self, id: SourceId) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT pagenumber FROM source WHERE id = ?1", params![id.0], |row| {
                Ok(match row.get_ref(0)? {
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                        Some(String::from_utf8_lossy(bytes).into_owned())
                    }
                    ValueRef::Integer(value) => Some(value.to_string()),
                    ValueRef::Real(value) => Some(value.to_string()),
                    ValueRef::Null => None,
                })
            })
            .optional()
            .map(Option::flatten)
            .with_context(|| format!("failed to read page text of source {id}"))
    }

    /// Overwrite one citation's page text in its own transaction.
    ///
    /// Anything other than exactly one affected row is rolled back.
    ///
    /// # Errors
    /// Returns [`RecoverError::UnexpectedRowCount`] when the update does not hit
    /// exactly one row, or an error when the transaction fails.
    pub fn apply_fix(&mut self, candidate_id: SourceId, full_page_text: &str) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start repair transaction")?;
        let rows = tx
            .execute(
                "UPDATE source SET pagenumber = ?1 WHERE id = ?2",
                params![full_page_text, candidate_id.0],
            )
            .with_context(|| format!("failed to update source {candidate_id}"))?;

        if rows != 1 {
            tx.rollback().context("failed to roll back repair transaction")?;
            return Err(RecoverError::UnexpectedRowCount { source_id: candidate_id, rows }.into());
        }

        tx.commit().context("failed to commit repair transaction")?;
        Ok(rows)
    }

    /// Copy the whole tree to `out_file` with the `SQLite` online backup API.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_to(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

fn verify_schema(conn: &Connection) -> Result<()> {
    for (table, columns) in REQUIRED_TABLES {
        if !table_exists(conn, table)? {
            return Err(anyhow!("required table `{table}` is missing"));
        }
        for column in columns {
            if !table_has_column(conn, table, column)? {
                return Err(anyhow!("required column `{table}.{column}` is missing"));
            }
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }

    Ok(false)
}

fn count<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<usize> {
    let value = conn.query_row(sql, params, |row| row.get::<_, i64>(0))?;
    from_sql_int(value, "count")
}

fn to_sql_int(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} does not fit a sqlite integer"))
}

fn from_sql_int(value: i64, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("sqlite returned negative {what}: {value}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use citation_recover_core::{normalize_page_text, TRUNCATION_THRESHOLD};

    const FTM_SCHEMA_SQL: &str = r"
CREATE TABLE person (id INTEGER PRIMARY KEY, sex INTEGER);
CREATE TABLE source (id INTEGER PRIMARY KEY, pagenumber TEXT);
CREATE TABLE sourcelink (id INTEGER PRIMARY KEY, sourceid INTEGER, linkid INTEGER, linktableid INTEGER);
CREATE TABLE fact (id INTEGER PRIMARY KEY, date INTEGER);
";

    const REF_DATE: i64 = 20_200_101;

    fn long_text() -> String {
        "a".repeat(260)
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        dir
    }

    fn tree() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(FTM_SCHEMA_SQL)?;
        Ok(conn)
    }

    fn insert_source(conn: &Connection, id: i64, page_text: &str) -> Result<()> {
        conn.execute("INSERT INTO source(id, pagenumber) VALUES (?1, ?2)", params![id, page_text])?;
        Ok(())
    }

    fn insert_raw_source(conn: &Connection, id: i64, page_bytes: &[u8], date: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO source(id, pagenumber) VALUES (?1, CAST(?2 AS TEXT))",
            params![id, page_bytes],
        )?;
        insert_fact(conn, 1000 + id, Some(date))?;
        link(conn, id, 1000 + id, FACT_LINK_KIND)
    }

    fn insert_fact(conn: &Connection, id: i64, date: Option<i64>) -> Result<()> {
        conn.execute("INSERT INTO fact(id, date) VALUES (?1, ?2)", params![id, date])?;
        Ok(())
    }

    fn link(conn: &Connection, source_id: i64, fact_id: i64, kind: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO sourcelink(sourceid, linkid, linktableid) VALUES (?1, ?2, ?3)",
            params![source_id, fact_id, kind],
        )?;
        Ok(())
    }

    fn dated_source(conn: &Connection, id: i64, page_text: &str, date: i64) -> Result<()> {
        insert_source(conn, id, page_text)?;
        insert_fact(conn, 1000 + id, Some(date))?;
        link(conn, id, 1000 + id, FACT_LINK_KIND)
    }

    fn reference_with_scenario_citation() -> Result<ReferenceStore> {
        let conn = tree()?;
        conn.execute("INSERT INTO person(id, sex) VALUES (1, 0), (2, 1)", [])?;
        dated_source(&conn, 10, &long_text(), REF_DATE)?;
        ReferenceStore::from_connection(conn)
    }

    fn assert_matchers_agree(store: &DamagedStore, text: &str, date: i64) -> Result<MatchResult> {
        let sql = store.classify_match(text, date)?;
        let indexed = store.load_candidate_index()?.classify(text, date);
        assert_eq!(sql, indexed, "sql and indexed matchers disagree");
        Ok(sql)
    }

    #[test]
    fn scan_selects_suspects_with_max_linked_date() -> Result<()> {
        let conn = tree()?;
        dated_source(&conn, 1, &"b".repeat(249), REF_DATE)?;
        dated_source(&conn, 2, &"c".repeat(250), REF_DATE)?;

        insert_source(&conn, 3, &"d".repeat(300))?;
        insert_fact(&conn, 31, Some(19_990_101))?;
        insert_fact(&conn, 32, Some(20_010_101))?;
        insert_fact(&conn, 33, Some(20_990_101))?;
        link(&conn, 3, 31, FACT_LINK_KIND)?;
        link(&conn, 3, 32, FACT_LINK_KIND)?;
        link(&conn, 3, 33, 5)?;

        insert_source(&conn, 4, &"e".repeat(280))?;
        insert_fact(&conn, 41, None)?;
        link(&conn, 4, 41, FACT_LINK_KIND)?;

        insert_source(&conn, 5, &"f".repeat(280))?;

        let store = ReferenceStore::from_connection(conn)?;
        let scanned = store.scan_truncated(TRUNCATION_THRESHOLD)?;
        let summary = scanned
            .iter()
            .map(|c| (c.id.0, c.length, c.correlation_date, c.linked_fact_count))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![(2, 250, REF_DATE, 1), (3, 300, 20_010_101, 2), (4, 280, 0, 1)]);

        assert_eq!(store.truncation_suspect_count(TRUNCATION_THRESHOLD)?, 4);
        assert_eq!(store.source_count()?, 5);
        Ok(())
    }

    #[test]
    fn scan_keeps_line_breaks_in_page_text() -> Result<()> {
        let conn = tree()?;
        let text = format!("{}\r\n{}", "g".repeat(200), "h".repeat(60));
        dated_source(&conn, 1, &text, REF_DATE)?;
        let store = ReferenceStore::from_connection(conn)?;

        let scanned = store.scan_truncated(TRUNCATION_THRESHOLD)?;
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].page_text, text);
        assert!(!scanned[0].display_text().contains('\n'));
        Ok(())
    }

    #[test]
    fn scan_measures_length_in_characters() -> Result<()> {
        let conn = tree()?;
        dated_source(&conn, 1, &"é".repeat(249), REF_DATE)?;
        dated_source(&conn, 2, &"é".repeat(250), REF_DATE)?;
        let store = ReferenceStore::from_connection(conn)?;

        let scanned = store.scan_truncated(TRUNCATION_THRESHOLD)?;
        let ids = scanned.iter().map(|c| (c.id.0, c.length)).collect::<Vec<_>>();
        assert_eq!(ids, vec![(2, 250)]);
        Ok(())
    }

    #[test]
    fn undecodable_unrelated_row_does_not_break_matching() -> Result<()> {
        let text = long_text();
        let conn = tree()?;
        dated_source(&conn, 77, &text[..200], REF_DATE)?;
        insert_raw_source(&conn, 88, &[0xFF, b'a'], 19_990_101)?;
        let damaged = DamagedStore::from_connection(conn)?;

        assert_eq!(damaged.load_candidate_index()?.len(), 2);
        assert_eq!(
            assert_matchers_agree(&damaged, &text, REF_DATE)?,
            MatchResult::UniqueMatch { candidate_id: SourceId(77) }
        );
        assert_eq!(damaged.page_text(SourceId(88))?.as_deref(), Some("\u{FFFD}a"));
        Ok(())
    }

    #[test]
    fn prefix_cut_inside_a_character_is_repaired() -> Result<()> {
        let text = "é".repeat(130);
        let conn = tree()?;
        insert_raw_source(&conn, 77, &text.as_bytes()[..201], REF_DATE)?;
        let mut damaged = DamagedStore::from_connection(conn)?;

        assert_eq!(
            assert_matchers_agree(&damaged, &text, REF_DATE)?,
            MatchResult::UniqueMatch { candidate_id: SourceId(77) }
        );
        assert_eq!(damaged.apply_fix(SourceId(77), &text)?, 1);
        assert_eq!(damaged.page_text(SourceId(77))?, Some(text));
        Ok(())
    }

    #[test]
    fn line_break_prefix_is_matched_and_repaired_verbatim() -> Result<()> {
        let text = format!("{}\r\n{}", "g".repeat(200), "h".repeat(60));
        let conn = tree()?;
        dated_source(&conn, 77, &text[..210], REF_DATE)?;
        dated_source(&conn, 78, &normalize_page_text(&text[..210]), 19_990_101)?;
        let mut damaged = DamagedStore::from_connection(conn)?;

        assert_eq!(
            assert_matchers_agree(&damaged, &text, REF_DATE)?,
            MatchResult::UniqueMatch { candidate_id: SourceId(77) }
        );
        assert_eq!(
            assert_matchers_agree(&damaged, &text, 19_990_101)?,
            MatchResult::NoMatch,
            "space-normalized copy must not match the original text"
        );

        assert_eq!(damaged.apply_fix(SourceId(77), &text)?, 1);
        let repaired = damaged.page_text(SourceId(77))?.unwrap_or_default();
        assert_eq!(repaired, text);
        assert!(repaired.contains("\r\n"));
        Ok(())
    }

    #[test]
    fn unique_prefix_on_same_date_is_repaired() -> Result<()> {
        let reference = reference_with_scenario_citation()?;
        assert_eq!(reference.person_count()?, 2);
        let citation = reference
            .scan_truncated(TRUNCATION_THRESHOLD)?
            .pop()
            .ok_or_else(|| anyhow!("scan returned nothing"))?;

        let conn = tree()?;
        dated_source(&conn, 77, &citation.page_text[..200], REF_DATE)?;
        dated_source(&conn, 78, "unrelated citation", REF_DATE)?;
        let mut damaged = DamagedStore::from_connection(conn)?;

        let result = assert_matchers_agree(&damaged, &citation.page_text, citation.correlation_date)?;
        assert_eq!(result, MatchResult::UniqueMatch { candidate_id: SourceId(77) });
        assert_eq!(
            damaged.find_candidate_id(&citation.page_text, citation.correlation_date)?,
            Some(SourceId(77))
        );

        assert_eq!(damaged.apply_fix(SourceId(77), &citation.page_text)?, 1);
        assert_eq!(damaged.page_text(SourceId(77))?, Some(citation.page_text.clone()));
        assert_eq!(damaged.page_text(SourceId(78))?.as_deref(), Some("unrelated citation"));

        let after = assert_matchers_agree(&damaged, &citation.page_text, citation.correlation_date)?;
        assert_eq!(after, MatchResult::NoMatch);
        Ok(())
    }

    #[test]
    fn two_prefixes_on_same_date_are_ambiguous() -> Result<()> {
        let text = long_text();
        let conn = tree()?;
        dated_source(&conn, 77, &text[..200], REF_DATE)?;
        dated_source(&conn, 78, &text[..200], REF_DATE)?;
        let damaged = DamagedStore::from_connection(conn)?;

        let result = assert_matchers_agree(&damaged, &text, REF_DATE)?;
        assert_eq!(result, MatchResult::Ambiguous { count: 2 });
        assert_eq!(damaged.find_candidate_id(&text, REF_DATE)?, None);
        Ok(())
    }

    #[test]
    fn date_mismatch_is_no_match() -> Result<()> {
        let text = long_text();
        let conn = tree()?;
        dated_source(&conn, 77, &text[..200], 20_200_102)?;
        let damaged = DamagedStore::from_connection(conn)?;

        assert_eq!(assert_matchers_agree(&damaged, &text, REF_DATE)?, MatchResult::NoMatch);
        Ok(())
    }

    #[test]
    fn unanchored_and_equal_texts_never_match() -> Result<()> {
        let text = format!("{}{}", "x".repeat(130), "y".repeat(130));
        let conn = tree()?;
        dated_source(&conn, 1, &text[10..200], REF_DATE)?;
        dated_source(&conn, 2, &text[130..], REF_DATE)?;
        dated_source(&conn, 3, &text, REF_DATE)?;
        let damaged = DamagedStore::from_connection(conn)?;

        assert_eq!(assert_matchers_agree(&damaged, &text, REF_DATE)?, MatchResult::NoMatch);
        assert_eq!(damaged.count_candidates(&text, REF_DATE)?, 0);
        Ok(())
    }

    #[test]
    fn citation_with_two_same_date_links_counts_once() -> Result<()> {
        let text = long_text();
        let conn = tree()?;
        dated_source(&conn, 77, &text[..200], REF_DATE)?;
        insert_fact(&conn, 5000, Some(REF_DATE))?;
        link(&conn, 77, 5000, FACT_LINK_KIND)?;
        let damaged = DamagedStore::from_connection(conn)?;

        assert_eq!(damaged.count_candidates(&text, REF_DATE)?, 1);
        assert_eq!(
            assert_matchers_agree(&damaged, &text, REF_DATE)?,
            MatchResult::UniqueMatch { candidate_id: SourceId(77) }
        );
        Ok(())
    }

    #[test]
    fn fix_of_missing_row_is_rejected() -> Result<()> {
        let conn = tree()?;
        insert_source(&conn, 1, "short")?;
        let mut damaged = DamagedStore::from_connection(conn)?;

        let err = match damaged.apply_fix(SourceId(99), "replacement") {
            Ok(rows) => panic!("expected row-count error, got {rows} rows"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<RecoverError>(),
            Some(&RecoverError::UnexpectedRowCount { source_id: SourceId(99), rows: 0 })
        );
        assert_eq!(damaged.page_text(SourceId(1))?.as_deref(), Some("short"));
        Ok(())
    }

    #[test]
    fn missing_table_is_reported() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE source (id INTEGER PRIMARY KEY, pagenumber TEXT);")?;
        let err = match DamagedStore::from_connection(conn) {
            Ok(_) => panic!("schema check should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("person"), "unexpected error: {err}");
        Ok(())
    }

    #[test]
    fn open_does_not_create_missing_files() {
        let dir = unique_temp_dir("citation-recover-store-missing");
        let path = dir.join("absent.ftm");
        assert!(ReferenceStore::open(&path).is_err());
        assert!(DamagedStore::open(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn reference_tree_opens_read_only() -> Result<()> {
        let dir = unique_temp_dir("citation-recover-store-readonly");
        let path = dir.join("reference.ftm");
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(FTM_SCHEMA_SQL)?;
        }

        let store = ReferenceStore::open(&path)?;
        let write = store.conn.execute("INSERT INTO person(id, sex) VALUES (1, 0)", []);
        assert!(write.is_err(), "reference tree accepted a write");
        Ok(())
    }

    #[test]
    fn backup_copies_damaged_tree() -> Result<()> {
        let dir = unique_temp_dir("citation-recover-store-backup");
        let path = dir.join("damaged.ftm");
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(FTM_SCHEMA_SQL)?;
            dated_source(&conn, 5, "truncated", REF_DATE)?;
        }

        let damaged = DamagedStore::open(&path)?;
        let backup_path = dir.join("backups/damaged.before.ftm");
        damaged.backup_to(&backup_path)?;

        let copy = DamagedStore::open(&backup_path)?;
        assert_eq!(copy.page_text(SourceId(5))?.as_deref(), Some("truncated"));
        Ok(())
    }
}
