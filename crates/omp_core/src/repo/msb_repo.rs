//! Science program and MSB store.
//!
//! # Responsibility
//! - Store science programs behind an optimistic version token.
//! - Keep the relational MSB index (`msbs`, `observations`, `msbs_fts`) in
//!   step with the stored document.
//! - Translate [`MsbQuery`] expressions into SQL and return ranked summaries.
//! - Apply MSB transitions inside one immediate write transaction.
//!
//! # Invariants
//! - Every mutating call runs in a `BEGIN IMMEDIATE` transaction; any error
//!   drops the transaction, which rolls it back.
//! - Within a transition the history row is written before the program and
//!   its index.
//! - A store appends a `stored` history row per MSB, and a transition appends
//!   a `removed`/`restored` row per OR sibling it touches, in the same
//!   transaction as the document write.
//! - An undo with no unreverted `done` since the last store leaves the
//!   program untouched.
//! - Transitions never change the version token; only a store does.
//! - The version token is strictly increasing per project.

use crate::clock::now_epoch_ms;
use crate::config::OmpConfig;
use crate::model::comment::{Comment, CommentError, MsbStatus};
use crate::model::msb::{Msb, MsbError, Observation};
use crate::model::program::{ScienceProgram, TransitionEffect};
use crate::model::range::Range;
use crate::payload::{decode_submission, encode_for_storage, is_gzip};
use crate::query::expr::{Expr, Field};
use crate::query::{MaxResults, MsbQuery};
use crate::repo::done_repo::{find_undo_target, insert_history, MsbSnapshot, NewHistoryEntry};
use crate::repo::{
    bool_to_int, ensure_connection_ready, int_to_bool, normalize_project_id, RepoError,
    RepoResult,
};
use crate::search::fts::{build_match_expression, combine_any, map_query_error};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Optimistic concurrency token: epoch milliseconds of the last store.
pub type ProgramVersion = i64;

const SUMMARY_COLUMNS: &str = "
    m.id,
    m.project_id,
    m.checksum,
    m.title,
    m.priority,
    m.estimated_duration,
    m.remaining,
    m.removed,
    m.suspended,
    m.or_group,
    m.tau_min,
    m.tau_max,
    m.seeing_min,
    m.seeing_max,
    m.elevation_min,
    m.elevation_max";

/// Store tunables taken from [`OmpConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsbStoreSettings {
    pub default_max_results: usize,
    pub compression_threshold_bytes: usize,
}

impl MsbStoreSettings {
    pub fn from_config(config: &OmpConfig) -> Self {
        Self {
            default_max_results: config.default_max_results,
            compression_threshold_bytes: config.compression_threshold_bytes,
        }
    }
}

impl Default for MsbStoreSettings {
    fn default() -> Self {
        Self::from_config(&OmpConfig::default())
    }
}

/// Stored program with its version token.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProgram {
    pub project_id: String,
    pub version: ProgramVersion,
    /// Uncompressed document text.
    pub xml: String,
    pub program: ScienceProgram,
}

/// A single MSB extracted from its program.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMsb {
    pub project_id: String,
    pub version: ProgramVersion,
    pub msb: Msb,
    /// `SpProg` document holding only this MSB.
    pub xml: String,
}

/// Query result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsbSummary {
    pub project_id: String,
    pub checksum: String,
    pub title: String,
    pub priority: Option<i64>,
    pub estimated_duration: Option<f64>,
    pub remaining: u32,
    pub removed: bool,
    pub suspended: Option<String>,
    pub or_group: Option<String>,
    pub tau: Range,
    pub seeing: Range,
    pub elevation: Range,
    pub instruments: Vec<String>,
    pub targets: Vec<String>,
    pub wavebands: Vec<String>,
    /// Free-text relevance; `0.0` without text predicates.
    pub relevance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsbCount {
    pub project_id: String,
    pub total: u32,
    /// MSBs with remaining > 0 that are not removed.
    pub active: u32,
}

/// MSB state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Done,
    Undo,
    Suspend { label: String },
    AllDone,
    Reject,
}

impl Transition {
    pub fn status(&self) -> MsbStatus {
        match self {
            Self::Done => MsbStatus::Done,
            Self::Undo => MsbStatus::Undone,
            Self::Suspend { .. } => MsbStatus::Suspended,
            Self::AllDone => MsbStatus::AllDone,
            Self::Reject => MsbStatus::Rejected,
        }
    }

    /// History text used when the caller supplies no reason.
    pub fn default_reason(&self) -> String {
        match self {
            Self::Done => "MSB marked as done".to_string(),
            Self::Undo => "MSB done status reverted".to_string(),
            Self::Suspend { label } => format!("MSB suspended at observation {label}"),
            Self::AllDone => "MSB marked as completed".to_string(),
            Self::Reject => "MSB rejected".to_string(),
        }
    }

    fn changes_program(&self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Transition plus the comment recorded in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub transition: Transition,
    pub comment: Comment,
}

impl TransitionRequest {
    /// Builds a request; a blank `reason` falls back to the default text.
    pub fn new(
        transition: Transition,
        author: Option<&str>,
        reason: Option<&str>,
        transaction_id: Option<&str>,
    ) -> Result<Self, CommentError> {
        let text = reason
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| transition.default_reason());
        let comment = Comment::new(text, transition.status())?
            .by(author)
            .in_transaction(transaction_id);
        Ok(Self {
            transition,
            comment,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub effect: TransitionEffect,
    pub history_id: i64,
    /// Unchanged by the transition.
    pub version: ProgramVersion,
}

pub trait MsbRepository {
    /// Looks up an MSB by checksum, optionally within one project.
    fn fetch_msb(&self, checksum: &str, project_id: Option<&str>)
        -> RepoResult<Option<FetchedMsb>>;
    /// Runs a query; results are ordered by relevance then priority.
    fn query_msbs(&self, query: &MsbQuery, max: MaxResults) -> RepoResult<Vec<MsbSummary>>;
    /// Stores a program and rebuilds its index.
    ///
    /// Unless `force` is set, `expected_version` must match the stored
    /// version (`None` only when nothing is stored yet).
    fn store_program(
        &self,
        program: &ScienceProgram,
        expected_version: Option<ProgramVersion>,
        force: bool,
    ) -> RepoResult<ProgramVersion>;
    fn fetch_program(&self, project_id: &str) -> RepoResult<StoredProgram>;
    fn program_version(&self, project_id: &str) -> RepoResult<Option<ProgramVersion>>;
    fn apply_transition(
        &self,
        project_id: &str,
        checksum: &str,
        request: &TransitionRequest,
    ) -> RepoResult<TransitionOutcome>;
    /// Per-project MSB counts, in request order.
    fn msb_counts(&self, project_ids: &[String]) -> RepoResult<Vec<MsbCount>>;
}

pub struct SqliteMsbRepository<'conn> {
    conn: &'conn Connection,
    settings: MsbStoreSettings,
}

impl<'conn> SqliteMsbRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(
            conn,
            "science_programs",
            &["project_id", "version", "compressed", "payload"],
        )?;
        ensure_connection_ready(
            conn,
            "msbs",
            &["project_id", "checksum", "remaining", "removed", "search_text"],
        )?;
        ensure_connection_ready(conn, "observations", &["msb_id", "instrument"])?;
        ensure_connection_ready(conn, "msbs_fts", &["search_text"])?;
        Ok(Self {
            conn,
            settings: MsbStoreSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: MsbStoreSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl MsbRepository for SqliteMsbRepository<'_> {
    fn fetch_msb(
        &self,
        checksum: &str,
        project_id: Option<&str>,
    ) -> RepoResult<Option<FetchedMsb>> {
        let checksum = checksum.trim();
        let project_id = project_id.map(normalize_project_id);
        let owner: Option<String> = self
            .conn
            .query_row(
                "SELECT project_id
                 FROM msbs
                 WHERE checksum = ?1 AND (?2 IS NULL OR project_id = ?2)
                 ORDER BY project_id ASC
                 LIMIT 1;",
                params![checksum, project_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(owner) = owner else {
            return Ok(None);
        };

        let Some((version, program)) = load_program(self.conn, &owner)? else {
            return Ok(None);
        };
        let Some(xml) = program.msb_document(checksum)? else {
            return Ok(None);
        };
        let Some(msb) = program.find_msb(checksum).cloned() else {
            return Ok(None);
        };
        Ok(Some(FetchedMsb {
            project_id: owner,
            version,
            msb,
            xml,
        }))
    }

    fn query_msbs(&self, query: &MsbQuery, max: MaxResults) -> RepoResult<Vec<MsbSummary>> {
        let started_at = Instant::now();
        let expr = query.to_expr();

        let mut relevance_terms = Vec::new();
        for (text, boolean) in expr.relevance_terms() {
            if let Some(expression) = build_match_expression(text, boolean)? {
                relevance_terms.push(expression);
            }
        }
        let relevance_match = combine_any(&relevance_terms);

        let mut bind_values: Vec<Value> = Vec::new();
        let mut sql = format!("SELECT {SUMMARY_COLUMNS},");
        match &relevance_match {
            Some(expression) => {
                sql.push_str(
                    " COALESCE(rel.relevance, 0.0) AS relevance
                    FROM msbs m
                    JOIN projects p ON p.project_id = m.project_id
                    LEFT JOIN (
                        SELECT rowid AS fts_rowid, -bm25(msbs_fts) AS relevance
                        FROM msbs_fts
                        WHERE msbs_fts MATCH ?
                    ) rel ON rel.fts_rowid = m.id",
                );
                bind_values.push(Value::Text(expression.clone()));
            }
            None => sql.push_str(
                " 0.0 AS relevance
                FROM msbs m
                JOIN projects p ON p.project_id = m.project_id",
            ),
        }

        let where_clause = translate_expr(&expr, &mut bind_values)?;
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
        sql.push_str(
            " ORDER BY relevance DESC, m.priority IS NULL, m.priority ASC, m.project_id ASC, m.checksum ASC",
        );

        let limit = max.resolve(self.settings.default_max_results);
        let filter_in_memory = query.tau.is_some() || query.seeing.is_some();
        if let (Some(limit), false) = (limit, filter_in_memory) {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }
        sql.push(';');

        let match_text = relevance_match.clone().unwrap_or_default();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt
            .query(params_from_iter(bind_values))
            .map_err(|err| map_query_error(err, &match_text))?;

        let mut summaries = Vec::new();
        loop {
            let row = rows.next().map_err(|err| map_query_error(err, &match_text))?;
            let Some(row) = row else { break };
            let (msb_id, summary) = parse_summary_row(row)?;
            if !query.is_feasible(&summary.tau, &summary.seeing) {
                continue;
            }
            summaries.push((msb_id, summary));
            if limit.is_some_and(|limit| summaries.len() >= limit) {
                break;
            }
        }
        drop(rows);

        let mut out = Vec::with_capacity(summaries.len());
        for (msb_id, mut summary) in summaries {
            let observed = load_observations(self.conn, msb_id)?;
            summary.instruments = observed.instruments();
            summary.targets = observed.targets();
            summary.wavebands = observed.wavebands();
            out.push(summary);
        }

        log::info!(
            "event=msb_query module=msb_repo status=ok rows={} limit={} text={} duration_ms={}",
            out.len(),
            limit.map_or_else(|| "none".to_string(), |limit| limit.to_string()),
            relevance_match.is_some(),
            started_at.elapsed().as_millis()
        );
        Ok(out)
    }

    fn store_program(
        &self,
        program: &ScienceProgram,
        expected_version: Option<ProgramVersion>,
        force: bool,
    ) -> RepoResult<ProgramVersion> {
        let started_at = Instant::now();
        let project_id = normalize_project_id(&program.project_id);
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        let project_exists: i64 = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE project_id = ?1);",
            [&project_id],
            |row| row.get(0),
        )?;
        if project_exists == 0 {
            return Err(RepoError::ProjectNotFound(project_id));
        }

        let current = stored_version(&tx, &project_id)?;
        if let Some(actual) = current {
            if !force && expected_version != Some(actual) {
                log::warn!(
                    "event=program_store module=msb_repo status=conflict project={project_id} expected={expected_version:?} actual={actual}"
                );
                return Err(RepoError::VersionConflict {
                    project_id,
                    expected: expected_version,
                    actual,
                });
            }
        }

        let version = next_version(current);
        write_program(
            &tx,
            &project_id,
            program,
            version,
            self.settings.compression_threshold_bytes,
        )?;
        reindex_program(&tx, &project_id, program)?;
        record_stored_state(&tx, &project_id, program)?;
        tx.commit()?;

        log::info!(
            "event=program_store module=msb_repo status=ok project={project_id} msbs={} forced={force} duration_ms={}",
            program.msbs().count(),
            started_at.elapsed().as_millis()
        );
        Ok(version)
    }

    fn fetch_program(&self, project_id: &str) -> RepoResult<StoredProgram> {
        let project_id = normalize_project_id(project_id);
        let Some((version, xml)) = load_program_text(self.conn, &project_id)? else {
            return Err(RepoError::ProgramNotFound(project_id));
        };
        let program = ScienceProgram::parse(&xml)?;
        Ok(StoredProgram {
            project_id,
            version,
            xml,
            program,
        })
    }

    fn program_version(&self, project_id: &str) -> RepoResult<Option<ProgramVersion>> {
        stored_version(self.conn, &normalize_project_id(project_id))
    }

    fn apply_transition(
        &self,
        project_id: &str,
        checksum: &str,
        request: &TransitionRequest,
    ) -> RepoResult<TransitionOutcome> {
        let started_at = Instant::now();
        let project_id = normalize_project_id(project_id);
        let checksum = checksum.trim();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        let Some((version, mut program)) = load_program(&tx, &project_id)? else {
            return Err(MsbError::NotFound {
                project_id,
                checksum: checksum.to_string(),
            }
            .into());
        };

        let mut reverses_id = None;
        let mut changes_program = request.transition.changes_program();
        let effect = match &request.transition {
            Transition::Done => program.mark_done(checksum)?,
            Transition::Undo => {
                let target = find_undo_target(
                    &tx,
                    &project_id,
                    checksum,
                    request.comment.transaction_id(),
                )?;
                match target {
                    Some((id, restore)) => {
                        reverses_id = Some(id);
                        program.mark_undo(checksum, &restore)?
                    }
                    None => {
                        log::warn!(
                            "event=msb_transition module=msb_repo status=nothing_to_undo project={project_id} checksum={checksum}"
                        );
                        changes_program = false;
                        program.unchanged(checksum)?
                    }
                }
            }
            Transition::Suspend { label } => program.mark_suspended(checksum, label)?,
            Transition::AllDone => program.mark_all_done(checksum)?,
            Transition::Reject => program.mark_rejected(checksum)?,
        };

        let msb = program.find_msb(checksum);
        let label = match request.transition {
            Transition::Suspend { .. } => msb.and_then(|msb| msb.suspended.as_deref()),
            _ => None,
        };
        let history_id = insert_history(
            &tx,
            &NewHistoryEntry {
                reverses_id,
                or_removed: &effect.or_removed,
                label,
                ..NewHistoryEntry::new(
                    &project_id,
                    checksum,
                    &request.comment,
                    msb.map(MsbSnapshot::of).unwrap_or_default(),
                )
            },
        )?;
        record_sibling_changes(&tx, &project_id, &program, &effect, &request.comment)?;

        if changes_program {
            write_program(
                &tx,
                &project_id,
                &program,
                version,
                self.settings.compression_threshold_bytes,
            )?;
            let touched = std::iter::once(&effect.checksum)
                .chain(&effect.or_removed)
                .chain(&effect.or_restored);
            for touched in touched {
                if let Some(msb) = program.find_msb(touched) {
                    update_index_state(&tx, &project_id, msb)?;
                }
            }
        }
        tx.commit()?;

        log::info!(
            "event=msb_transition module=msb_repo status=ok project={project_id} checksum={checksum} action={} remaining={} or_removed={} or_restored={} duration_ms={}",
            request.transition.status(),
            effect.remaining_after,
            effect.or_removed.len(),
            effect.or_restored.len(),
            started_at.elapsed().as_millis()
        );
        Ok(TransitionOutcome {
            effect,
            history_id,
            version,
        })
    }

    fn msb_counts(&self, project_ids: &[String]) -> RepoResult<Vec<MsbCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN remaining > 0 AND removed = 0 THEN 1 ELSE 0 END), 0)
             FROM msbs
             WHERE project_id = ?1;",
        )?;
        let mut counts = Vec::with_capacity(project_ids.len());
        for project_id in project_ids {
            let project_id = normalize_project_id(project_id);
            let (total, active): (i64, i64) =
                stmt.query_row([&project_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            counts.push(MsbCount {
                project_id,
                total: to_count(total, "msbs.count")?,
                active: to_count(active, "msbs.active")?,
            });
        }
        Ok(counts)
    }
}

fn next_version(current: Option<ProgramVersion>) -> ProgramVersion {
    let now = now_epoch_ms();
    match current {
        Some(current) => now.max(current + 1),
        None => now,
    }
}

fn stored_version(conn: &Connection, project_id: &str) -> RepoResult<Option<ProgramVersion>> {
    Ok(conn
        .query_row(
            "SELECT version FROM science_programs WHERE project_id = ?1;",
            [project_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn load_program_text(
    conn: &Connection,
    project_id: &str,
) -> RepoResult<Option<(ProgramVersion, String)>> {
    let row: Option<(ProgramVersion, i64, Vec<u8>)> = conn
        .query_row(
            "SELECT version, compressed, payload FROM science_programs WHERE project_id = ?1;",
            [project_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((version, compressed, payload)) = row else {
        return Ok(None);
    };
    let compressed = int_to_bool(compressed, "science_programs.compressed")?;
    if compressed != is_gzip(&payload) {
        return Err(RepoError::InvalidData(format!(
            "science_programs.payload for {project_id} does not match its compressed flag"
        )));
    }
    Ok(Some((version, decode_submission(&payload)?)))
}

fn load_program(
    conn: &Connection,
    project_id: &str,
) -> RepoResult<Option<(ProgramVersion, ScienceProgram)>> {
    match load_program_text(conn, project_id)? {
        Some((version, xml)) => Ok(Some((version, ScienceProgram::parse(&xml)?))),
        None => Ok(None),
    }
}

fn write_program(
    conn: &Connection,
    project_id: &str,
    program: &ScienceProgram,
    version: ProgramVersion,
    compression_threshold_bytes: usize,
) -> RepoResult<()> {
    let xml = program.to_xml()?;
    let payload = encode_for_storage(&xml, compression_threshold_bytes)?;
    let compressed = is_gzip(&payload);
    conn.execute(
        "INSERT INTO science_programs (project_id, version, compressed, payload, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(project_id) DO UPDATE SET
            version = excluded.version,
            compressed = excluded.compressed,
            payload = excluded.payload,
            updated_at = excluded.updated_at;",
        params![
            project_id,
            version,
            bool_to_int(compressed),
            payload,
            now_epoch_ms()
        ],
    )?;
    Ok(())
}

/// Appends the submitted baseline of every MSB so the history log can be
/// folded back into the stored state.
fn record_stored_state(
    conn: &Connection,
    project_id: &str,
    program: &ScienceProgram,
) -> RepoResult<()> {
    let stored = Comment::new("Program submitted", MsbStatus::Stored)?;
    let removed = stored.derived("Removed in submitted program", MsbStatus::Removed)?;
    for msb in program.msbs() {
        insert_history(
            conn,
            &NewHistoryEntry {
                remaining: Some(msb.remaining),
                label: msb.suspended.as_deref(),
                ..NewHistoryEntry::new(project_id, &msb.checksum, &stored, MsbSnapshot::of(msb))
            },
        )?;
        if msb.removed {
            insert_history(
                conn,
                &NewHistoryEntry::new(project_id, &msb.checksum, &removed, MsbSnapshot::of(msb)),
            )?;
        }
    }
    Ok(())
}

fn record_sibling_changes(
    conn: &Connection,
    project_id: &str,
    program: &ScienceProgram,
    effect: &TransitionEffect,
    cause: &Comment,
) -> RepoResult<()> {
    let changes = [
        (&effect.or_removed, MsbStatus::Removed, "Removed from OR group"),
        (&effect.or_restored, MsbStatus::Restored, "Restored to OR group"),
    ];
    for (siblings, status, text) in changes {
        if siblings.is_empty() {
            continue;
        }
        let comment = cause.derived(format!("{text} by {}", effect.checksum), status)?;
        for sibling in siblings {
            let snapshot = program
                .find_msb(sibling)
                .map(MsbSnapshot::of)
                .unwrap_or_default();
            insert_history(
                conn,
                &NewHistoryEntry::new(project_id, sibling, &comment, snapshot),
            )?;
        }
    }
    Ok(())
}

fn reindex_program(conn: &Connection, project_id: &str, program: &ScienceProgram) -> RepoResult<()> {
    conn.execute("DELETE FROM msbs WHERE project_id = ?1;", [project_id])?;

    let mut insert_msb = conn.prepare(
        "INSERT INTO msbs (
            project_id,
            checksum,
            title,
            priority,
            estimated_duration,
            remaining,
            removed,
            suspended,
            or_group,
            tau_min,
            tau_max,
            seeing_min,
            seeing_max,
            elevation_min,
            elevation_max,
            search_text
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16);",
    )?;
    let mut insert_obs = conn.prepare(
        "INSERT INTO observations (
            msb_id,
            position,
            label,
            instrument,
            target,
            waveband,
            coords_type
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
    )?;

    for msb in program.msbs() {
        insert_msb.execute(params![
            project_id,
            msb.checksum,
            msb.title,
            msb.priority,
            msb.estimated_duration,
            i64::from(msb.remaining),
            bool_to_int(msb.removed),
            msb.suspended,
            msb.or_group,
            msb.tau.min,
            msb.tau.max,
            msb.seeing.min,
            msb.seeing.max,
            msb.elevation.min,
            msb.elevation.max,
            msb.search_text(),
        ])?;
        let msb_id = conn.last_insert_rowid();
        for (position, obs) in msb.observations.iter().enumerate() {
            insert_obs.execute(params![
                msb_id,
                i64::try_from(position).unwrap_or(i64::MAX),
                obs.label,
                obs.instrument,
                obs.target,
                obs.waveband,
                obs.coords_type,
            ])?;
        }
    }
    Ok(())
}

fn update_index_state(conn: &Connection, project_id: &str, msb: &Msb) -> RepoResult<()> {
    conn.execute(
        "UPDATE msbs
         SET remaining = ?1, removed = ?2, suspended = ?3
         WHERE project_id = ?4 AND checksum = ?5;",
        params![
            i64::from(msb.remaining),
            bool_to_int(msb.removed),
            msb.suspended,
            project_id,
            msb.checksum,
        ],
    )?;
    Ok(())
}

/// Renders `expr` as a SQL condition over `msbs m` joined with `projects p`.
fn translate_expr(expr: &Expr, bind_values: &mut Vec<Value>) -> RepoResult<String> {
    let sql = match expr {
        Expr::Const(true) => "1".to_string(),
        Expr::Const(false) => "0".to_string(),
        Expr::Eq { field, value } => {
            let value = value.trim();
            match field {
                Field::ProjectId => {
                    bind_values.push(Value::Text(normalize_project_id(value)));
                    "m.project_id = ?".to_string()
                }
                Field::Checksum => {
                    bind_values.push(Value::Text(value.to_string()));
                    "m.checksum = ?".to_string()
                }
                Field::Title => {
                    bind_values.push(Value::Text(value.to_string()));
                    "m.title = ? COLLATE NOCASE".to_string()
                }
                Field::Semester | Field::Country => {
                    bind_values.push(Value::Text(value.to_string()));
                    format!("p.{} = ? COLLATE NOCASE", field.as_str())
                }
                Field::Instrument | Field::Target | Field::Waveband => {
                    bind_values.push(Value::Text(value.to_string()));
                    format!(
                        "EXISTS (SELECT 1 FROM observations o WHERE o.msb_id = m.id AND o.{} = ? COLLATE NOCASE)",
                        field.as_str()
                    )
                }
                other => return Err(unsupported(expr, *other)),
            }
        }
        Expr::Cmp { field, op, value } => {
            let column = match field {
                Field::Priority => "m.priority",
                Field::TimeEst => "m.estimated_duration",
                Field::Remaining => "m.remaining",
                other => return Err(unsupported(expr, *other)),
            };
            bind_values.push(Value::Real(*value));
            format!("{column} {} ?", op.as_str())
        }
        Expr::Flag { field, value } => {
            let column = match field {
                Field::Removed => "m.removed",
                Field::ProjectEnabled => "p.enabled",
                other => return Err(unsupported(expr, *other)),
            };
            bind_values.push(Value::Integer(bool_to_int(*value)));
            format!("{column} = ?")
        }
        Expr::Match { text, boolean } => match build_match_expression(text, *boolean)? {
            Some(expression) => {
                bind_values.push(Value::Text(expression));
                "m.id IN (SELECT rowid FROM msbs_fts WHERE msbs_fts MATCH ?)".to_string()
            }
            None => "1".to_string(),
        },
        Expr::And(items) => join_exprs(items, " AND ", bind_values)?,
        Expr::Or(items) => join_exprs(items, " OR ", bind_values)?,
        Expr::Not(inner) => format!("NOT ({})", translate_expr(inner, bind_values)?),
    };
    Ok(sql)
}

fn join_exprs(items: &[Expr], separator: &str, bind_values: &mut Vec<Value>) -> RepoResult<String> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(translate_expr(item, bind_values)?);
    }
    Ok(format!("({})", parts.join(separator)))
}

fn unsupported(expr: &Expr, field: Field) -> RepoError {
    RepoError::InvalidData(format!("cannot translate `{expr}` for field `{field}`"))
}

fn parse_summary_row(row: &Row<'_>) -> RepoResult<(i64, MsbSummary)> {
    let remaining: i64 = row.get("remaining")?;
    let summary = MsbSummary {
        project_id: row.get("project_id")?,
        checksum: row.get("checksum")?,
        title: row.get("title")?,
        priority: row.get("priority")?,
        estimated_duration: row.get("estimated_duration")?,
        remaining: to_count(remaining, "msbs.remaining")?,
        removed: int_to_bool(row.get("removed")?, "msbs.removed")?,
        suspended: row.get("suspended")?,
        or_group: row.get("or_group")?,
        tau: Range::new(row.get("tau_min")?, row.get("tau_max")?),
        seeing: Range::new(row.get("seeing_min")?, row.get("seeing_max")?),
        elevation: Range::new(row.get("elevation_min")?, row.get("elevation_max")?),
        instruments: Vec::new(),
        targets: Vec::new(),
        wavebands: Vec::new(),
        relevance: row.get("relevance")?,
    };
    Ok((row.get("id")?, summary))
}

/// Rebuilds the observation list of an indexed MSB.
fn load_observations(conn: &Connection, msb_id: i64) -> RepoResult<Msb> {
    let mut stmt = conn.prepare_cached(
        "SELECT label, instrument, target, waveband, coords_type
         FROM observations
         WHERE msb_id = ?1
         ORDER BY position ASC;",
    )?;
    let mut rows = stmt.query([msb_id])?;
    let mut msb = Msb::default();
    while let Some(row) = rows.next()? {
        msb.observations.push(Observation {
            label: row.get(0)?,
            instrument: row.get(1)?,
            target: row.get(2)?,
            waveband: row.get(3)?,
            coords_type: row.get(4)?,
            ..Observation::default()
        });
    }
    Ok(msb)
}

fn to_count(value: i64, column: &str) -> RepoResult<u32> {
    u32::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid count `{value}` in {column}")))
}

#[cfg(test)]
mod tests {
    use super::{translate_expr, Transition, TransitionRequest};
    use crate::model::comment::MsbStatus;
    use crate::query::MsbQuery;
    use rusqlite::types::Value;

    #[test]
    fn expressions_translate_with_positional_binds() {
        let query = MsbQuery::parse(
            "<MSBQuery>
               <instrument>SCUBA</instrument>
               <priority><min>5</min><max>1</max></priority>
               <projectid>m01bu53</projectid>
             </MSBQuery>",
        )
        .unwrap();
        let mut binds = Vec::new();
        let sql = translate_expr(&query.to_expr(), &mut binds).unwrap();

        assert!(sql.contains("o.instrument = ? COLLATE NOCASE"));
        assert!(sql.contains("(m.priority >= ? OR m.priority <= ?)"));
        assert!(sql.contains("m.project_id = ?"));
        assert!(sql.contains("p.enabled = ?"));
        assert_eq!(sql.matches('?').count(), binds.len());
        assert!(binds.contains(&Value::Text("M01BU53".to_string())));
    }

    #[test]
    fn requests_default_their_reason_text() {
        let request = TransitionRequest::new(
            Transition::Suspend {
                label: "obs2".to_string(),
            },
            Some("jdoe"),
            Some("   "),
            Some("tx-9"),
        )
        .unwrap();
        assert_eq!(request.comment.text(), "MSB suspended at observation obs2");
        assert_eq!(request.comment.status(), MsbStatus::Suspended);
        assert_eq!(request.comment.author(), Some("JDOE"));
        assert_eq!(request.comment.transaction_id(), Some("tx-9"));

        let custom = TransitionRequest::new(Transition::Reject, None, Some("cloudy"), None).unwrap();
        assert_eq!(custom.comment.text(), "cloudy");
        assert_eq!(custom.comment.status(), MsbStatus::Rejected);
    }
}
