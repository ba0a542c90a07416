//! Append-only MSB history.
//!
//! # Responsibility
//! - Append comment-bearing history rows for MSB transitions.
//! - Reconstruct per-MSB timelines by project, checksum, transaction id or
//!   observing date.
//! - Derive the current status of an MSB by folding its history, with a
//!   cache that is rebuilt whenever it lags behind the log.
//!
//! # Invariants
//! - `msb_done` rows are never updated or deleted (enforced by triggers).
//! - Folding history in insertion order equals [`DoneRepository::current_status`].
//! - Every change to an MSB's stored state has a row of its own: the
//!   submitted baseline (`stored`), each transition, and each OR sibling
//!   removed or restored as a side effect. The fold therefore reproduces
//!   `remaining`, `removed` and `suspended` of the stored program.
//! - `observed_between` refuses to run without a bounding criterion.

use crate::clock::{ut_day_bounds, ut_today_bounds};
use crate::model::comment::{Comment, MsbStatus};
use crate::model::msb::{Msb, MsbState};
use crate::query::QueryError;
use crate::repo::{
    bool_to_int, ensure_connection_ready, int_to_bool, normalize_project_id, RepoError,
    RepoResult,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const HISTORY_SELECT_SQL: &str = "SELECT
    id,
    project_id,
    checksum,
    status,
    author,
    comment,
    date,
    transaction_id,
    title,
    target,
    instrument,
    waveband,
    reverses_id,
    or_removed,
    remaining,
    label
FROM msb_done";

/// MSB descriptors captured at the time of a history entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsbSnapshot {
    pub title: Option<String>,
    pub target: Option<String>,
    pub instrument: Option<String>,
    pub waveband: Option<String>,
}

impl MsbSnapshot {
    pub fn of(msb: &Msb) -> Self {
        let joined = |values: Vec<String>| Some(values.join("/")).filter(|v| !v.is_empty());
        Self {
            title: Some(msb.title.clone()).filter(|title| !title.is_empty()),
            target: joined(msb.targets()),
            instrument: joined(msb.instruments()),
            waveband: joined(msb.wavebands()),
        }
    }
}

/// One persisted history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub project_id: String,
    pub checksum: String,
    pub comment: Comment,
    pub snapshot: MsbSnapshot,
    /// History row reverted by this one (undo).
    pub reverses_id: Option<i64>,
    /// OR siblings removed by this transition.
    pub or_removed: Vec<String>,
    /// Submitted remaining count on `stored` rows.
    pub remaining: Option<u32>,
    /// Suspension label on `stored` and `suspended` rows.
    pub label: Option<String>,
}

/// Input for appending a history row.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry<'a> {
    pub project_id: &'a str,
    pub checksum: &'a str,
    pub comment: &'a Comment,
    pub snapshot: MsbSnapshot,
    pub reverses_id: Option<i64>,
    pub or_removed: &'a [String],
    pub remaining: Option<u32>,
    pub label: Option<&'a str>,
}

impl<'a> NewHistoryEntry<'a> {
    /// Entry without undo correlation or state payload.
    pub fn new(
        project_id: &'a str,
        checksum: &'a str,
        comment: &'a Comment,
        snapshot: MsbSnapshot,
    ) -> Self {
        Self {
            project_id,
            checksum,
            comment,
            snapshot,
            reverses_id: None,
            or_removed: &[],
            remaining: None,
            label: None,
        }
    }
}

/// Timeline of one MSB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsbHistory {
    pub project_id: String,
    pub checksum: String,
    /// Latest known descriptors.
    pub snapshot: MsbSnapshot,
    pub entries: Vec<HistoryEntry>,
}

impl MsbHistory {
    /// Folds this timeline into a status.
    pub fn status(&self) -> HistoryStatus {
        self.entries
            .iter()
            .fold(HistoryStatus::default(), |status, entry| status.apply(entry))
    }
}

/// Status derived from history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStatus {
    /// Latest state-changing status; informational entries leave it alone.
    pub status: Option<MsbStatus>,
    /// Net completed repeats (`done` minus reverting `undone`, floor zero).
    pub times_observed: u32,
    /// `None` until a `stored` row sets the baseline.
    pub remaining: Option<u32>,
    pub removed: bool,
    pub suspended: Option<String>,
    pub last_history_id: Option<i64>,
}

impl HistoryStatus {
    /// Folds one entry. Mirrors the transitions of
    /// [`crate::model::program::ScienceProgram`].
    pub fn apply(mut self, entry: &HistoryEntry) -> Self {
        let status = entry.comment.status();
        let changes_state = match status {
            MsbStatus::Stored => {
                self.remaining = entry.remaining;
                self.removed = false;
                self.suspended = entry.label.clone();
                true
            }
            MsbStatus::Done => {
                self.times_observed = self.times_observed.saturating_add(1);
                self.remaining = self.remaining.map(|remaining| remaining.saturating_sub(1));
                self.suspended = None;
                true
            }
            // An undo with no done to revert leaves the MSB untouched.
            MsbStatus::Undone => {
                if entry.reverses_id.is_some() {
                    self.times_observed = self.times_observed.saturating_sub(1);
                    self.remaining = self.remaining.map(|remaining| remaining.saturating_add(1));
                }
                entry.reverses_id.is_some()
            }
            MsbStatus::AllDone => {
                self.remaining = Some(0);
                self.suspended = None;
                true
            }
            MsbStatus::Suspended => {
                self.suspended = entry.label.clone();
                true
            }
            MsbStatus::Removed => {
                self.removed = true;
                self.suspended = None;
                true
            }
            MsbStatus::Restored => {
                self.removed = false;
                true
            }
            MsbStatus::Rejected | MsbStatus::Aborted => true,
            MsbStatus::Fetched | MsbStatus::Comment => false,
        };
        if changes_state {
            self.status = Some(status);
        }
        self.last_history_id = Some(entry.id);
        self
    }

    /// Lifecycle state implied by the log, ordered like [`Msb::state`];
    /// `None` before any `stored` row.
    pub fn state(&self) -> Option<MsbState> {
        let remaining = self.remaining?;
        Some(if self.removed {
            MsbState::Removed
        } else if remaining == 0 {
            MsbState::Exhausted
        } else if let Some(label) = &self.suspended {
            MsbState::Suspended {
                label: label.clone(),
            }
        } else {
            MsbState::Active { remaining }
        })
    }
}

/// Criteria for [`DoneRepository::observed_between`]; at least one is
/// required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedQuery {
    /// UT date `YYYY-MM-DD`.
    pub date: Option<String>,
    /// Use the current UT date.
    pub use_now: bool,
    pub project_id: Option<String>,
}

pub trait DoneRepository {
    /// Appends one history row and returns its id.
    fn add_history(&self, entry: &NewHistoryEntry<'_>) -> RepoResult<i64>;
    /// Appends a free-form comment; descriptors come from the current
    /// MSB index when the MSB is still stored.
    fn add_comment(&self, project_id: &str, checksum: &str, comment: &Comment)
        -> RepoResult<i64>;
    /// Timelines filtered by project and/or checksum.
    fn history_for(
        &self,
        project_id: Option<&str>,
        checksum: Option<&str>,
    ) -> RepoResult<Vec<MsbHistory>>;
    /// The MSB timeline restricted to one transaction id.
    fn history_for_transaction(&self, transaction_id: &str) -> RepoResult<Option<MsbHistory>>;
    /// MSBs observed in a UT day and/or project, with their entries.
    fn observed_between(&self, query: &ObservedQuery) -> RepoResult<Vec<MsbHistory>>;
    /// Status via the cache, rebuilt when stale.
    fn current_status(&self, project_id: &str, checksum: &str) -> RepoResult<HistoryStatus>;
    /// Status by folding every history row.
    fn replay_status(&self, project_id: &str, checksum: &str) -> RepoResult<HistoryStatus>;
}

pub struct SqliteDoneRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteDoneRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(
            conn,
            "msb_done",
            &[
                "project_id",
                "checksum",
                "status",
                "comment",
                "transaction_id",
                "reverses_id",
                "or_removed",
                "remaining",
                "label",
            ],
        )?;
        ensure_connection_ready(
            conn,
            "msb_status_cache",
            &[
                "status",
                "times_observed",
                "remaining",
                "removed",
                "suspended",
                "last_history_id",
            ],
        )?;
        Ok(Self { conn })
    }
}

impl DoneRepository for SqliteDoneRepository<'_> {
    fn add_history(&self, entry: &NewHistoryEntry<'_>) -> RepoResult<i64> {
        insert_history(self.conn, entry)
    }

    fn add_comment(
        &self,
        project_id: &str,
        checksum: &str,
        comment: &Comment,
    ) -> RepoResult<i64> {
        let project_id = normalize_project_id(project_id);
        let snapshot = indexed_snapshot(self.conn, &project_id, checksum)?.unwrap_or_default();
        insert_history(
            self.conn,
            &NewHistoryEntry::new(&project_id, checksum, comment, snapshot),
        )
    }

    fn history_for(
        &self,
        project_id: Option<&str>,
        checksum: Option<&str>,
    ) -> RepoResult<Vec<MsbHistory>> {
        if project_id.is_none() && checksum.is_none() {
            return Err(QueryError::Unbounded("history lookup").into());
        }
        let mut sql = format!("{HISTORY_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(project_id) = project_id {
            sql.push_str(" AND project_id = ?");
            bind_values.push(Value::Text(normalize_project_id(project_id)));
        }
        if let Some(checksum) = checksum {
            sql.push_str(" AND checksum = ?");
            bind_values.push(Value::Text(checksum.trim().to_string()));
        }
        sql.push_str(" ORDER BY id ASC;");
        let entries = load_entries(self.conn, &sql, bind_values)?;
        Ok(group_entries(entries))
    }

    fn history_for_transaction(&self, transaction_id: &str) -> RepoResult<Option<MsbHistory>> {
        let entries = load_entries(
            self.conn,
            // OR sibling rows share the transaction id of the done that caused them.
            &format!(
                "{HISTORY_SELECT_SQL}
                 WHERE transaction_id = ? AND status NOT IN ('removed', 'restored')
                 ORDER BY id ASC;"
            ),
            vec![Value::Text(transaction_id.trim().to_string())],
        )?;
        let mut groups = group_entries(entries);
        if groups.len() > 1 {
            log::warn!(
                "event=history_for_transaction module=done_repo status=ambiguous msbs={}",
                groups.len()
            );
        }
        Ok(if groups.is_empty() {
            None
        } else {
            Some(groups.remove(0))
        })
    }

    fn observed_between(&self, query: &ObservedQuery) -> RepoResult<Vec<MsbHistory>> {
        let window = match (&query.date, query.use_now) {
            (Some(date), _) => Some(ut_day_bounds(date).ok_or_else(|| {
                QueryError::InvalidValue {
                    element: "date".to_string(),
                    value: date.clone(),
                }
            })?),
            (None, true) => Some(ut_today_bounds()),
            (None, false) => None,
        };
        let project_id = query.project_id.as_deref().map(normalize_project_id);
        if window.is_none() && project_id.is_none() {
            return Err(QueryError::Unbounded("observed MSB lookup").into());
        }

        let mut sql = format!("{HISTORY_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some((start, end)) = window {
            sql.push_str(" AND date >= ? AND date < ?");
            bind_values.push(Value::Integer(start));
            bind_values.push(Value::Integer(end));
        }
        if let Some(project_id) = project_id {
            sql.push_str(" AND project_id = ?");
            bind_values.push(Value::Text(project_id));
        }
        sql.push_str(" ORDER BY id ASC;");

        let observed = group_entries(load_entries(self.conn, &sql, bind_values)?)
            .into_iter()
            .filter(|history| {
                history.entries.iter().any(|entry| {
                    matches!(
                        entry.comment.status(),
                        MsbStatus::Done | MsbStatus::AllDone
                    )
                })
            })
            .collect();
        Ok(observed)
    }

    fn current_status(&self, project_id: &str, checksum: &str) -> RepoResult<HistoryStatus> {
        let project_id = normalize_project_id(project_id);
        let newest: Option<i64> = self.conn.query_row(
            "SELECT MAX(id) FROM msb_done WHERE project_id = ?1 AND checksum = ?2;",
            params![project_id, checksum],
            |row| row.get(0),
        )?;
        let Some(newest) = newest else {
            return Ok(HistoryStatus::default());
        };

        let cached = self
            .conn
            .query_row(
                "SELECT status, times_observed, remaining, removed, suspended, last_history_id
                 FROM msb_status_cache
                 WHERE project_id = ?1 AND checksum = ?2;",
                params![project_id, checksum],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        if let Some((status, times_observed, remaining, removed, suspended, last_history_id)) =
            cached
        {
            if last_history_id == newest {
                return Ok(HistoryStatus {
                    status: status.as_deref().map(parse_status).transpose()?,
                    times_observed: to_count(times_observed, "msb_status_cache.times_observed")?,
                    remaining: remaining
                        .map(|remaining| to_count(remaining, "msb_status_cache.remaining"))
                        .transpose()?,
                    removed: int_to_bool(removed, "msb_status_cache.removed")?,
                    suspended,
                    last_history_id: Some(last_history_id),
                });
            }
        }

        let status = self.replay_status(&project_id, checksum)?;
        log::debug!(
            "event=status_cache_rebuild module=done_repo status=ok project={project_id} checksum={checksum} last_history_id={newest}"
        );
        self.conn.execute(
            "INSERT INTO msb_status_cache (
                project_id,
                checksum,
                status,
                times_observed,
                remaining,
                removed,
                suspended,
                last_history_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(project_id, checksum) DO UPDATE SET
                status = excluded.status,
                times_observed = excluded.times_observed,
                remaining = excluded.remaining,
                removed = excluded.removed,
                suspended = excluded.suspended,
                last_history_id = excluded.last_history_id;",
            params![
                project_id,
                checksum,
                status.status.map(MsbStatus::as_str),
                i64::from(status.times_observed),
                status.remaining.map(i64::from),
                bool_to_int(status.removed),
                status.suspended.as_deref(),
                status.last_history_id,
            ],
        )?;
        Ok(status)
    }

    fn replay_status(&self, project_id: &str, checksum: &str) -> RepoResult<HistoryStatus> {
        let entries = load_entries(
            self.conn,
            &format!("{HISTORY_SELECT_SQL} WHERE project_id = ? AND checksum = ? ORDER BY id ASC;"),
            vec![
                Value::Text(normalize_project_id(project_id)),
                Value::Text(checksum.to_string()),
            ],
        )?;
        Ok(entries
            .iter()
            .fold(HistoryStatus::default(), |status, entry| status.apply(entry)))
    }
}

/// Appends a history row on `conn`, which may be an open transaction.
pub(crate) fn insert_history(conn: &Connection, entry: &NewHistoryEntry<'_>) -> RepoResult<i64> {
    let comment = entry.comment;
    conn.execute(
        "INSERT INTO msb_done (
            project_id,
            checksum,
            status,
            author,
            comment,
            date,
            transaction_id,
            title,
            target,
            instrument,
            waveband,
            reverses_id,
            or_removed,
            remaining,
            label
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15);",
        params![
            normalize_project_id(entry.project_id),
            entry.checksum,
            comment.status().as_str(),
            comment.author(),
            comment.text(),
            comment.date(),
            comment.transaction_id(),
            entry.snapshot.title.as_deref(),
            entry.snapshot.target.as_deref(),
            entry.snapshot.instrument.as_deref(),
            entry.snapshot.waveband.as_deref(),
            entry.reverses_id,
            entry.or_removed.join(" "),
            entry.remaining.map(i64::from),
            entry.label,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finds the done row an undo should revert: the newest unreverted `done`
/// for the MSB since its latest `stored` baseline, preferring one from
/// `transaction_id`.
///
/// Returns the row id and the OR siblings it removed.
pub(crate) fn find_undo_target(
    conn: &Connection,
    project_id: &str,
    checksum: &str,
    transaction_id: Option<&str>,
) -> RepoResult<Option<(i64, Vec<String>)>> {
    let lookup = |transaction_id: Option<&str>| -> RepoResult<Option<(i64, Vec<String>)>> {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT d.id, d.or_removed
                 FROM msb_done d
                 WHERE d.project_id = ?1
                   AND d.checksum = ?2
                   AND d.status = 'done'
                   AND d.id > COALESCE((
                       SELECT MAX(s.id)
                       FROM msb_done s
                       WHERE s.project_id = ?1 AND s.checksum = ?2 AND s.status = 'stored'
                   ), 0)
                   AND (?3 IS NULL OR d.transaction_id = ?3)
                   AND NOT EXISTS (
                       SELECT 1 FROM msb_done u WHERE u.reverses_id = d.id
                   )
                 ORDER BY d.id DESC
                 LIMIT 1;",
                params![normalize_project_id(project_id), checksum, transaction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(id, removed)| (id, split_checksums(&removed))))
    };

    if transaction_id.is_some() {
        if let Some(found) = lookup(transaction_id)? {
            return Ok(Some(found));
        }
    }
    lookup(None)
}

fn indexed_snapshot(
    conn: &Connection,
    project_id: &str,
    checksum: &str,
) -> RepoResult<Option<MsbSnapshot>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, title FROM msbs WHERE project_id = ?1 AND checksum = ?2;",
            params![project_id, checksum],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((msb_id, title)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT instrument, target, waveband
         FROM observations
         WHERE msb_id = ?1
         ORDER BY position ASC;",
    )?;
    let mut rows = stmt.query([msb_id])?;
    let mut msb = Msb {
        title,
        ..Msb::default()
    };
    while let Some(row) = rows.next()? {
        msb.observations.push(crate::model::msb::Observation {
            instrument: row.get(0)?,
            target: row.get(1)?,
            waveband: row.get(2)?,
            ..Default::default()
        });
    }
    Ok(Some(MsbSnapshot::of(&msb)))
}

fn load_entries(conn: &Connection, sql: &str, bind_values: Vec<Value>) -> RepoResult<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(parse_history_row(row)?);
    }
    Ok(entries)
}

/// Groups rows by MSB, keeping first-appearance order.
fn group_entries(entries: Vec<HistoryEntry>) -> Vec<MsbHistory> {
    let mut groups: Vec<MsbHistory> = Vec::new();
    for entry in entries {
        let position = groups.iter().position(|group| {
            group.project_id == entry.project_id && group.checksum == entry.checksum
        });
        let group = match position {
            Some(index) => &mut groups[index],
            None => {
                groups.push(MsbHistory {
                    project_id: entry.project_id.clone(),
                    checksum: entry.checksum.clone(),
                    snapshot: MsbSnapshot::default(),
                    entries: Vec::new(),
                });
                let last = groups.len() - 1;
                &mut groups[last]
            }
        };
        if entry.snapshot != MsbSnapshot::default() {
            group.snapshot = entry.snapshot.clone();
        }
        group.entries.push(entry);
    }
    groups
}

fn parse_history_row(row: &Row<'_>) -> RepoResult<HistoryEntry> {
    let status_text: String = row.get("status")?;
    let status = parse_status(&status_text)?;
    let author: Option<String> = row.get("author")?;
    let transaction_id: Option<String> = row.get("transaction_id")?;
    let comment = Comment::with_date(row.get::<_, String>("comment")?, status, row.get("date")?)
        .map_err(|err| RepoError::InvalidData(format!("msb_done.comment: {err}")))?
        .by(author.as_deref())
        .in_transaction(transaction_id.as_deref());

    Ok(HistoryEntry {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        checksum: row.get("checksum")?,
        comment,
        snapshot: MsbSnapshot {
            title: row.get("title")?,
            target: row.get("target")?,
            instrument: row.get("instrument")?,
            waveband: row.get("waveband")?,
        },
        reverses_id: row.get("reverses_id")?,
        or_removed: split_checksums(&row.get::<_, String>("or_removed")?),
        remaining: row
            .get::<_, Option<i64>>("remaining")?
            .map(|remaining| to_count(remaining, "msb_done.remaining"))
            .transpose()?,
        label: row.get("label")?,
    })
}

fn to_count(value: i64, column: &str) -> RepoResult<u32> {
    u32::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid count `{value}` in {column}")))
}

fn parse_status(value: &str) -> RepoResult<MsbStatus> {
    MsbStatus::parse(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid status `{value}` in msb_done")))
}

fn split_checksums(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::{
        find_undo_target, DoneRepository, HistoryStatus, MsbSnapshot, NewHistoryEntry, ObservedQuery,
        SqliteDoneRepository,
    };
    use crate::clock::ut_day_bounds;
    use crate::model::comment::{Comment, MsbStatus};
    use crate::model::msb::MsbState;
    use crate::query::QueryError;
    use crate::repo::RepoError;

    fn append(repo: &SqliteDoneRepository<'_>, checksum: &str, status: MsbStatus, date: i64) -> i64 {
        let comment = Comment::with_date("note", status, date)
            .unwrap()
            .in_transaction(Some("tx-1"));
        let snapshot = MsbSnapshot {
            title: Some("Mars".to_string()),
            ..MsbSnapshot::default()
        };
        repo.add_history(&NewHistoryEntry::new("m01bu53", checksum, &comment, snapshot))
            .unwrap()
    }

    fn append_stored(
        repo: &SqliteDoneRepository<'_>,
        checksum: &str,
        remaining: u32,
        label: Option<&str>,
    ) -> i64 {
        let comment = Comment::with_date("stored", MsbStatus::Stored, 1).unwrap();
        repo.add_history(&NewHistoryEntry {
            remaining: Some(remaining),
            label,
            ..NewHistoryEntry::new("m01bu53", checksum, &comment, MsbSnapshot::default())
        })
        .unwrap()
    }

    fn append_undo(repo: &SqliteDoneRepository<'_>, checksum: &str, reverses_id: Option<i64>) {
        let comment = Comment::with_date("undo", MsbStatus::Undone, 9).unwrap();
        repo.add_history(&NewHistoryEntry {
            reverses_id,
            ..NewHistoryEntry::new("m01bu53", checksum, &comment, MsbSnapshot::default())
        })
        .unwrap();
    }

    #[test]
    fn status_folds_done_undo_and_informational_entries() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        append(&repo, "abc", MsbStatus::Fetched, 1);
        append(&repo, "abc", MsbStatus::Done, 2);
        let reverted = append(&repo, "abc", MsbStatus::Done, 3);
        append_undo(&repo, "abc", Some(reverted));
        let last = append(&repo, "abc", MsbStatus::Fetched, 4);
        append(&repo, "other", MsbStatus::Done, 5);

        let replayed = repo.replay_status("M01BU53", "abc").unwrap();
        assert_eq!(replayed.status, Some(MsbStatus::Undone));
        assert_eq!(replayed.times_observed, 1);
        assert_eq!(replayed.last_history_id, Some(last));
        assert_eq!(repo.current_status("M01BU53", "abc").unwrap(), replayed);
        assert_eq!(
            repo.current_status("M01BU53", "missing").unwrap(),
            HistoryStatus::default()
        );
    }

    #[test]
    fn status_fold_tracks_remaining_suspension_and_removal() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        assert_eq!(repo.current_status("M01BU53", "abc").unwrap().state(), None);

        append_stored(&repo, "abc", 2, Some("night 1"));
        assert_eq!(
            repo.current_status("M01BU53", "abc").unwrap().state(),
            Some(MsbState::Suspended {
                label: "night 1".to_string()
            })
        );

        let done = append(&repo, "abc", MsbStatus::Done, 2);
        assert_eq!(
            repo.current_status("M01BU53", "abc").unwrap().state(),
            Some(MsbState::Active { remaining: 1 })
        );

        append_undo(&repo, "abc", None);
        let unchanged = repo.current_status("M01BU53", "abc").unwrap();
        assert_eq!(unchanged.status, Some(MsbStatus::Done));
        assert_eq!(unchanged.remaining, Some(1));
        assert_eq!(unchanged.times_observed, 1);

        append_undo(&repo, "abc", Some(done));
        assert_eq!(
            repo.current_status("M01BU53", "abc").unwrap().state(),
            Some(MsbState::Active { remaining: 2 })
        );

        append(&repo, "abc", MsbStatus::Removed, 3);
        assert_eq!(
            repo.current_status("M01BU53", "abc").unwrap().state(),
            Some(MsbState::Removed)
        );
        append(&repo, "abc", MsbStatus::Restored, 4);
        append(&repo, "abc", MsbStatus::AllDone, 5);
        let status = repo.current_status("M01BU53", "abc").unwrap();
        assert_eq!(status.state(), Some(MsbState::Exhausted));
        assert_eq!(status, repo.replay_status("M01BU53", "abc").unwrap());
    }

    #[test]
    fn undo_targets_ignore_done_rows_before_the_latest_store() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        append_stored(&repo, "abc", 3, None);
        append(&repo, "abc", MsbStatus::Done, 2);
        append_stored(&repo, "abc", 3, None);
        assert_eq!(find_undo_target(&conn, "m01bu53", "abc", None).unwrap(), None);

        let done = append(&repo, "abc", MsbStatus::Done, 3);
        let (target, _) = find_undo_target(&conn, "m01bu53", "abc", None)
            .unwrap()
            .unwrap();
        assert_eq!(target, done);
    }

    #[test]
    fn stale_cache_is_rebuilt() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        append(&repo, "abc", MsbStatus::Done, 1);
        assert_eq!(repo.current_status("M01BU53", "abc").unwrap().times_observed, 1);

        append(&repo, "abc", MsbStatus::Done, 2);
        let refreshed = repo.current_status("M01BU53", "abc").unwrap();
        assert_eq!(refreshed.times_observed, 2);
        assert_eq!(refreshed, repo.replay_status("M01BU53", "abc").unwrap());
    }

    #[test]
    fn history_rows_are_append_only() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        append(&repo, "abc", MsbStatus::Done, 1);
        assert!(conn.execute("DELETE FROM msb_done;", []).is_err());
        assert!(conn
            .execute("UPDATE msb_done SET status = 'undone';", [])
            .is_err());
    }

    #[test]
    fn lookups_group_by_msb_and_transaction() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        append(&repo, "abc", MsbStatus::Done, 1);
        append(&repo, "def", MsbStatus::Rejected, 2);

        let all = repo.history_for(Some("M01BU53"), None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].snapshot.title.as_deref(), Some("Mars"));

        let one = repo.history_for(None, Some("def")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].entries[0].comment.status(), MsbStatus::Rejected);

        let tx = repo.history_for_transaction("tx-1").unwrap().unwrap();
        assert_eq!(tx.checksum, "abc");
        assert!(repo.history_for_transaction("nope").unwrap().is_none());

        assert!(matches!(
            repo.history_for(None, None),
            Err(RepoError::Query(QueryError::Unbounded(_)))
        ));
    }

    #[test]
    fn observed_between_requires_a_criterion_and_filters_by_day() {
        let conn = crate::db::open_db_in_memory().unwrap();
        let repo = SqliteDoneRepository::try_new(&conn).unwrap();
        let (start, _) = ut_day_bounds("2002-03-10").unwrap();
        append(&repo, "abc", MsbStatus::Done, start + 1_000);
        append(&repo, "def", MsbStatus::Comment, start + 2_000);
        append(&repo, "ghi", MsbStatus::Done, start - 1_000);

        assert!(matches!(
            repo.observed_between(&ObservedQuery::default()),
            Err(RepoError::Query(QueryError::Unbounded(_)))
        ));

        let observed = repo
            .observed_between(&ObservedQuery {
                date: Some("2002-03-10".to_string()),
                ..ObservedQuery::default()
            })
            .unwrap();
        let checksums: Vec<&str> = observed.iter().map(|h| h.checksum.as_str()).collect();
        assert_eq!(checksums, ["abc"]);

        let by_project = repo
            .observed_between(&ObservedQuery {
                project_id: Some("m01bu53".to_string()),
                ..ObservedQuery::default()
            })
            .unwrap();
        assert_eq!(by_project.len(), 2);
    }
}
