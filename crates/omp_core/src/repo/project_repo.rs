//! Project registry.
//!
//! # Responsibility
//! - Persist project metadata used by query joins (semester, country,
//!   enabled state).
//! - Verify project passwords for program store/fetch.
//!
//! # Invariants
//! - Project ids are stored upper-case.
//! - Passwords are never stored; only a salted SHA-1 digest is.

use crate::clock::now_epoch_ms;
use crate::repo::{
    bool_to_int, ensure_connection_ready, int_to_bool, normalize_project_id, RepoError,
    RepoResult,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use uuid::Uuid;

const PROJECT_SELECT_SQL: &str = "SELECT
    project_id,
    title,
    pi,
    semester,
    country,
    enabled
FROM projects";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub title: String,
    pub pi: Option<String>,
    pub semester: Option<String>,
    pub country: Option<String>,
    /// Disabled projects are hidden from default MSB queries.
    pub enabled: bool,
}

impl Project {
    pub fn new(project_id: &str, title: impl Into<String>) -> Self {
        Self {
            project_id: normalize_project_id(project_id),
            title: title.into(),
            pi: None,
            semester: None,
            country: None,
            enabled: true,
        }
    }
}

pub trait ProjectRepository {
    /// Registers a project with its password.
    fn add_project(&self, project: &Project, password: &str) -> RepoResult<()>;
    fn get_project(&self, project_id: &str) -> RepoResult<Option<Project>>;
    fn list_projects(&self) -> RepoResult<Vec<Project>>;
    /// Returns `Ok(false)` for a wrong password, `ProjectNotFound` for an
    /// unknown project.
    fn verify_password(&self, project_id: &str, password: &str) -> RepoResult<bool>;
    fn set_enabled(&self, project_id: &str, enabled: bool) -> RepoResult<()>;
}

pub struct SqliteProjectRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteProjectRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(
            conn,
            "projects",
            &[
                "project_id",
                "semester",
                "country",
                "enabled",
                "password_salt",
                "password_hash",
            ],
        )?;
        Ok(Self { conn })
    }
}

impl ProjectRepository for SqliteProjectRepository<'_> {
    fn add_project(&self, project: &Project, password: &str) -> RepoResult<()> {
        let project_id = normalize_project_id(&project.project_id);
        if project_id.is_empty() {
            return Err(RepoError::InvalidData("project id cannot be empty".to_string()));
        }

        let salt = Uuid::new_v4().simple().to_string();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO projects (
                project_id,
                title,
                pi,
                semester,
                country,
                enabled,
                password_salt,
                password_hash,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                project_id,
                project.title.as_str(),
                project.pi.as_deref(),
                project.semester.as_deref(),
                project.country.as_deref(),
                bool_to_int(project.enabled),
                salt,
                password_digest(&salt, password),
                now_epoch_ms(),
            ],
        )?;
        if inserted == 0 {
            return Err(RepoError::ProjectExists(project_id));
        }
        Ok(())
    }

    fn get_project(&self, project_id: &str) -> RepoResult<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PROJECT_SELECT_SQL} WHERE project_id = ?1;"))?;
        let mut rows = stmt.query([normalize_project_id(project_id)])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_project_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_projects(&self) -> RepoResult<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PROJECT_SELECT_SQL} ORDER BY project_id ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(parse_project_row(row)?);
        }
        Ok(projects)
    }

    fn verify_password(&self, project_id: &str, password: &str) -> RepoResult<bool> {
        let project_id = normalize_project_id(project_id);
        let stored: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT password_salt, password_hash FROM projects WHERE project_id = ?1;",
                [project_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (salt, hash) = stored.ok_or(RepoError::ProjectNotFound(project_id))?;
        Ok(password_digest(&salt, password) == hash)
    }

    fn set_enabled(&self, project_id: &str, enabled: bool) -> RepoResult<()> {
        let project_id = normalize_project_id(project_id);
        let changed = self.conn.execute(
            "UPDATE projects SET enabled = ?2 WHERE project_id = ?1;",
            params![project_id, bool_to_int(enabled)],
        )?;
        if changed == 0 {
            return Err(RepoError::ProjectNotFound(project_id));
        }
        Ok(())
    }
}

fn parse_project_row(row: &Row<'_>) -> RepoResult<Project> {
    Ok(Project {
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        pi: row.get("pi")?,
        semester: row.get("semester")?,
        country: row.get("country")?,
        enabled: int_to_bool(row.get("enabled")?, "projects.enabled")?,
    })
}

fn password_digest(salt: &str, password: &str) -> String {
    let digest = Sha1::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    let mut hex = String::with_capacity(40);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::{Project, ProjectRepository, SqliteProjectRepository};
    use crate::db::open_db_in_memory;
    use crate::repo::RepoError;

    #[test]
    fn add_get_and_verify_project() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteProjectRepository::try_new(&conn).unwrap();
        let mut project = Project::new("m01bu53", "Planetary imaging");
        project.semester = Some("01B".to_string());
        repo.add_project(&project, "secret").unwrap();

        let stored = repo.get_project("M01BU53").unwrap().unwrap();
        assert_eq!(stored.project_id, "M01BU53");
        assert_eq!(stored.semester.as_deref(), Some("01B"));
        assert!(stored.enabled);

        assert!(repo.verify_password("m01bu53", "secret").unwrap());
        assert!(!repo.verify_password("M01BU53", "guess").unwrap());
        assert!(matches!(
            repo.verify_password("NOPE", "secret"),
            Err(RepoError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn duplicate_project_is_rejected() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteProjectRepository::try_new(&conn).unwrap();
        let project = Project::new("M01BU53", "first");
        repo.add_project(&project, "a").unwrap();
        assert!(matches!(
            repo.add_project(&project, "b"),
            Err(RepoError::ProjectExists(_))
        ));
    }

    #[test]
    fn enabled_flag_can_be_toggled() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteProjectRepository::try_new(&conn).unwrap();
        repo.add_project(&Project::new("U/02A/1", "t"), "pw").unwrap();
        repo.set_enabled("u/02a/1", false).unwrap();
        assert!(!repo.get_project("U/02A/1").unwrap().unwrap().enabled);
        assert!(repo.set_enabled("missing", true).is_err());
    }
}
