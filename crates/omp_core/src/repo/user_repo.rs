//! Known observer user ids.
//!
//! History entries may carry an author; the author must be a registered
//! user. Ids are stored upper-case.

use crate::clock::now_epoch_ms;
use crate::repo::{ensure_connection_ready, RepoError, RepoResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
}

impl User {
    pub fn new(user_id: &str, name: impl Into<String>) -> Self {
        Self {
            user_id: normalize_user_id(user_id),
            name: name.into(),
            email: None,
        }
    }
}

pub trait UserRepository {
    fn add_user(&self, user: &User) -> RepoResult<()>;
    fn get_user(&self, user_id: &str) -> RepoResult<Option<User>>;
    fn user_exists(&self, user_id: &str) -> RepoResult<bool>;
}

pub struct SqliteUserRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteUserRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, "users", &["user_id", "name", "email"])?;
        Ok(Self { conn })
    }
}

impl UserRepository for SqliteUserRepository<'_> {
    fn add_user(&self, user: &User) -> RepoResult<()> {
        let user_id = normalize_user_id(&user.user_id);
        if user_id.is_empty() {
            return Err(RepoError::InvalidData("user id cannot be empty".to_string()));
        }
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO users (user_id, name, email, created_at)
             VALUES (?1, ?2, ?3, ?4);",
            params![user_id, user.name.as_str(), user.email.as_deref(), now_epoch_ms()],
        )?;
        if inserted == 0 {
            return Err(RepoError::UserExists(user_id));
        }
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> RepoResult<Option<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, name, email FROM users WHERE user_id = ?1;")?;
        let mut rows = stmt.query([normalize_user_id(user_id)])?;
        match rows.next()? {
            Some(row) => Ok(Some(User {
                user_id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    fn user_exists(&self, user_id: &str) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1);",
            [normalize_user_id(user_id)],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }
}

pub fn normalize_user_id(user_id: &str) -> String {
    user_id.trim().to_uppercase()
}
