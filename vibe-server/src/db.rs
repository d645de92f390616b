//! SQLite project/user catalog.
//!
//! Holds who owns which project and when it was last worked on. Generated
//! files never live here; they are on disk under each project's root.
//! Uses WAL mode for concurrent reads during writes.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("project {0} already exists")]
    Conflict(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: String,
    pub owner_id: i64,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Mutex<Connection>,
}

/// Fixed-width timestamps so `ORDER BY updated_at` sorts chronologically.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        created_at: row.get(2)?,
    })
}

impl Db {
    /// Open or create the catalog at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                owner_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_projects_owner_updated
                ON projects(owner_id, updated_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Look up a user by email, creating the record on first sight.
    pub fn ensure_user(&self, email: &str) -> Result<User, DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (email, created_at) VALUES (?1, ?2)",
            params![email, now()],
        )?;
        let user = conn.query_row(
            "SELECT id, email, created_at FROM users WHERE email = ?1",
            params![email],
            user_from_row,
        )?;
        Ok(user)
    }

    pub fn user(&self, id: i64) -> Result<Option<User>, DbError> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, email, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Insert a new project. Fails with [`DbError::Conflict`] if the id is taken.
    pub fn create_project(&self, id: &str, owner_id: i64, name: &str) -> Result<Project, DbError> {
        let conn = self.conn.lock();
        let ts = now();
        let inserted = conn.execute(
            "INSERT INTO projects (id, owner_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, owner_id, name, ts],
        );
        match inserted {
            Ok(_) => Ok(Project {
                id: id.to_string(),
                owner_id,
                name: name.to_string(),
                created_at: ts.clone(),
                updated_at: ts,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(DbError::Conflict(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn project(&self, id: &str) -> Result<Option<Project>, DbError> {
        let conn = self.conn.lock();
        let project = conn
            .query_row(
                "SELECT id, owner_id, name, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    /// An owner's projects, most recently updated first.
    pub fn projects_for_owner(&self, owner_id: i64) -> Result<Vec<Project>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, name, created_at, updated_at
             FROM projects WHERE owner_id = ?1
             ORDER BY updated_at DESC, id ASC",
        )?;
        let projects = stmt
            .query_map(params![owner_id], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Bump `updated_at`. Returns whether the project exists.
    pub fn touch_project(&self, id: &str) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE projects SET updated_at = ?2 WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pause() {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let db = Db::open_memory().unwrap();
        let a = db.ensure_user("test@test.com").unwrap();
        let b = db.ensure_user("test@test.com").unwrap();
        assert_eq!(a, b);
        assert_eq!(db.user(a.id).unwrap(), Some(a));
        assert_eq!(db.user(9999).unwrap(), None);
    }

    #[test]
    fn create_and_lookup_project() {
        let db = Db::open_memory().unwrap();
        let owner = db.ensure_user("owner@example.com").unwrap();
        let created = db.create_project("abc123", owner.id, "Bakery").unwrap();
        assert_eq!(created.created_at, created.updated_at);

        let loaded = db.project("abc123").unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(db.project("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_id_is_conflict() {
        let db = Db::open_memory().unwrap();
        let owner = db.ensure_user("owner@example.com").unwrap();
        db.create_project("abc123", owner.id, "one").unwrap();
        assert!(matches!(
            db.create_project("abc123", owner.id, "two"),
            Err(DbError::Conflict(id)) if id == "abc123"
        ));
    }

    #[test]
    fn unknown_owner_is_rejected() {
        let db = Db::open_memory().unwrap();
        assert!(matches!(db.create_project("abc123", 42, "x"), Err(DbError::Sql(_))));
    }

    #[test]
    fn projects_ordered_by_recency() {
        let db = Db::open_memory().unwrap();
        let alice = db.ensure_user("alice@example.com").unwrap();
        let bob = db.ensure_user("bob@example.com").unwrap();

        db.create_project("first", alice.id, "First").unwrap();
        pause();
        db.create_project("second", alice.id, "Second").unwrap();
        pause();
        db.create_project("other", bob.id, "Bob's").unwrap();

        let ids: Vec<_> = db.projects_for_owner(alice.id).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["second", "first"]);

        pause();
        assert!(db.touch_project("first").unwrap());
        let ids: Vec<_> = db.projects_for_owner(alice.id).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["first", "second"]);

        assert!(!db.touch_project("missing").unwrap());
        assert_eq!(db.projects_for_owner(bob.id).unwrap().len(), 1);
    }
}
