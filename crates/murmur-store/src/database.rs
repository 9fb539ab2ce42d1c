//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The file lives in the platform data directory:
    /// - Linux:   `~/.local/share/murmur/murmur.db`
    /// - macOS:   `~/Library/Application Support/org.murmur.murmur/murmur.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\murmur\murmur\data\murmur.db`
    pub fn new() -> Result<Self> {
        let path = default_path()?;
        tracing::info!(path = %path.display(), "opening database");
        Self::open_at(&path)
    }

    /// Open (or create) a database at an explicit path, creating parent
    /// directories as needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed for transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

/// `murmur.db` inside the platform data directory.
pub fn default_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("org", "murmur", "murmur").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().join("murmur.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());

        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(Database::open_at(&path).unwrap());
        assert!(Database::open_at(&path).is_ok());
    }
}
