//! CRUD operations for [`StoredIdentity`] records.

use murmur_shared::Handle;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::StoredIdentity;

impl Database {
    /// Store a freshly provisioned identity. Fails with
    /// [`StoreError::AlreadyExists`] if the handle is taken; replacing keys
    /// goes through [`Database::replace_identity`].
    pub fn insert_identity(&self, identity: &StoredIdentity) -> Result<()> {
        let inserted = self.conn().execute(
            "INSERT INTO identities (handle, sealed_keys, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(handle) DO NOTHING",
            params![
                identity.handle.as_str(),
                identity.sealed_keys,
                identity.created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists);
        }
        Ok(())
    }

    /// Explicit re-provisioning: overwrite the sealed key material.
    pub fn replace_identity(&self, identity: &StoredIdentity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities (handle, sealed_keys, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(handle) DO UPDATE SET
                sealed_keys = excluded.sealed_keys,
                created_at  = excluded.created_at",
            params![
                identity.handle.as_str(),
                identity.sealed_keys,
                identity.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_identity(&self, handle: &Handle) -> Result<StoredIdentity> {
        self.conn()
            .query_row(
                "SELECT handle, sealed_keys, created_at FROM identities WHERE handle = ?1",
                params![handle.as_str()],
                row_to_identity,
            )
            .map_err(not_found)
    }

    /// The oldest identity on this device, if any has been provisioned.
    pub fn first_identity(&self) -> Result<Option<StoredIdentity>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT handle, sealed_keys, created_at FROM identities
                 ORDER BY created_at ASC LIMIT 1",
                [],
                row_to_identity,
            )
            .optional()?)
    }

    pub fn delete_identity(&self, handle: &Handle) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM identities WHERE handle = ?1",
            params![handle.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredIdentity> {
    let handle_str: String = row.get(0)?;
    let handle = Handle::parse(&handle_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StoredIdentity {
        handle,
        sealed_keys: row.get(1)?,
        created_at: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn identity(handle: &str, created_at: i64) -> StoredIdentity {
        StoredIdentity {
            handle: Handle::parse(handle).unwrap(),
            sealed_keys: vec![1, 2, 3],
            created_at,
        }
    }

    #[test]
    fn insert_is_create_once() {
        let (_dir, db) = open();
        db.insert_identity(&identity("AAAAAAAA", 10)).unwrap();
        assert!(matches!(
            db.insert_identity(&identity("AAAAAAAA", 20)),
            Err(StoreError::AlreadyExists)
        ));
        assert_eq!(db.get_identity(&Handle::parse("AAAAAAAA").unwrap()).unwrap().created_at, 10);
    }

    #[test]
    fn replace_overwrites_keys() {
        let (_dir, db) = open();
        db.insert_identity(&identity("AAAAAAAA", 10)).unwrap();
        let mut fresh = identity("AAAAAAAA", 30);
        fresh.sealed_keys = vec![9; 4];
        db.replace_identity(&fresh).unwrap();
        assert_eq!(db.get_identity(&fresh.handle).unwrap(), fresh);
    }

    #[test]
    fn first_identity_is_oldest() {
        let (_dir, db) = open();
        assert!(db.first_identity().unwrap().is_none());
        db.insert_identity(&identity("BBBBBBBB", 20)).unwrap();
        db.insert_identity(&identity("AAAAAAAA", 10)).unwrap();
        assert_eq!(db.first_identity().unwrap().unwrap().handle.as_str(), "AAAAAAAA");

        assert!(db.delete_identity(&Handle::parse("AAAAAAAA").unwrap()).unwrap());
        assert!(matches!(
            db.get_identity(&Handle::parse("AAAAAAAA").unwrap()),
            Err(StoreError::NotFound)
        ));
    }
}
