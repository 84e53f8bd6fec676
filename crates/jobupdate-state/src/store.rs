//! StateStore — redb-backed persistence for job updates.
//!
//! Provides versioned reads and compare-and-swap writes of [`JobUpdate`]
//! records. Values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, error};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Durable key-value storage for job update records.
///
/// Every record carries a version token. Writers must present the version
/// they last read (`None` for a record they are creating); a mismatch fails
/// with [`StateError::VersionConflict`] and leaves the record untouched.
pub trait UpdateStore: Send + Sync {
    /// Write `record` if its stored version equals `expected`.
    /// Returns the new version.
    fn compare_and_swap(&self, record: &JobUpdate, expected: Option<u64>) -> StateResult<u64>;

    /// Load one record with its version.
    fn load(&self, key: &JobUpdateKey) -> StateResult<Option<Versioned<JobUpdate>>>;

    /// Load every record whose table key starts with `prefix`. Records that
    /// cannot be decoded are logged and left out.
    fn load_all(&self, prefix: &str) -> StateResult<Vec<Versioned<JobUpdate>>>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(UPDATES).map_err(map_err!(Table))?;
        txn.open_table(UPDATE_VERSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List every update recorded for `job_id`, in key order.
    pub fn list_updates_for_job(&self, job_id: &str) -> StateResult<Vec<Versioned<JobUpdate>>> {
        let prefix = JobUpdateKey::job_prefix(job_id);
        Ok(self
            .load_all(&prefix)?
            .into_iter()
            .filter(|entry| entry.value.key.job_id == job_id)
            .collect())
    }
}

impl UpdateStore for StateStore {
    fn compare_and_swap(&self, record: &JobUpdate, expected: Option<u64>) -> StateResult<u64> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut versions = txn.open_table(UPDATE_VERSIONS).map_err(map_err!(Table))?;
            let found = versions
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value());
            if found != expected {
                // Dropping the transaction without commit discards it.
                return Err(StateError::VersionConflict {
                    key,
                    expected,
                    found,
                });
            }
            next = found.unwrap_or(0) + 1;
            versions
                .insert(key.as_str(), next)
                .map_err(map_err!(Write))?;

            let mut updates = txn.open_table(UPDATES).map_err(map_err!(Table))?;
            updates
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = next, state = %record.status.state, "update stored");
        Ok(next)
    }

    fn load(&self, key: &JobUpdateKey) -> StateResult<Option<Versioned<JobUpdate>>> {
        let key = key.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let updates = txn.open_table(UPDATES).map_err(map_err!(Table))?;
        let versions = txn.open_table(UPDATE_VERSIONS).map_err(map_err!(Table))?;
        let Some(guard) = updates.get(key.as_str()).map_err(map_err!(Read))? else {
            return Ok(None);
        };
        let value: JobUpdate =
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
        let version = versions
            .get(key.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .ok_or_else(|| StateError::NotFound(format!("version of {key}")))?;
        Ok(Some(Versioned { version, value }))
    }

    fn load_all(&self, prefix: &str) -> StateResult<Vec<Versioned<JobUpdate>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let updates = txn.open_table(UPDATES).map_err(map_err!(Table))?;
        let versions = txn.open_table(UPDATE_VERSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in updates.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                continue;
            }
            let record: JobUpdate = match serde_json::from_slice(value.value()) {
                Ok(record) => record,
                Err(e) => {
                    error!(%key, error = %e, "skipping undecodable update record");
                    continue;
                }
            };
            let Some(version) = versions
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
            else {
                error!(%key, "skipping update record without a version");
                continue;
            };
            results.push(Versioned {
                version,
                value: record,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_update(job_id: &str, update_id: &str) -> JobUpdate {
        let spec = UpdateSpec {
            instance_count: 3,
            desired_version: "v2".to_string(),
            previous_version: "v1".to_string(),
            batch_size: 1,
            ..Default::default()
        };
        JobUpdate {
            key: JobUpdateKey::new(job_id, update_id),
            status: UpdateStatus::new(spec.instance_count, 1000),
            spec,
        }
    }

    // ── Compare-and-swap ───────────────────────────────────────────

    #[test]
    fn create_then_load() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_update("prod/api", "u1");

        let version = store.compare_and_swap(&record, None).unwrap();
        assert_eq!(version, 1);

        let loaded = store.load(&record.key).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value, record);
    }

    #[test]
    fn load_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.load(&JobUpdateKey::new("nope", "nothing")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn swap_with_matching_version_bumps_it() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = test_update("prod/api", "u1");
        let v1 = store.compare_and_swap(&record, None).unwrap();

        record
            .status
            .record_transition(UpdateState::RollingForward, None, 1001);
        let v2 = store.compare_and_swap(&record, Some(v1)).unwrap();
        assert_eq!(v2, 2);

        let loaded = store.load(&record.key).unwrap().unwrap();
        assert_eq!(loaded.value.status.state, UpdateState::RollingForward);
    }

    #[test]
    fn stale_version_is_rejected_without_write() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = test_update("prod/api", "u1");
        let v1 = store.compare_and_swap(&record, None).unwrap();
        store.compare_and_swap(&record, Some(v1)).unwrap();

        record.status.record_transition(UpdateState::Aborted, None, 1002);
        let err = store.compare_and_swap(&record, Some(v1)).unwrap_err();
        match err {
            StateError::VersionConflict {
                expected, found, ..
            } => {
                assert_eq!(expected, Some(1));
                assert_eq!(found, Some(2));
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }

        let loaded = store.load(&record.key).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value.status.state, UpdateState::Initialized);
    }

    #[test]
    fn create_over_existing_record_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_update("prod/api", "u1");
        store.compare_and_swap(&record, None).unwrap();

        assert!(matches!(
            store.compare_and_swap(&record, None),
            Err(StateError::VersionConflict { found: Some(1), .. })
        ));
    }

    // ── Scans ──────────────────────────────────────────────────────

    #[test]
    fn load_all_filters_by_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .compare_and_swap(&test_update("prod/api", "u1"), None)
            .unwrap();
        store
            .compare_and_swap(&test_update("prod/api", "u2"), None)
            .unwrap();
        store
            .compare_and_swap(&test_update("prod/web", "u1"), None)
            .unwrap();

        assert_eq!(store.load_all("").unwrap().len(), 3);
        assert_eq!(store.load_all("prod/api/").unwrap().len(), 2);
        assert_eq!(store.list_updates_for_job("prod/web").unwrap().len(), 1);
        assert!(store.list_updates_for_job("staging/api").unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");
        let record = test_update("prod/api", "u1");

        {
            let store = StateStore::open(&db_path).unwrap();
            let v1 = store.compare_and_swap(&record, None).unwrap();
            store.compare_and_swap(&record, Some(v1)).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let loaded = store.load(&record.key).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value.spec.desired_version, "v2");
    }

    #[test]
    fn load_all_skips_unreadable_records() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .compare_and_swap(&test_update("prod/api", "u1"), None)
            .unwrap();
        store
            .compare_and_swap(&test_update("prod/api", "u3"), None)
            .unwrap();

        let txn = store.db.begin_write().unwrap();
        {
            let mut updates = txn.open_table(UPDATES).unwrap();
            updates.insert("prod/api/u2", b"{not json".as_slice()).unwrap();
            let mut versions = txn.open_table(UPDATE_VERSIONS).unwrap();
            versions.remove("prod/api/u3").unwrap();
        }
        txn.commit().unwrap();

        let loaded = store.load_all("prod/api/").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value.key.update_id, "u1");
        // Direct loads still report the damage.
        let bad = JobUpdateKey::new("prod/api", "u2");
        assert!(matches!(store.load(&bad), Err(StateError::Deserialize(_))));
    }
}
