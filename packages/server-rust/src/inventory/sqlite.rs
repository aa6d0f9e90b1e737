//! SQLite-backed storage inventory.
//!
//! One mutex-guarded connection gives the exclusive-writer /
//! serialized-reader model the inventory contract asks for, and
//! read-your-writes falls out of the serialization. Name→id maps for
//! volumes and algorithms are cached in memory and reloaded on every
//! write. All SQL is parameterized; identifiers never enter query text
//! from caller input.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use pdrcache_core::metadata::keys;
use pdrcache_core::{iso8601_utc, Checksum, ClockSource, ObjectMetadata, SHA256};

use super::{
    CacheObject, DatasetSummary, InventoryError, InventoryMutator, InventoryReader, VolumeInfo,
    VolumeStatus, VolumeTotals, DEFAULT_PRIORITY,
};

/// Default minimum age since last check before an object is due again: 24 h.
pub const DEFAULT_CHECK_GRACE_MS: i64 = 24 * 60 * 60 * 1000;

/// Default window during which a nonzero refcount protects an object: 1 h.
pub const DEFAULT_REFCOUNT_TTL_MS: i64 = 60 * 60 * 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS algorithms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL
);
CREATE TABLE IF NOT EXISTS volumes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    priority INTEGER,
    capacity INTEGER,
    status INTEGER NOT NULL DEFAULT 3,
    metadata TEXT
);
CREATE TABLE IF NOT EXISTS objects (
    objid TEXT NOT NULL,
    name TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT -1,
    checksum TEXT,
    algorithm INTEGER REFERENCES algorithms(id),
    priority INTEGER NOT NULL DEFAULT 10,
    volume INTEGER NOT NULL REFERENCES volumes(id),
    since INTEGER NOT NULL,
    checked INTEGER NOT NULL DEFAULT 0,
    refcount INTEGER NOT NULL DEFAULT 0,
    ediid TEXT,
    pdrid TEXT,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS ix_objects_coord ON objects(volume, name);
CREATE INDEX IF NOT EXISTS ix_objects_objid ON objects(objid);
CREATE INDEX IF NOT EXISTS ix_objects_checked ON objects(checked);
";

const OBJECT_COLUMNS: &str = "o.objid, o.name, v.name, o.size, o.checksum, a.name, \
     o.priority, o.since, o.checked, o.metadata";

const OBJECT_FROM: &str = "FROM objects o \
     JOIN volumes v ON o.volume = v.id \
     LEFT JOIN algorithms a ON o.algorithm = a.id";

#[derive(Debug, Clone)]
struct VolumeRow {
    id: i64,
    capacity: i64,
    priority: i64,
    status: VolumeStatus,
    metadata: Option<String>,
}

/// SQLite implementation of [`InventoryReader`] + [`InventoryMutator`].
///
/// Owns its connection outright; dropping the inventory closes it.
pub struct SqliteInventory {
    conn: Mutex<Connection>,
    clock: std::sync::Arc<dyn ClockSource>,
    check_grace_ms: AtomicI64,
    refcount_ttl_ms: AtomicI64,
    volumes: RwLock<HashMap<String, VolumeRow>>,
    algorithms: RwLock<HashMap<String, i64>>,
}

impl SqliteInventory {
    /// Opens (creating if needed) an inventory database at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or the schema cannot be
    /// applied.
    pub fn open(
        path: impl AsRef<Path>,
        clock: std::sync::Arc<dyn ClockSource>,
    ) -> Result<Self, InventoryError> {
        Self::from_connection(Connection::open(path)?, clock)
    }

    /// Opens a throwaway in-memory inventory.
    ///
    /// # Errors
    ///
    /// Fails when the schema cannot be applied.
    pub fn in_memory(clock: std::sync::Arc<dyn ClockSource>) -> Result<Self, InventoryError> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    fn from_connection(
        conn: Connection,
        clock: std::sync::Arc<dyn ClockSource>,
    ) -> Result<Self, InventoryError> {
        conn.execute_batch(SCHEMA)?;
        // Seed the default algorithm so its id is stable for the life of
        // the database file.
        conn.execute(
            "INSERT OR IGNORE INTO algorithms (name) VALUES (?1)",
            params![SHA256],
        )?;

        let inventory = Self {
            conn: Mutex::new(conn),
            clock,
            check_grace_ms: AtomicI64::new(DEFAULT_CHECK_GRACE_MS),
            refcount_ttl_ms: AtomicI64::new(DEFAULT_REFCOUNT_TTL_MS),
            volumes: RwLock::new(HashMap::new()),
            algorithms: RwLock::new(HashMap::new()),
        };
        inventory.reload_caches()?;
        Ok(inventory)
    }

    /// Sets how long a nonzero refcount protects an object from eviction.
    pub fn set_refcount_ttl(&self, ms: i64) {
        self.refcount_ttl_ms.store(ms, Ordering::SeqCst);
    }

    /// Reloads the in-memory volume and algorithm maps from the database.
    fn reload_caches(&self) -> Result<(), InventoryError> {
        let (volumes, algorithms) = {
            let conn = self.conn.lock();

            let mut volumes = HashMap::new();
            {
                let mut stmt = conn
                    .prepare("SELECT name, id, capacity, priority, status, metadata FROM volumes")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        VolumeRow {
                            id: row.get(1)?,
                            capacity: row.get::<_, Option<i64>>(2)?.unwrap_or(-1),
                            priority: row.get::<_, Option<i64>>(3)?.unwrap_or(DEFAULT_PRIORITY),
                            status: VolumeStatus::from_i64(row.get(4)?),
                            metadata: row.get(5)?,
                        },
                    ))
                })?;
                for row in rows {
                    let (name, vol) = row?;
                    volumes.insert(name, vol);
                }
            }

            let mut algorithms = HashMap::new();
            {
                let mut stmt = conn.prepare("SELECT name, id FROM algorithms")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (name, id) = row?;
                    algorithms.insert(name, id);
                }
            }

            (volumes, algorithms)
        };

        *self.volumes.write() = volumes;
        *self.algorithms.write() = algorithms;
        Ok(())
    }

    fn volume_row(&self, name: &str) -> Result<VolumeRow, InventoryError> {
        self.volumes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| InventoryError::VolumeNotFound {
                name: name.to_string(),
            })
    }

    fn query_objects<P: rusqlite::Params>(
        &self,
        where_clause: &str,
        order_clause: &str,
        bind: P,
    ) -> Result<Vec<CacheObject>, InventoryError> {
        let sql =
            format!("SELECT {OBJECT_COLUMNS} {OBJECT_FROM} WHERE {where_clause} {order_clause}");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(bind)?;
        let mut objects = Vec::new();
        while let Some(row) = rows.next()? {
            objects.push(row_to_object(row)?);
        }
        Ok(objects)
    }
}

fn row_to_object(row: &Row<'_>) -> Result<CacheObject, InventoryError> {
    let id: String = row.get(0)?;
    let checksum_hex: Option<String> = row.get(4)?;
    let algorithm: Option<String> = row.get(5)?;
    let raw_metadata: Option<String> = row.get(9)?;

    let metadata = match raw_metadata {
        Some(raw) if !raw.is_empty() => {
            ObjectMetadata::from_json(&raw).map_err(|e| InventoryError::Metadata {
                id: id.clone(),
                reason: e.to_string(),
            })?
        }
        _ => ObjectMetadata::new(),
    };

    Ok(CacheObject {
        id,
        name: row.get(1)?,
        volume: row.get(2)?,
        size: row.get(3)?,
        checksum: checksum_hex.map(|hex| Checksum {
            hex,
            algorithm: algorithm.unwrap_or_else(|| SHA256.to_string()),
        }),
        priority: row.get(6)?,
        since: row.get(7)?,
        checked: row.get(8)?,
        metadata,
    })
}

/// Reads a lifted integer key, distinguishing "absent" from "wrong type".
fn lifted_i64(
    metadata: &ObjectMetadata,
    key: &str,
    default: i64,
    id: &str,
) -> Result<i64, InventoryError> {
    match metadata.get(key) {
        None => Ok(default),
        Some(value) => value.as_i64().ok_or_else(|| InventoryError::Metadata {
            id: id.to_string(),
            reason: format!("{key} is not an integer"),
        }),
    }
}

fn lifted_str<'m>(
    metadata: &'m ObjectMetadata,
    key: &str,
    id: &str,
) -> Result<Option<&'m str>, InventoryError> {
    match metadata.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(InventoryError::Metadata {
            id: id.to_string(),
            reason: format!("{key} is not a string"),
        }),
    }
}

impl InventoryReader for SqliteInventory {
    fn find_object(
        &self,
        id: &str,
        volume: Option<&str>,
    ) -> Result<Vec<CacheObject>, InventoryError> {
        match volume {
            Some(vol) => self.query_objects(
                "o.objid = ?1 AND v.name = ?2",
                "ORDER BY o.since DESC",
                params![id, vol],
            ),
            None => self.query_objects("o.objid = ?1", "ORDER BY o.since DESC", params![id]),
        }
    }

    fn select_objects_like_id(
        &self,
        pattern: &str,
        min_status: VolumeStatus,
    ) -> Result<Vec<CacheObject>, InventoryError> {
        let like = pattern.replace('*', "%");
        self.query_objects(
            "o.objid LIKE ?1 AND v.status >= ?2",
            "ORDER BY o.objid",
            params![like, min_status.as_i64()],
        )
    }

    fn get_volume_info(&self, name: &str) -> Result<VolumeInfo, InventoryError> {
        let row = self.volume_row(name)?;
        let mut metadata = match &row.metadata {
            Some(raw) if !raw.is_empty() => {
                ObjectMetadata::from_json(raw).map_err(|e| InventoryError::Metadata {
                    id: name.to_string(),
                    reason: e.to_string(),
                })?
            }
            _ => ObjectMetadata::new(),
        };
        metadata.set("capacity", Value::from(row.capacity));
        metadata.set_priority(row.priority);

        Ok(VolumeInfo {
            name: name.to_string(),
            capacity: row.capacity,
            priority: row.priority,
            status: row.status,
            metadata,
        })
    }

    fn get_volume_totals(&self, name: &str) -> Result<VolumeTotals, InventoryError> {
        let row = self.volume_row(name)?;
        let conn = self.conn.lock();
        let (filecount, totalsize, since, checked) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), COALESCE(MAX(since), 0), \
                    COALESCE(MIN(checked), 0) \
             FROM objects WHERE volume = ?1",
            params![row.id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )?;

        Ok(VolumeTotals {
            filecount,
            totalsize,
            since,
            since_date: iso8601_utc(since),
            checked,
            checked_date: iso8601_utc(checked),
        })
    }

    fn volume_names(&self) -> Result<Vec<String>, InventoryError> {
        let mut names: Vec<String> = self.volumes.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn summarize_dataset(&self, dsid: &str) -> Result<DatasetSummary, InventoryError> {
        let conn = self.conn.lock();
        let file_prefix = format!("{dsid}/%");
        let version_prefix = format!("{dsid}#%");
        let summary = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), COALESCE(MAX(since), 0), \
                    COALESCE(MIN(checked), 0), MAX(ediid), MAX(pdrid) \
             FROM objects \
             WHERE objid = ?1 OR objid LIKE ?2 OR objid LIKE ?3",
            params![dsid, file_prefix, version_prefix],
            |r| {
                Ok(DatasetSummary {
                    dsid: dsid.to_string(),
                    filecount: r.get(0)?,
                    totalsize: r.get(1)?,
                    since: r.get(2)?,
                    since_date: String::new(),
                    checked: r.get(3)?,
                    checked_date: String::new(),
                    ediid: r.get(4)?,
                    pdrid: r.get(5)?,
                })
            },
        )?;

        Ok(DatasetSummary {
            since_date: iso8601_utc(summary.since),
            checked_date: iso8601_utc(summary.checked),
            ..summary
        })
    }

    fn summarize_contents(
        &self,
        volume: Option<&str>,
    ) -> Result<Vec<DatasetSummary>, InventoryError> {
        let volume_id = volume.map(|v| self.volume_row(v)).transpose()?.map(|r| r.id);
        let conn = self.conn.lock();

        let sql = format!(
            "SELECT CASE WHEN instr(objid, '/') > 0 \
                         THEN substr(objid, 1, instr(objid, '/') - 1) \
                         ELSE objid END AS dsid, \
                    COUNT(*), COALESCE(SUM(size), 0), COALESCE(MAX(since), 0), \
                    COALESCE(MIN(checked), 0), MAX(ediid), MAX(pdrid) \
             FROM objects {} GROUP BY dsid ORDER BY dsid",
            if volume_id.is_some() {
                "WHERE volume = ?1"
            } else {
                ""
            }
        );
        let mut stmt = conn.prepare(&sql)?;

        let collect = |row: &Row<'_>| -> rusqlite::Result<DatasetSummary> {
            let since: i64 = row.get(3)?;
            let checked: i64 = row.get(4)?;
            Ok(DatasetSummary {
                dsid: row.get(0)?,
                filecount: row.get(1)?,
                totalsize: row.get(2)?,
                since,
                since_date: iso8601_utc(since),
                checked,
                checked_date: iso8601_utc(checked),
                ediid: row.get(5)?,
                pdrid: row.get(6)?,
            })
        };

        let rows = match volume_id {
            Some(id) => stmt.query_map(params![id], collect)?,
            None => stmt.query_map([], collect)?,
        };
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    fn select_objects_to_purge(
        &self,
        volume: &str,
        required_bytes: i64,
    ) -> Result<Vec<CacheObject>, InventoryError> {
        // Confirm registration before querying so unknown volumes fail
        // loudly instead of returning an empty candidate list.
        self.volume_row(volume)?;

        let now = self.clock.now_ms();
        let ttl = self.refcount_ttl_ms.load(Ordering::SeqCst);
        let candidates = self.query_objects(
            "v.name = ?1 AND v.status >= ?2 \
             AND NOT (o.refcount > 0 AND (?3 - o.since) < ?4)",
            "ORDER BY o.priority DESC, o.since ASC, o.size DESC",
            params![volume, VolumeStatus::ForGet.as_i64(), now, ttl],
        )?;

        let mut selected = Vec::new();
        let mut accumulated: i64 = 0;
        for object in candidates {
            if accumulated >= required_bytes {
                break;
            }
            accumulated += object.size.max(0);
            selected.push(object);
        }
        Ok(selected)
    }

    fn select_due_for_check(
        &self,
        volume: &str,
        max: usize,
    ) -> Result<Vec<CacheObject>, InventoryError> {
        self.volume_row(volume)?;
        let now = self.clock.now_ms();
        let grace = self.check_grace_ms.load(Ordering::SeqCst);
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        self.query_objects(
            "v.name = ?1 AND (?2 - o.checked) >= ?3",
            "ORDER BY o.checked ASC LIMIT ?4",
            params![volume, now, grace, limit],
        )
    }
}

impl InventoryMutator for SqliteInventory {
    fn add_object(
        &self,
        id: &str,
        volume: &str,
        name: &str,
        metadata: &ObjectMetadata,
    ) -> Result<CacheObject, InventoryError> {
        let volume_row = self.volume_row(volume)?;

        let size = lifted_i64(metadata, keys::SIZE, -1, id)?;
        let priority = lifted_i64(metadata, keys::PRIORITY, DEFAULT_PRIORITY, id)?;
        let refcount = lifted_i64(metadata, keys::REFCOUNT, 0, id)?;
        let checksum = lifted_str(metadata, keys::CHECKSUM, id)?.map(str::to_string);
        let algorithm_name = lifted_str(metadata, keys::CHECKSUM_ALGORITHM, id)?
            .unwrap_or(SHA256)
            .to_string();
        let ediid = lifted_str(metadata, keys::EDIID, id)?.map(str::to_string);
        let pdrid = lifted_str(metadata, keys::PDRID, id)?.map(str::to_string);

        let now = self.clock.now_ms();
        let blob = metadata.to_json();

        let algorithm_id = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            // Algorithms named in metadata are registered lazily.
            let algorithm_id: i64 = match tx
                .query_row(
                    "SELECT id FROM algorithms WHERE name = ?1",
                    params![algorithm_name],
                    |r| r.get(0),
                )
                .optional()?
            {
                Some(existing) => existing,
                None => {
                    tx.execute(
                        "INSERT INTO algorithms (name) VALUES (?1)",
                        params![algorithm_name],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            // Idempotence at the coordinate: clear any prior rows, then
            // insert, all inside one transaction.
            tx.execute(
                "DELETE FROM objects WHERE volume = ?1 AND name = ?2",
                params![volume_row.id, name],
            )?;
            tx.execute(
                "INSERT INTO objects (objid, name, size, checksum, algorithm, priority, \
                                      volume, since, checked, refcount, ediid, pdrid, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    name,
                    size,
                    checksum,
                    algorithm_id,
                    priority,
                    volume_row.id,
                    now,
                    refcount,
                    ediid,
                    pdrid,
                    blob
                ],
            )?;
            tx.commit()?;
            algorithm_id
        };

        self.algorithms
            .write()
            .insert(algorithm_name.clone(), algorithm_id);
        debug!(id, volume, name, size, "inventory row added");

        Ok(CacheObject {
            id: id.to_string(),
            name: name.to_string(),
            volume: volume.to_string(),
            size,
            checksum: checksum.map(|hex| Checksum {
                hex,
                algorithm: algorithm_name,
            }),
            priority,
            since: now,
            checked: 0,
            metadata: metadata.clone(),
        })
    }

    fn remove_object(&self, volume: &str, name: &str) -> Result<bool, InventoryError> {
        let volume_row = self.volume_row(volume)?;
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM objects WHERE volume = ?1 AND name = ?2",
            params![volume_row.id, name],
        )?;
        Ok(removed > 0)
    }

    fn update_checked(&self, volume: &str, name: &str, when: i64) -> Result<(), InventoryError> {
        let volume_row = self.volume_row(volume)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE objects SET checked = ?1 WHERE volume = ?2 AND name = ?3",
            params![when, volume_row.id, name],
        )?;
        Ok(())
    }

    fn register_algorithm(&self, name: &str) -> Result<(), InventoryError> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO algorithms (name) VALUES (?1)",
                params![name],
            )?;
        }
        self.reload_caches()
    }

    fn register_volume(
        &self,
        name: &str,
        capacity: i64,
        metadata: &ObjectMetadata,
    ) -> Result<(), InventoryError> {
        let priority = lifted_i64(metadata, keys::PRIORITY, DEFAULT_PRIORITY, name)?;
        let blob = metadata.to_json();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO volumes (name, capacity, priority, status, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(name) DO UPDATE SET \
                     capacity = excluded.capacity, \
                     priority = excluded.priority, \
                     metadata = excluded.metadata",
                params![
                    name,
                    capacity,
                    priority,
                    VolumeStatus::ForUpdate.as_i64(),
                    blob
                ],
            )?;
        }
        self.reload_caches()
    }

    fn set_volume_status(
        &self,
        name: &str,
        status: VolumeStatus,
    ) -> Result<(), InventoryError> {
        let changed = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE volumes SET status = ?1 WHERE name = ?2",
                params![status.as_i64(), name],
            )?
        };
        if changed == 0 {
            return Err(InventoryError::VolumeNotFound {
                name: name.to_string(),
            });
        }
        self.reload_caches()
    }

    fn set_check_grace_period(&self, ms: i64) {
        self.check_grace_ms.store(ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdrcache_core::ManualClock;

    use super::*;

    fn setup() -> (SqliteInventory, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let inventory = SqliteInventory::in_memory(clock.clone()).unwrap();
        inventory
            .register_volume("cranberry", 100_000, &ObjectMetadata::new())
            .unwrap();
        (inventory, clock)
    }

    fn meta(size: i64, priority: i64) -> ObjectMetadata {
        let mut m = ObjectMetadata::new();
        m.set_size(size);
        m.set_priority(priority);
        m
    }

    #[test]
    fn add_and_find_object() {
        let (inv, _) = setup();
        let mut m = meta(100, 10);
        m.set_checksum(&Checksum::sha256("abcdef"));

        let added = inv
            .add_object("mds2-2119/readme.txt", "cranberry", "mds2-2119/readme.txt", &m)
            .unwrap();
        assert_eq!(added.since, 1_000_000);
        assert_eq!(added.checked, 0);

        let found = inv.find_object("mds2-2119/readme.txt", None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].size, 100);
        assert_eq!(found[0].checksum.as_ref().unwrap().hex, "abcdef");
        assert_eq!(found[0].checksum.as_ref().unwrap().algorithm, SHA256);
        assert_eq!(found[0].metadata, m);
    }

    #[test]
    fn add_object_is_idempotent_at_coordinate() {
        let (inv, clock) = setup();
        inv.add_object("a/f.txt", "cranberry", "a/f.txt", &meta(10, 10))
            .unwrap();

        clock.advance(5_000);
        let mut updated = meta(20, 4);
        updated.set("note", serde_json::json!("refreshed"));
        inv.add_object("a/f.txt", "cranberry", "a/f.txt", &updated)
            .unwrap();

        let found = inv.find_object("a/f.txt", None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].size, 20);
        assert_eq!(found[0].priority, 4);
        assert_eq!(found[0].since, 1_005_000);
        assert_eq!(
            found[0].metadata.get("note").and_then(Value::as_str),
            Some("refreshed")
        );
    }

    #[test]
    fn add_object_unknown_volume_fails() {
        let (inv, _) = setup();
        let err = inv
            .add_object("a/f.txt", "nope", "a/f.txt", &meta(1, 10))
            .unwrap_err();
        assert!(matches!(err, InventoryError::VolumeNotFound { .. }));
    }

    #[test]
    fn add_object_rejects_non_integer_size() {
        let (inv, _) = setup();
        let mut m = ObjectMetadata::new();
        m.set("size", serde_json::json!("big"));
        let err = inv
            .add_object("a/f.txt", "cranberry", "a/f.txt", &m)
            .unwrap_err();
        assert!(matches!(err, InventoryError::Metadata { .. }));
    }

    #[test]
    fn remove_object_reports_presence() {
        let (inv, _) = setup();
        inv.add_object("a/f.txt", "cranberry", "a/f.txt", &meta(1, 10))
            .unwrap();
        assert!(inv.remove_object("cranberry", "a/f.txt").unwrap());
        assert!(!inv.remove_object("cranberry", "a/f.txt").unwrap());
        assert!(inv.find_object("a/f.txt", None).unwrap().is_empty());
    }

    #[test]
    fn remove_object_unknown_volume_fails() {
        let (inv, _) = setup();
        assert!(matches!(
            inv.remove_object("nope", "a/f.txt"),
            Err(InventoryError::VolumeNotFound { .. })
        ));
    }

    #[test]
    fn register_algorithm_twice_leaves_one_row() {
        let (inv, _) = setup();
        inv.register_algorithm("md5").unwrap();
        inv.register_algorithm("md5").unwrap();

        let conn = inv.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM algorithms WHERE name = 'md5'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn register_volume_upserts() {
        let (inv, _) = setup();
        let mut m = ObjectMetadata::new();
        m.set_priority(3);
        inv.register_volume("cranberry", 250_000, &m).unwrap();

        let info = inv.get_volume_info("cranberry").unwrap();
        assert_eq!(info.capacity, 250_000);
        assert_eq!(info.priority, 3);
        assert_eq!(info.metadata.get("capacity").unwrap(), 250_000);

        let names = inv.volume_names().unwrap();
        assert_eq!(names, vec!["cranberry"]);
    }

    #[test]
    fn volume_status_round_trip() {
        let (inv, _) = setup();
        assert_eq!(
            inv.get_volume_info("cranberry").unwrap().status,
            VolumeStatus::ForUpdate
        );

        inv.set_volume_status("cranberry", VolumeStatus::ForInfo)
            .unwrap();
        assert_eq!(
            inv.get_volume_info("cranberry").unwrap().status,
            VolumeStatus::ForInfo
        );

        assert!(matches!(
            inv.set_volume_status("nope", VolumeStatus::ForGet),
            Err(InventoryError::VolumeNotFound { .. })
        ));
    }

    #[test]
    fn volume_totals_aggregate_live_rows() {
        let (inv, clock) = setup();
        inv.add_object("a/1.dat", "cranberry", "a/1.dat", &meta(60, 10))
            .unwrap();
        clock.advance(1_000);
        inv.add_object("a/2.dat", "cranberry", "a/2.dat", &meta(40, 10))
            .unwrap();

        let totals = inv.get_volume_totals("cranberry").unwrap();
        assert_eq!(totals.filecount, 2);
        assert_eq!(totals.totalsize, 100);
        assert_eq!(totals.since, 1_001_000);
        assert_eq!(totals.checked, 0);
        assert_eq!(totals.checked_date, "");
    }

    #[test]
    fn like_query_respects_min_status() {
        let (inv, _) = setup();
        inv.add_object("mds2-2119/a.dat", "cranberry", "mds2-2119/a.dat", &meta(1, 10))
            .unwrap();

        let hits = inv
            .select_objects_like_id("mds2-2119/*", VolumeStatus::ForGet)
            .unwrap();
        assert_eq!(hits.len(), 1);

        inv.set_volume_status("cranberry", VolumeStatus::ForInfo)
            .unwrap();
        let hits = inv
            .select_objects_like_id("mds2-2119/*", VolumeStatus::ForGet)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn dataset_summary_covers_files_and_versions() {
        let (inv, _) = setup();
        let mut m = meta(10, 10);
        m.set("ediid", serde_json::json!("ark:/88434/mds2-2119"));
        inv.add_object("mds2-2119/a.dat", "cranberry", "mds2-2119/a.dat", &m)
            .unwrap();
        inv.add_object(
            "mds2-2119/b.dat#1.0",
            "cranberry",
            "mds2-2119/_v/1.0/b.dat",
            &meta(5, 10),
        )
        .unwrap();
        inv.add_object("other-404/x.dat", "cranberry", "other-404/x.dat", &meta(7, 10))
            .unwrap();

        let summary = inv.summarize_dataset("mds2-2119").unwrap();
        assert_eq!(summary.filecount, 2);
        assert_eq!(summary.totalsize, 15);
        assert_eq!(summary.ediid.as_deref(), Some("ark:/88434/mds2-2119"));

        let contents = inv.summarize_contents(None).unwrap();
        let dsids: Vec<&str> = contents.iter().map(|s| s.dsid.as_str()).collect();
        assert_eq!(dsids, vec!["mds2-2119", "other-404"]);
    }

    #[test]
    fn purge_selection_orders_and_accumulates() {
        let (inv, clock) = setup();
        // Old, unimportant, large -- the first victim.
        inv.add_object("a/old.dat", "cranberry", "a/old.dat", &meta(80, 10))
            .unwrap();
        clock.advance(1_000);
        // Important object, same size tier.
        inv.add_object("a/keep.dat", "cranberry", "a/keep.dat", &meta(20, 5))
            .unwrap();

        let victims = inv.select_objects_to_purge("cranberry", 30).unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, "a/old.dat");
    }

    #[test]
    fn purge_selection_skips_fresh_refcounts() {
        let (inv, _) = setup();
        let mut pinned = meta(50, 10);
        pinned.set_refcount(1);
        inv.add_object("a/pinned.dat", "cranberry", "a/pinned.dat", &pinned)
            .unwrap();
        inv.add_object("a/free.dat", "cranberry", "a/free.dat", &meta(50, 10))
            .unwrap();

        let victims = inv.select_objects_to_purge("cranberry", 40).unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, "a/free.dat");
    }

    #[test]
    fn purge_selection_may_fall_short() {
        let (inv, _) = setup();
        inv.add_object("a/only.dat", "cranberry", "a/only.dat", &meta(10, 10))
            .unwrap();

        let victims = inv.select_objects_to_purge("cranberry", 1_000).unwrap();
        assert_eq!(victims.len(), 1);
    }

    #[test]
    fn due_for_check_honors_grace_and_order() {
        let (inv, clock) = setup();
        inv.set_check_grace_period(10_000);
        inv.add_object("a/1.dat", "cranberry", "a/1.dat", &meta(1, 10))
            .unwrap();
        inv.add_object("a/2.dat", "cranberry", "a/2.dat", &meta(1, 10))
            .unwrap();
        inv.update_checked("cranberry", "a/2.dat", clock.now_ms())
            .unwrap();

        // Immediately after, only the never-checked object is due.
        let due = inv.select_due_for_check("cranberry", 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "a/1.dat");

        // Once the grace period passes, both are due, oldest check first.
        clock.advance(10_001);
        let due = inv.select_due_for_check("cranberry", 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, "a/1.dat");

        let due = inv.select_due_for_check("cranberry", 1).unwrap();
        assert_eq!(due.len(), 1);
    }
}
