//! C1: blob store with partitions.
//!
//! one physical table (`blobs`) holds every unique byte sequence in the
//! repository, keyed by its blake3 id. `partitions` and `partition_blobs`
//! track, per asset, which blobs that asset's content currently reaches;
//! dropping a partition frees any blob no other partition still references.
//!
//! every operation here takes an open transaction: callers compose these
//! with asset/snapshot writes so the whole logical operation is atomic.

use rusqlite::{params, OptionalExtension, Transaction};

use crate::db::MAX_BLOB_SIZE;
use crate::error::{Error, Result};
use crate::hash::Hash;

pub type PartitionId = i64;

/// allocate a fresh partition id. ids are never reused.
pub fn create_partition(tx: &Transaction<'_>) -> Result<PartitionId> {
    tx.execute("INSERT INTO partitions DEFAULT VALUES", [])?;
    Ok(tx.last_insert_rowid())
}

/// remove a partition, then delete every blob no surviving partition holds.
pub fn drop_partition(tx: &Transaction<'_>, pid: PartitionId) -> Result<()> {
    let mut owned_stmt = tx.prepare("SELECT blob_id FROM partition_blobs WHERE partition_id = ?1")?;
    let owned: Vec<Hash> = owned_stmt
        .query_map(params![pid], |row| row_hash(row, 0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(owned_stmt);

    tx.execute("DELETE FROM partition_blobs WHERE partition_id = ?1", params![pid])?;
    tx.execute("DELETE FROM partitions WHERE id = ?1", params![pid])?;

    for id in owned {
        let still_referenced: i64 = tx.query_row(
            "SELECT COUNT(*) FROM partition_blobs WHERE blob_id = ?1",
            params![id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        if still_referenced == 0 {
            tx.execute("DELETE FROM blobs WHERE id = ?1", params![id.as_bytes().as_slice()])?;
        }
    }
    Ok(())
}

/// insert `bytes` if absent, link into `pid` if absent. idempotent.
pub fn post(tx: &Transaction<'_>, pid: PartitionId, bytes: &[u8]) -> Result<Hash> {
    if bytes.len() as u64 > MAX_BLOB_SIZE {
        return Err(Error::TooLarge {
            size: bytes.len() as u64,
            limit: MAX_BLOB_SIZE,
        });
    }
    let id = Hash::of(bytes);
    tx.execute(
        "INSERT OR IGNORE INTO blobs (id, data) VALUES (?1, ?2)",
        params![id.as_bytes().as_slice(), bytes],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO partition_blobs (partition_id, blob_id) VALUES (?1, ?2)",
        params![pid, id.as_bytes().as_slice()],
    )?;
    Ok(id)
}

/// copy the blob's bytes into `buf`, returning the number of bytes copied.
/// fails with `NotFound` if `id` is not linked to `pid`, `ShortBuffer` if
/// `buf` cannot hold the whole blob.
pub fn get_into(tx: &Transaction<'_>, pid: PartitionId, id: &Hash, buf: &mut [u8]) -> Result<usize> {
    let data = get(tx, pid, id)?;
    if buf.len() < data.len() {
        return Err(Error::ShortBuffer {
            need: data.len(),
            have: buf.len(),
        });
    }
    buf[..data.len()].copy_from_slice(&data);
    Ok(data.len())
}

/// fetch the blob's bytes directly, without a caller-supplied buffer.
pub fn get(tx: &Transaction<'_>, pid: PartitionId, id: &Hash) -> Result<Vec<u8>> {
    let linked: bool = tx
        .query_row(
            "SELECT 1 FROM partition_blobs WHERE partition_id = ?1 AND blob_id = ?2",
            params![pid, id.as_bytes().as_slice()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !linked {
        return Err(Error::NotFound(*id));
    }
    tx.query_row(
        "SELECT data FROM blobs WHERE id = ?1",
        params![id.as_bytes().as_slice()],
        |row| row.get(0),
    )
    .map_err(|_| Error::NotFound(*id))
}

/// link an existing blob into `pid`. fails if the blob exists in no
/// partition at all.
pub fn add(tx: &Transaction<'_>, pid: PartitionId, id: &Hash) -> Result<()> {
    let exists_anywhere: bool = tx
        .query_row(
            "SELECT 1 FROM partition_blobs WHERE blob_id = ?1 LIMIT 1",
            params![id.as_bytes().as_slice()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists_anywhere {
        return Err(Error::NotFound(*id));
    }
    tx.execute(
        "INSERT OR IGNORE INTO partition_blobs (partition_id, blob_id) VALUES (?1, ?2)",
        params![pid, id.as_bytes().as_slice()],
    )?;
    Ok(())
}

/// unlink a blob from `pid`; delete it entirely if no partition still
/// references it.
pub fn delete(tx: &Transaction<'_>, pid: PartitionId, id: &Hash) -> Result<()> {
    tx.execute(
        "DELETE FROM partition_blobs WHERE partition_id = ?1 AND blob_id = ?2",
        params![pid, id.as_bytes().as_slice()],
    )?;
    let still_referenced: i64 = tx.query_row(
        "SELECT COUNT(*) FROM partition_blobs WHERE blob_id = ?1",
        params![id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    if still_referenced == 0 {
        tx.execute("DELETE FROM blobs WHERE id = ?1", params![id.as_bytes().as_slice()])?;
    }
    Ok(())
}

/// list up to `out.len()` blob ids linked to `pid`, `>= lower_bound`,
/// ascending. returns the number written.
pub fn list(
    tx: &Transaction<'_>,
    pid: PartitionId,
    lower_bound: &Hash,
    out: &mut [Hash],
) -> Result<usize> {
    let mut stmt = tx.prepare(
        "SELECT blob_id FROM partition_blobs WHERE partition_id = ?1 AND blob_id >= ?2
         ORDER BY blob_id ASC LIMIT ?3",
    )?;
    let rows = stmt.query_map(
        params![pid, lower_bound.as_bytes().as_slice(), out.len() as i64],
        |row| row_hash(row, 0),
    )?;
    let mut n = 0;
    for row in rows {
        out[n] = row?;
        n += 1;
    }
    Ok(n)
}

fn row_hash(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Hash> {
    let bytes: Vec<u8> = row.get(idx)?;
    let mut arr = [0u8; 32];
    if bytes.len() == 32 {
        arr.copy_from_slice(&bytes);
    }
    Ok(Hash::from_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE blobs (id BLOB PRIMARY KEY, data BLOB NOT NULL);
             CREATE TABLE partitions (id INTEGER PRIMARY KEY AUTOINCREMENT);
             CREATE TABLE partition_blobs (partition_id INTEGER NOT NULL, blob_id BLOB NOT NULL, PRIMARY KEY(partition_id, blob_id));",
        )
        .unwrap();
        conn
    }

    #[test]
    fn post_dedups_within_one_partition() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let pid = create_partition(&tx).unwrap();
        let h1 = post(&tx, pid, b"abc").unwrap();
        let h2 = post(&tx, pid, b"abc").unwrap();
        assert_eq!(h1, h2);
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn dedup_across_partitions_and_refcounted_drop() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let p1 = create_partition(&tx).unwrap();
        let p2 = create_partition(&tx).unwrap();
        let h = post(&tx, p1, b"abc").unwrap();
        post(&tx, p2, b"abc").unwrap();

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);

        drop_partition(&tx, p1).unwrap();
        assert!(get(&tx, p2, &h).is_ok());

        drop_partition(&tx, p2).unwrap();
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn get_requires_link_to_partition() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let p1 = create_partition(&tx).unwrap();
        let p2 = create_partition(&tx).unwrap();
        let h = post(&tx, p1, b"abc").unwrap();
        assert!(matches!(get(&tx, p2, &h), Err(Error::NotFound(_))));
    }

    #[test]
    fn get_into_short_buffer() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let pid = create_partition(&tx).unwrap();
        let h = post(&tx, pid, b"hello world").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            get_into(&tx, pid, &h, &mut buf),
            Err(Error::ShortBuffer { .. })
        ));
        let mut buf = [0u8; 64];
        let n = get_into(&tx, pid, &h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn post_rejects_oversized_blob() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let pid = create_partition(&tx).unwrap();
        let big = vec![0u8; (MAX_BLOB_SIZE + 1) as usize];
        assert!(matches!(post(&tx, pid, &big), Err(Error::TooLarge { .. })));
    }

    #[test]
    fn add_requires_blob_to_exist_somewhere() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let p1 = create_partition(&tx).unwrap();
        let p2 = create_partition(&tx).unwrap();
        let fake = Hash::of(b"never posted");
        assert!(matches!(add(&tx, p2, &fake), Err(Error::NotFound(_))));

        let real = post(&tx, p1, b"real").unwrap();
        add(&tx, p2, &real).unwrap();
        assert!(get(&tx, p2, &real).is_ok());
    }

    #[test]
    fn list_returns_ascending_from_lower_bound() {
        let mut conn = open();
        let tx = conn.transaction().unwrap();
        let pid = create_partition(&tx).unwrap();
        post(&tx, pid, b"one").unwrap();
        post(&tx, pid, b"two").unwrap();
        post(&tx, pid, b"three").unwrap();

        let mut out = [Hash::ZERO; 10];
        let n = list(&tx, pid, &Hash::ZERO, &mut out).unwrap();
        assert_eq!(n, 3);
        for w in out[..n].windows(2) {
            assert!(w[0] <= w[1]);
        }
    }
}
