//! C5: the snapshot and commit graph.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use rusqlite::{params, OptionalExtension};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::tree::{self, Ref, VoidStore};

fn tld_name_re() -> Regex {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex")
}

fn validate_tld_name(name: &str) -> Result<()> {
    if tld_name_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// the deterministic identity of a `{name -> Ref}` mapping: the content id
/// that posting it as a canonical tree against a real store would produce,
/// computed against a store that discards bytes.
pub fn snapshot_identity(tlds: &BTreeMap<String, Ref>) -> Result<Hash> {
    let mut void = VoidStore;
    let r = tree::post_tree_from_map(&mut void, tlds)?;
    Ok(r.content_id)
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub cid: Hash,
    pub tlds: BTreeMap<String, Ref>,
}

#[derive(Clone, Debug)]
pub struct Commit {
    pub id: i64,
    pub snapshot_cid: Hash,
    pub created_at: i64,
}

/// validate, compute identity, and insert if absent (idempotent).
pub async fn post_snapshot(db: &Db, tlds: BTreeMap<String, Ref>) -> Result<Hash> {
    for name in tlds.keys() {
        validate_tld_name(name)?;
    }
    let cid = snapshot_identity(&tlds)?;

    db.transaction(move |tx| {
        if tx
            .query_row("SELECT id FROM snapshots WHERE cid = ?1", params![cid.as_bytes().as_slice()], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?
            .is_some()
        {
            return Ok(());
        }

        tx.execute("INSERT INTO snapshots (cid) VALUES (?1)", params![cid.as_bytes().as_slice()])?;
        let snap_id = tx.last_insert_rowid();
        for (name, r) in &tlds {
            let json = serde_json::to_string(r)?;
            tx.execute(
                "INSERT INTO snapshot_tlds (snapshot_id, name, root_json) VALUES (?1, ?2, ?3)",
                params![snap_id, name, json],
            )?;
        }
        Ok(())
    })
    .await?;

    Ok(cid)
}

pub async fn get_snapshot(db: &Db, cid: Hash) -> Result<Snapshot> {
    db.transaction(move |tx| {
        let snap_id: i64 = tx
            .query_row("SELECT id FROM snapshots WHERE cid = ?1", params![cid.as_bytes().as_slice()], |row| row.get(0))
            .optional()?
            .ok_or(Error::SnapshotNotFound(cid))?;

        let mut stmt = tx.prepare("SELECT name, root_json FROM snapshot_tlds WHERE snapshot_id = ?1")?;
        let rows = stmt.query_map(params![snap_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut tlds = BTreeMap::new();
        for row in rows {
            let (name, json) = row?;
            tlds.insert(name, serde_json::from_str(&json)?);
        }
        Ok(Snapshot { cid, tlds })
    })
    .await
}

pub async fn list_snapshots(db: &Db) -> Result<Vec<Hash>> {
    db.transaction(|tx| {
        let mut stmt = tx.prepare("SELECT cid FROM snapshots ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            let bytes: Vec<u8> = row.get(0)?;
            let mut arr = [0u8; 32];
            if bytes.len() == 32 {
                arr.copy_from_slice(&bytes);
            }
            Ok(Hash::from_bytes(arr))
        })?;
        rows.collect::<rusqlite::Result<Vec<Hash>>>().map_err(Error::from)
    })
    .await
}

/// load `cid`'s tlds, apply `f` to a mutable copy, post the result. returns
/// the new snapshot's id (which may equal `cid` if `f` was a no-op, since
/// posting is content-addressed).
pub async fn modify_snapshot(db: &Db, cid: Hash, f: impl FnOnce(&mut BTreeMap<String, Ref>)) -> Result<Hash> {
    let snapshot = get_snapshot(db, cid).await?;
    let mut tlds = snapshot.tlds;
    f(&mut tlds);
    post_snapshot(db, tlds).await
}

/// resolve `snap_cid`, append a commit row, then invoke `actualize` with the
/// snapshot's tlds. the commit row is written first, so a crash mid-actualize
/// leaves the commit in place for a later re-converging actualize call.
pub async fn deploy<F, Fut>(db: &Db, snap_cid: Hash, actualize: F) -> Result<i64>
where
    F: FnOnce(BTreeMap<String, Ref>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let snapshot = get_snapshot(db, snap_cid).await?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    let commit_id = db
        .transaction(move |tx| {
            let snap_id: i64 = tx.query_row(
                "SELECT id FROM snapshots WHERE cid = ?1",
                params![snap_cid.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO commits (snapshot_id, created_at) VALUES (?1, ?2)",
                params![snap_id, now],
            )?;
            Ok(tx.last_insert_rowid())
        })
        .await?;

    actualize(snapshot.tlds).await?;
    Ok(commit_id)
}

/// read the current commit, apply `f` to its snapshot's tlds (or to an empty
/// map if there is no current commit), post the result, and deploy it.
pub async fn modify<F, Fut>(db: &Db, f: impl FnOnce(&mut BTreeMap<String, Ref>), actualize: F) -> Result<i64>
where
    F: FnOnce(BTreeMap<String, Ref>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match get_current(db).await? {
        None => {
            let mut tlds = BTreeMap::new();
            f(&mut tlds);
            let cid = post_snapshot(db, tlds).await?;
            deploy(db, cid, actualize).await
        }
        Some((_, snap_cid)) => {
            let new_cid = modify_snapshot(db, snap_cid, f).await?;
            deploy(db, new_cid, actualize).await
        }
    }
}

/// the current commit is the one with the greatest id.
pub async fn get_current(db: &Db) -> Result<Option<(i64, Hash)>> {
    db.transaction(|tx| {
        tx.query_row(
            "SELECT commits.id, snapshots.cid FROM commits
             JOIN snapshots ON snapshots.id = commits.snapshot_id
             ORDER BY commits.id DESC LIMIT 1",
            [],
            |row| {
                let id: i64 = row.get(0)?;
                let bytes: Vec<u8> = row.get(1)?;
                let mut arr = [0u8; 32];
                if bytes.len() == 32 {
                    arr.copy_from_slice(&bytes);
                }
                Ok((id, Hash::from_bytes(arr)))
            },
        )
        .optional()
        .map_err(Error::from)
    })
    .await
}

pub async fn list_commits(db: &Db) -> Result<Vec<Commit>> {
    db.transaction(|tx| {
        let mut stmt = tx.prepare(
            "SELECT commits.id, snapshots.cid, commits.created_at FROM commits
             JOIN snapshots ON snapshots.id = commits.snapshot_id
             ORDER BY commits.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            let created_at: i64 = row.get(2)?;
            let mut arr = [0u8; 32];
            if bytes.len() == 32 {
                arr.copy_from_slice(&bytes);
            }
            Ok(Commit {
                id,
                snapshot_cid: Hash::from_bytes(arr),
                created_at,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<Commit>>>().map_err(Error::from)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_ref(content: &[u8]) -> Ref {
        Ref::blob(Hash::of(content), content.len() as u64)
    }

    #[tokio::test]
    async fn post_snapshot_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let mut tlds = BTreeMap::new();
        tlds.insert("a".to_string(), blob_ref(b"a"));

        let id1 = post_snapshot(&db, tlds.clone()).await.unwrap();
        let id2 = post_snapshot(&db, tlds).await.unwrap();
        assert_eq!(id1, id2);

        let count: i64 = db
            .transaction(|tx| tx.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0)).map_err(Error::from))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn snapshot_id_is_order_independent() {
        let db = Db::open_in_memory().unwrap();
        let r1 = blob_ref(b"1");
        let r2 = blob_ref(b"2");

        let mut m1 = BTreeMap::new();
        m1.insert("a".to_string(), r1);
        m1.insert("b".to_string(), r2);

        let mut m2 = BTreeMap::new();
        m2.insert("b".to_string(), r2);
        m2.insert("a".to_string(), r1);

        let id1 = post_snapshot(&db, m1).await.unwrap();
        let id2 = post_snapshot(&db, m2).await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn rejects_invalid_tld_names() {
        let db = Db::open_in_memory().unwrap();
        let mut tlds = BTreeMap::new();
        tlds.insert("bad name!".to_string(), blob_ref(b"x"));
        assert!(matches!(post_snapshot(&db, tlds).await, Err(Error::InvalidName(_))));
    }

    #[tokio::test]
    async fn modify_sequence_yields_strictly_increasing_commits() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..10 {
            let r = blob_ref(format!("tld-{i}").as_bytes());
            modify(
                &db,
                move |tlds| {
                    tlds.insert(format!("tld-{i}"), r);
                },
                |_| async { Ok(()) },
            )
            .await
            .unwrap();
        }

        let commits = list_commits(&db).await.unwrap();
        assert_eq!(commits.len(), 10);
        for w in commits.windows(2) {
            assert!(w[0].id < w[1].id);
        }
        let current = get_current(&db).await.unwrap().unwrap();
        assert_eq!(current.0, commits.last().unwrap().id);
    }
}
