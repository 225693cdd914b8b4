//! C4: the asset and label index.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};
use tokio::sync::mpsc;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::porting;
use crate::predicate::Predicate;
use crate::store::{self, PartitionId};
use crate::tree::Ref;

pub const DEFAULT_LIST_LIMIT: usize = 1000;
pub const MAX_LIST_LIMIT: usize = 10_000;

/// identifies an asset's external origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub scheme: String,
    pub path: String,
    pub remote_id: String,
}

#[derive(Clone, Debug)]
pub struct Asset {
    pub id: i64,
    pub partition: PartitionId,
    pub root: Option<Ref>,
    pub labels: BTreeMap<String, String>,
    pub upstream: Option<Upstream>,
}

/// create an empty asset: a fresh partition, no root yet.
pub async fn create_asset(db: &Db) -> Result<i64> {
    db.transaction(|tx| {
        let pid = store::create_partition(tx)?;
        tx.execute("INSERT INTO assets (partition_id, root_json) VALUES (?1, NULL)", params![pid])?;
        Ok(tx.last_insert_rowid())
    })
    .await
}

/// create an asset, import `path` into its partition, and record the root.
pub async fn create_asset_from_path(db: &Db, path: &std::path::Path) -> Result<i64> {
    let asset_id = create_asset(db).await?;
    let asset = get_asset(db, asset_id).await?;
    let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let root = porting::import(db, asset.partition, path, cancel).await?;
    set_root(db, asset_id, root).await?;
    Ok(asset_id)
}

async fn set_root(db: &Db, asset_id: i64, root: Ref) -> Result<()> {
    let json = serde_json::to_string(&root)?;
    db.transaction(move |tx| {
        tx.execute("UPDATE assets SET root_json = ?1 WHERE id = ?2", params![json, asset_id])?;
        Ok(())
    })
    .await
}

/// insert or replace labels on an asset.
pub async fn put_labels(db: &Db, asset_id: i64, labels: &BTreeMap<String, String>) -> Result<()> {
    let labels = labels.clone();
    db.transaction(move |tx| {
        for (k, v) in &labels {
            tx.execute(
                "INSERT INTO asset_labels (asset_id, k, v) VALUES (?1, ?2, ?3)
                 ON CONFLICT(asset_id, k) DO UPDATE SET v = excluded.v",
                params![asset_id, k, v],
            )?;
        }
        Ok(())
    })
    .await
}

fn load_labels(tx: &rusqlite::Transaction<'_>, asset_id: i64) -> Result<BTreeMap<String, String>> {
    let mut stmt = tx.prepare("SELECT k, v FROM asset_labels WHERE asset_id = ?1")?;
    let rows = stmt.query_map(params![asset_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (k, v) = row?;
        out.insert(k, v);
    }
    Ok(out)
}

fn load_upstream(tx: &rusqlite::Transaction<'_>, asset_id: i64) -> Result<Option<Upstream>> {
    tx.query_row(
        "SELECT scheme, path, remote_id FROM upstreams WHERE asset_id = ?1",
        params![asset_id],
        |row| {
            Ok(Upstream {
                scheme: row.get(0)?,
                path: row.get(1)?,
                remote_id: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Error::from)
}

fn load_asset(tx: &rusqlite::Transaction<'_>, asset_id: i64) -> Result<Asset> {
    let (partition, root_json): (PartitionId, Option<String>) = tx
        .query_row(
            "SELECT partition_id, root_json FROM assets WHERE id = ?1",
            params![asset_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or(Error::AssetNotFound(asset_id))?;

    let root = root_json.map(|j| serde_json::from_str(&j)).transpose()?;
    let labels = load_labels(tx, asset_id)?;
    let upstream = load_upstream(tx, asset_id)?;

    Ok(Asset {
        id: asset_id,
        partition,
        root,
        labels,
        upstream,
    })
}

pub async fn get_asset(db: &Db, asset_id: i64) -> Result<Asset> {
    db.transaction(move |tx| load_asset(tx, asset_id)).await
}

/// list asset ids `>= lower_bound`, ascending, capped at `limit`
/// (default 1000, hard cap 10,000).
pub async fn list_assets(db: &Db, lower_bound: i64, limit: Option<usize>) -> Result<Vec<i64>> {
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT) as i64;
    db.transaction(move |tx| {
        let mut stmt = tx.prepare("SELECT id FROM assets WHERE id >= ?1 ORDER BY id ASC LIMIT ?2")?;
        let rows = stmt.query_map(params![lower_bound, limit], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>().map_err(Error::from)
    })
    .await
}

/// look up the asset whose root ref equals `r` exactly.
pub async fn asset_by_root(db: &Db, r: Ref) -> Result<Option<i64>> {
    let json = serde_json::to_string(&r)?;
    db.transaction(move |tx| {
        tx.query_row("SELECT id FROM assets WHERE root_json = ?1", params![json], |row| row.get(0))
            .optional()
            .map_err(Error::from)
    })
    .await
}

/// resolve `(scheme, path, remote_id)` to an asset id, creating a fresh
/// asset (and partition) if no such upstream is bound yet.
pub async fn get_or_create_upstream(db: &Db, scheme: &str, path: &str, remote_id: &str) -> Result<i64> {
    let (scheme, path, remote_id) = (scheme.to_string(), path.to_string(), remote_id.to_string());
    db.transaction(move |tx| {
        if let Some(existing) = tx
            .query_row(
                "SELECT asset_id FROM upstreams WHERE scheme = ?1 AND path = ?2 AND remote_id = ?3",
                params![scheme, path, remote_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(existing);
        }

        let pid = store::create_partition(tx)?;
        tx.execute("INSERT INTO assets (partition_id, root_json) VALUES (?1, NULL)", params![pid])?;
        let asset_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO upstreams (scheme, path, remote_id, asset_id) VALUES (?1, ?2, ?3, ?4)",
            params![scheme, path, remote_id, asset_id],
        )?;
        Ok(asset_id)
    })
    .await
}

/// record the asset's root after a pull or import completes.
pub async fn set_asset_root(db: &Db, asset_id: i64, root: Ref) -> Result<()> {
    set_root(db, asset_id, root).await
}

/// streaming, predicate-filtered listing of assets by upstream origin.
///
/// a producer resolves candidate ids to full assets and sends them on a
/// bounded channel; a consumer evaluates the predicate and collects matches.
/// either side's error/drop tears down the other: the producer stops on send
/// failure (receiver dropped), the consumer simply stops polling once the
/// channel closes.
pub async fn list_assets_by_source(
    db: &Db,
    upstream_scheme_path: Option<(String, String)>,
    predicate: &Predicate,
) -> Result<Vec<Asset>> {
    let candidate_ids = {
        let filter = upstream_scheme_path.clone();
        db.transaction(move |tx| match &filter {
            Some((scheme, path)) => {
                let mut stmt =
                    tx.prepare("SELECT asset_id FROM upstreams WHERE scheme = ?1 AND path = ?2 ORDER BY asset_id")?;
                let rows = stmt.query_map(params![scheme, path], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>().map_err(Error::from)
            }
            None => {
                let mut stmt = tx.prepare(
                    "SELECT id FROM assets WHERE id NOT IN (SELECT asset_id FROM upstreams) ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>().map_err(Error::from)
            }
        })
        .await?
    };

    let (tx, mut rx) = mpsc::channel::<Asset>(64);
    let db2 = db.clone();
    let producer = tokio::spawn(async move {
        for id in candidate_ids {
            let asset = match get_asset(&db2, id).await {
                Ok(a) => a,
                Err(_) => continue,
            };
            if tx.send(asset).await.is_err() {
                break;
            }
        }
    });

    let mut matches = Vec::new();
    while let Some(asset) = rx.recv().await {
        if predicate.matches(&asset.labels) {
            matches.push(asset);
        }
    }
    let _ = producer.await;
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_empty_asset_has_no_root() {
        let db = Db::open_in_memory().unwrap();
        let id = create_asset(&db).await.unwrap();
        let asset = get_asset(&db, id).await.unwrap();
        assert!(asset.root.is_none());
        assert!(asset.labels.is_empty());
    }

    #[tokio::test]
    async fn create_from_path_sets_root() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world\n").unwrap();

        let id = create_asset_from_path(&db, dir.path()).await.unwrap();
        let asset = get_asset(&db, id).await.unwrap();
        assert!(asset.root.is_some());
    }

    #[tokio::test]
    async fn labels_roundtrip_and_overwrite() {
        let db = Db::open_in_memory().unwrap();
        let id = create_asset(&db).await.unwrap();

        let mut labels = BTreeMap::new();
        labels.insert("os".to_string(), "linux".to_string());
        put_labels(&db, id, &labels).await.unwrap();

        labels.insert("os".to_string(), "darwin".to_string());
        put_labels(&db, id, &labels).await.unwrap();

        let asset = get_asset(&db, id).await.unwrap();
        assert_eq!(asset.labels.get("os"), Some(&"darwin".to_string()));
    }

    #[tokio::test]
    async fn get_or_create_upstream_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let a1 = get_or_create_upstream(&db, "github", "foo/bar", "ra-1").await.unwrap();
        let a2 = get_or_create_upstream(&db, "github", "foo/bar", "ra-1").await.unwrap();
        assert_eq!(a1, a2);
    }

    #[tokio::test]
    async fn list_assets_respects_limit_and_ordering() {
        let db = Db::open_in_memory().unwrap();
        for _ in 0..5 {
            create_asset(&db).await.unwrap();
        }
        let ids = list_assets(&db, 0, Some(3)).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn streaming_query_filters_by_label() {
        let db = Db::open_in_memory().unwrap();
        let a = create_asset(&db).await.unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("os".to_string(), "linux".to_string());
        put_labels(&db, a, &labels).await.unwrap();

        let b = create_asset(&db).await.unwrap();
        let mut labels_b = BTreeMap::new();
        labels_b.insert("os".to_string(), "darwin".to_string());
        put_labels(&db, b, &labels_b).await.unwrap();

        let predicate = Predicate::compile(r#".os == "linux""#).unwrap();
        let matches = list_assets_by_source(&db, None, &predicate).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, a);
    }
}
