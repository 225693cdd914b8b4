//! C6: the source pipeline — fetch remote asset metadata into the index,
//! pull a remote bundle's bytes into the tree DAG.

pub mod github;
pub mod httpscrape;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use rusqlite::{params, OptionalExtension};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::assets;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::store::{self, PartitionId};
use crate::tree::{PartitionStore, Ref};

/// a remote origin's locator, e.g. `github:blobcache/bpm` or `http:example.com/dist/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUrl {
    pub scheme: String,
    pub path: String,
}

impl SourceUrl {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, path) = s.split_once(':').ok_or_else(|| Error::InvalidUrl(s.to_string()))?;
        if path.is_empty() {
            return Err(Error::InvalidUrl(s.to_string()));
        }
        match scheme {
            "github" | "http" => Ok(Self {
                scheme: scheme.to_string(),
                path: path.to_string(),
            }),
            other => Err(Error::UnknownScheme(other.to_string())),
        }
    }
}

impl std::fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)
    }
}

/// an item produced by a source's `fetch`: a remote-side id plus the labels
/// synthesized for it.
#[derive(Clone, Debug)]
pub struct RemoteAsset {
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

/// a capability over a remote origin.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// a lazy, finite, non-restartable sequence of remote asset metadata.
    async fn fetch(&self) -> Result<BoxStream<'static, Result<RemoteAsset>>>;

    /// materialize the remote bundle identified by `id` into `pid`,
    /// returning the DAG root.
    async fn pull(&self, db: &Db, pid: PartitionId, id: &str) -> Result<Ref>;
}

/// construct the `Source` for a URL's scheme.
pub fn make_source(url: &SourceUrl) -> Result<Box<dyn Source>> {
    match url.scheme.as_str() {
        "github" => {
            let (account, repo) = url
                .path
                .split_once('/')
                .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
            Ok(Box::new(github::GitHubSource::new(account, repo)))
        }
        "http" => Ok(Box::new(httpscrape::HttpScraper::new(&url.path)?)),
        other => Err(Error::UnknownScheme(other.to_string())),
    }
}

const FETCH_BATCH_SIZE: usize = 1000;
const FETCH_BATCH_TIMEOUT: Duration = Duration::from_millis(100);
const FETCH_CHANNEL_CAPACITY: usize = 256;

/// create metadata-only assets for every item a source's `fetch` produces.
///
/// a producer task copies items from the source's stream into a bounded
/// channel; this task reads them through a batcher that flushes at 1000
/// items or every 100ms, whichever comes first, and writes each batch in a
/// single transaction. either side's failure tears down the pipeline: the
/// producer stops sending once the receiver drops, and this task drains
/// whatever is left in the channel before returning any error it saw.
///
/// `cancel` is checked once per batcher iteration, the same way
/// `porting::export_node` checks its own `failed` flag: once set, the next
/// iteration returns `Error::Cancelled` instead of flushing or recv'ing again.
pub async fn fetch(db: &Db, url: &SourceUrl, cancel: Arc<AtomicBool>) -> Result<()> {
    let source = make_source(url)?;
    let stream = source.fetch().await?;

    let (tx, mut rx) = mpsc::channel::<Result<RemoteAsset>>(FETCH_CHANNEL_CAPACITY);
    let producer = tokio::spawn(async move {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let mut batch: Vec<RemoteAsset> = Vec::with_capacity(FETCH_BATCH_SIZE);
    let mut deadline = Instant::now() + FETCH_BATCH_TIMEOUT;
    let mut first_err: Option<Error> = None;

    loop {
        if cancel.load(Ordering::SeqCst) {
            if first_err.is_none() {
                first_err = Some(Error::Cancelled);
            }
            break;
        }
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(Ok(asset)) => {
                        batch.push(asset);
                        if batch.len() >= FETCH_BATCH_SIZE {
                            flush_batch(db, url, std::mem::take(&mut batch)).await?;
                            deadline = Instant::now() + FETCH_BATCH_TIMEOUT;
                        }
                    }
                    Some(Err(e)) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if !batch.is_empty() {
                    flush_batch(db, url, std::mem::take(&mut batch)).await?;
                }
                deadline = Instant::now() + FETCH_BATCH_TIMEOUT;
            }
        }
    }
    if !batch.is_empty() && !cancel.load(Ordering::SeqCst) {
        flush_batch(db, url, batch).await?;
    }
    drop(rx);
    let _ = producer.await;
    if let Some(e) = first_err {
        return Err(e);
    }
    Ok(())
}

/// write a whole batch's upstream-resolution and label upserts in a single
/// transaction, mirroring the raw-SQL bodies of `assets::get_or_create_upstream`
/// and `assets::put_labels` rather than opening one transaction per item.
async fn flush_batch(db: &Db, url: &SourceUrl, items: Vec<RemoteAsset>) -> Result<()> {
    let scheme = url.scheme.clone();
    let path = url.path.clone();
    db.transaction(move |tx| {
        for item in &items {
            let asset_id = match tx
                .query_row(
                    "SELECT asset_id FROM upstreams WHERE scheme = ?1 AND path = ?2 AND remote_id = ?3",
                    params![scheme, path, item.id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
            {
                Some(existing) => existing,
                None => {
                    let pid = store::create_partition(tx)?;
                    tx.execute("INSERT INTO assets (partition_id, root_json) VALUES (?1, NULL)", params![pid])?;
                    let asset_id = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO upstreams (scheme, path, remote_id, asset_id) VALUES (?1, ?2, ?3, ?4)",
                        params![scheme, path, item.id, asset_id],
                    )?;
                    asset_id
                }
            };
            for (k, v) in &item.labels {
                tx.execute(
                    "INSERT INTO asset_labels (asset_id, k, v) VALUES (?1, ?2, ?3)
                     ON CONFLICT(asset_id, k) DO UPDATE SET v = excluded.v",
                    params![asset_id, k, v],
                )?;
            }
        }
        Ok(())
    })
    .await
}

const FETCH_ALL_CONCURRENCY: usize = 10;

/// fetch metadata for every distinct upstream origin already known locally,
/// at most 10 sources in flight at a time. `cancel` is shared across every
/// spawned `fetch` and also checked before spawning the next one, so setting
/// it stops both in-flight fetches and any not yet started.
pub async fn fetch_all(db: &Db, cancel: Arc<AtomicBool>) -> Result<()> {
    let urls = distinct_upstream_urls(db).await?;
    let sem = std::sync::Arc::new(tokio::sync::Semaphore::new(FETCH_ALL_CONCURRENCY));
    let mut handles = Vec::new();
    for url in urls {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let permit = sem.clone().acquire_owned().await.expect("semaphore not closed");
        let db = db.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            fetch(&db, &url, cancel).await
        }));
    }
    let mut first_err = None;
    for h in handles {
        match h.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(Error::Archive(e.to_string()));
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn distinct_upstream_urls(db: &Db) -> Result<Vec<SourceUrl>> {
    db.transaction(|tx| {
        let mut stmt = tx.prepare("SELECT DISTINCT scheme, path FROM upstreams")?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceUrl {
                scheme: row.get(0)?,
                path: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<SourceUrl>>>().map_err(Error::from)
    })
    .await
}

/// resolve or create the upstream's asset, dispatch the source's `pull`
/// into its partition, and record the resulting root. `cancel` is checked
/// before the (potentially long) remote pull begins.
pub async fn pull(db: &Db, url: &SourceUrl, remote_id: &str, cancel: Arc<AtomicBool>) -> Result<i64> {
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }
    let source = make_source(url)?;
    let asset_id = assets::get_or_create_upstream(db, &url.scheme, &url.path, remote_id).await?;
    let asset = assets::get_asset(db, asset_id).await?;
    let root = source.pull(db, asset.partition, remote_id).await?;
    assets::set_asset_root(db, asset_id, root).await?;
    Ok(asset_id)
}

/// stream a gzip-compressed tar archive's entries into a tree via C3's
/// import primitives, one blob/tree post per entry. mirrors the
/// `importGzipTAR` dispatch in the original github source.
pub(crate) async fn import_gzip_tar(db: &Db, pid: PartitionId, bytes: Vec<u8>) -> Result<Ref> {
    let staged = tokio::task::spawn_blocking(move || import_gzip_tar_blocking(bytes))
        .await
        .map_err(|e| Error::Archive(e.to_string()))??;
    staged.post(db, pid).await
}

/// buffer a zip archive's entries (zip needs random access) and import them
/// via C3. mirrors `importZip`.
pub(crate) async fn import_zip(db: &Db, pid: PartitionId, bytes: Vec<u8>) -> Result<Ref> {
    let staged = tokio::task::spawn_blocking(move || import_zip_blocking(bytes))
        .await
        .map_err(|e| Error::Archive(e.to_string()))??;
    staged.post(db, pid).await
}

/// import raw bytes as a single opaque blob. the fallback for unrecognized
/// bundle formats (graceful degradation per spec.md §7).
pub(crate) async fn import_blob(db: &Db, pid: PartitionId, bytes: Vec<u8>) -> Result<Ref> {
    db.transaction(move |tx| {
        let mut store = PartitionStore::new(tx, pid);
        let mut w = crate::tree::new_blob_writer(&mut store);
        w.write(&bytes);
        w.finish()
    })
    .await
}

/// an in-memory tree staged during a blocking archive walk, ready to be
/// posted into the database from an async context.
pub(crate) struct StagedTree {
    root: StagedNode,
}

enum StagedNode {
    File { mode: u32, bytes: Vec<u8> },
    Dir(BTreeMap<String, StagedNode>),
}

impl StagedTree {
    async fn post(self, db: &Db, pid: PartitionId) -> Result<Ref> {
        db.transaction(move |tx| {
            let mut store = PartitionStore::new(tx, pid);
            post_node(&mut store, self.root)
        })
        .await
    }
}

fn post_node(store: &mut PartitionStore<'_, '_>, node: StagedNode) -> Result<Ref> {
    match node {
        StagedNode::File { mode: _, bytes } => {
            let mut w = crate::tree::new_blob_writer(store);
            w.write(&bytes);
            w.finish()
        }
        StagedNode::Dir(children) => {
            let mut entries = Vec::new();
            for (name, child) in children {
                let mode = staged_mode(&child);
                let r = post_node(store, child)?;
                entries.push(crate::tree::TreeEntry::new(name, mode, r));
            }
            let tree = crate::tree::Tree::new(entries)?;
            crate::tree::post_tree(store, &tree)
        }
    }
}

fn staged_mode(node: &StagedNode) -> u32 {
    match node {
        StagedNode::File { mode, .. } => *mode,
        StagedNode::Dir(_) => 0o755,
    }
}

fn import_gzip_tar_blocking(bytes: Vec<u8>) -> Result<StagedTree> {
    let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    let mut root = BTreeMap::new();
    for entry in archive.entries().map_err(|e| Error::Archive(e.to_string()))? {
        let mut entry = entry.map_err(|e| Error::Archive(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(|e| Error::Archive(e.to_string()))?.into_owned();
        let mode = entry.header().mode().unwrap_or(0o644) & 0o777;
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut bytes).map_err(|e| Error::Archive(e.to_string()))?;
        insert_staged(&mut root, &path, mode, bytes);
    }
    Ok(StagedTree {
        root: StagedNode::Dir(root),
    })
}

fn import_zip_blocking(bytes: Vec<u8>) -> Result<StagedTree> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| Error::Archive(e.to_string()))?;
    let mut root = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| Error::Archive(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let path = match file.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => continue,
        };
        let mode = file.unix_mode().unwrap_or(0o644) & 0o777;
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut bytes).map_err(|e| Error::Archive(e.to_string()))?;
        insert_staged(&mut root, &path, mode, bytes);
    }
    Ok(StagedTree {
        root: StagedNode::Dir(root),
    })
}

fn insert_staged(root: &mut BTreeMap<String, StagedNode>, path: &std::path::Path, mode: u32, bytes: Vec<u8>) {
    let components: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if components.is_empty() {
        return;
    }
    insert_at(root, &components, mode, bytes);
}

fn insert_at(dir: &mut BTreeMap<String, StagedNode>, components: &[String], mode: u32, bytes: Vec<u8>) {
    let (head, rest) = components.split_first().expect("non-empty path");
    if rest.is_empty() {
        dir.insert(head.clone(), StagedNode::File { mode, bytes });
        return;
    }
    let child = dir
        .entry(head.clone())
        .or_insert_with(|| StagedNode::Dir(BTreeMap::new()));
    if let StagedNode::Dir(children) = child {
        insert_at(children, rest, mode, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes() {
        let u = SourceUrl::parse("github:blobcache/bpm").unwrap();
        assert_eq!(u.scheme, "github");
        assert_eq!(u.path, "blobcache/bpm");

        let u = SourceUrl::parse("http:example.com/dist/").unwrap();
        assert_eq!(u.scheme, "http");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(SourceUrl::parse("ftp:foo"), Err(Error::UnknownScheme(_))));
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(matches!(SourceUrl::parse("nocolonhere"), Err(Error::InvalidUrl(_))));
    }

    fn remote(id: &str, k: &str, v: &str) -> RemoteAsset {
        let mut labels = BTreeMap::new();
        labels.insert(k.to_string(), v.to_string());
        RemoteAsset { id: id.to_string(), labels }
    }

    #[tokio::test]
    async fn flush_batch_creates_one_asset_per_remote_id() {
        let db = Db::open_in_memory().unwrap();
        let url = SourceUrl::parse("github:blobcache/bpm").unwrap();
        let items = vec![remote("ra-1", "os", "linux"), remote("ra-2", "os", "darwin")];
        flush_batch(&db, &url, items).await.unwrap();

        let a1 = assets::get_or_create_upstream(&db, "github", "blobcache/bpm", "ra-1").await.unwrap();
        let a2 = assets::get_or_create_upstream(&db, "github", "blobcache/bpm", "ra-2").await.unwrap();
        assert_ne!(a1, a2);
        let asset1 = assets::get_asset(&db, a1).await.unwrap();
        assert_eq!(asset1.labels.get("os").map(String::as_str), Some("linux"));
    }

    #[tokio::test]
    async fn flush_batch_is_idempotent_across_calls() {
        let db = Db::open_in_memory().unwrap();
        let url = SourceUrl::parse("github:blobcache/bpm").unwrap();
        flush_batch(&db, &url, vec![remote("ra-1", "os", "linux")]).await.unwrap();
        flush_batch(&db, &url, vec![remote("ra-1", "os", "darwin")]).await.unwrap();

        let asset_id = assets::get_or_create_upstream(&db, "github", "blobcache/bpm", "ra-1").await.unwrap();
        let asset = assets::get_asset(&db, asset_id).await.unwrap();
        assert_eq!(asset.labels.get("os").map(String::as_str), Some("darwin"));
        let ids = assets::list_assets(&db, 0, None).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn pull_returns_cancelled_when_token_already_set() {
        let db = Db::open_in_memory().unwrap();
        let url = SourceUrl::parse("github:blobcache/bpm").unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let err = pull(&db, &url, "ra-1", cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
