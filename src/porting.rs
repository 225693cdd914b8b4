//! C3: the porting engine — import a POSIX path into the tree DAG, export a
//! DAG root back onto a POSIX path.
//!
//! concurrency mirrors the try-acquire-then-fall-back-to-inline pattern used
//! for the same purpose upstream: recursion acquires a permit before forking
//! parallel subtree work and proceeds inline when the semaphore is
//! exhausted, which bounds fan-out while still making progress.
//!
//! persistence happens through short-lived transactions per blob/tree rather
//! than one transaction spanning the whole recursive walk, since the walk
//! itself is async (directory I/O, semaphore waits) and a `rusqlite::Transaction`
//! cannot be held across an await point. each individual post is still
//! atomic; see DESIGN.md for this tradeoff.

use std::future::Future;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, OptionalExtension};
use tokio::sync::Semaphore;

use crate::db::Db;
use crate::error::{Error, IoResultExt, Result};
use crate::store::PartitionId;
use crate::tree::{self, get_blob, get_tree, new_blob_writer, PartitionStore, Ref, RefKind, Tree, TreeEntry};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// import a POSIX path into the given partition, returning its root `Ref`.
///
/// `cancel` is a caller-supplied cancellation token: setting it before or
/// during the walk makes any outstanding recursive step return
/// `Error::Cancelled` the next time it checks, the same way `export_node`
/// checks its own `failed` flag.
pub async fn import(db: &Db, pid: PartitionId, path: &Path, cancel: Arc<AtomicBool>) -> Result<Ref> {
    let capacity = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let sem = Arc::new(Semaphore::new(capacity));
    import_path(db.clone(), pid, path.to_path_buf(), sem, cancel).await
}

fn import_path(db: Db, pid: PartitionId, path: PathBuf, sem: Arc<Semaphore>, cancel: Arc<AtomicBool>) -> BoxFut<'static, Result<Ref>> {
    Box::pin(async move {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let meta = tokio::fs::symlink_metadata(&path).await.with_path(&path)?;
        if meta.file_type().is_dir() {
            import_dir(db, pid, path, sem, cancel).await
        } else if meta.file_type().is_symlink() {
            let target = tokio::fs::read_link(&path).await.with_path(&path)?;
            import_bytes(&db, pid, target.to_string_lossy().as_bytes()).await
        } else {
            let bytes = tokio::fs::read(&path).await.with_path(&path)?;
            import_bytes(&db, pid, &bytes).await
        }
    })
}

async fn import_bytes(db: &Db, pid: PartitionId, bytes: &[u8]) -> Result<Ref> {
    let bytes = bytes.to_vec();
    db.transaction(move |tx| {
        let mut store = PartitionStore::new(tx, pid);
        let mut w = new_blob_writer(&mut store);
        w.write(&bytes);
        w.finish()
    })
    .await
}

enum PendingEntry {
    Ready(String, u32, Ref),
    Spawned(String, u32, tokio::task::JoinHandle<Result<Ref>>),
}

fn import_dir(db: Db, pid: PartitionId, path: PathBuf, sem: Arc<Semaphore>, cancel: Arc<AtomicBool>) -> BoxFut<'static, Result<Ref>> {
    Box::pin(async move {
        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(&path).await.with_path(&path)?;
        while let Some(e) = rd.next_entry().await.with_path(&path)? {
            names.push(e.file_name());
        }
        names.sort();

        let mut pending = Vec::new();
        for name in names {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let child_path = path.join(&name);
            let child_meta = tokio::fs::symlink_metadata(&child_path).await.with_path(&child_path)?;
            let mode = if child_meta.file_type().is_symlink() {
                tree::SYMLINK_MODE
            } else {
                child_meta.permissions().mode() & 0o777
            };
            let name_str = name.to_string_lossy().into_owned();

            match sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    let db2 = db.clone();
                    let sem2 = sem.clone();
                    let cancel2 = cancel.clone();
                    let cp = child_path.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        import_path(db2, pid, cp, sem2, cancel2).await
                    });
                    pending.push(PendingEntry::Spawned(name_str, mode, handle));
                }
                Err(_) => {
                    let res = import_path(db.clone(), pid, child_path, sem.clone(), cancel.clone()).await;
                    if res.is_err() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    pending.push(PendingEntry::Ready(name_str, mode, res?));
                }
            }
        }

        let mut entries = Vec::with_capacity(pending.len());
        for p in pending {
            match p {
                PendingEntry::Ready(name, mode, r) => entries.push(TreeEntry::new(name, mode, r)),
                PendingEntry::Spawned(name, mode, handle) => {
                    let r = handle.await.map_err(|e| Error::Archive(e.to_string()))?;
                    if r.is_err() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    entries.push(TreeEntry::new(name, mode, r?));
                }
            }
        }

        let tree = Tree::new(entries)?;
        db.transaction(move |tx| {
            let mut store = PartitionStore::new(tx, pid);
            tree::post_tree(&mut store, &tree)
        })
        .await
    })
}

/// export a DAG root onto a POSIX path. `mode` governs the root entry's
/// permission bits (and, if it carries the symlink bit, tells the exporter
/// to write a symlink instead of a regular file).
pub async fn export(db: &Db, pid: PartitionId, r: Ref, dest: &Path, mode: u32, overwrite: bool) -> Result<()> {
    let sem = Arc::new(Semaphore::new(50));
    let failed = Arc::new(AtomicBool::new(false));
    export_node(db.clone(), pid, r, dest.to_path_buf(), mode, overwrite, sem, failed).await
}

fn export_node(
    db: Db,
    pid: PartitionId,
    r: Ref,
    dest: PathBuf,
    mode: u32,
    overwrite: bool,
    sem: Arc<Semaphore>,
    failed: Arc<AtomicBool>,
) -> BoxFut<'static, Result<()>> {
    Box::pin(async move {
        if failed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        match r.kind {
            RefKind::Tree => export_dir(db, pid, r, dest, overwrite, sem, failed).await,
            RefKind::Blob if tree::is_symlink_mode(mode) => export_symlink(&db, pid, r, &dest, overwrite).await,
            RefKind::Blob => export_blob_cached(&db, pid, r, &dest, mode, overwrite).await,
        }
    })
}

fn export_dir(
    db: Db,
    pid: PartitionId,
    r: Ref,
    dest: PathBuf,
    overwrite: bool,
    sem: Arc<Semaphore>,
    failed: Arc<AtomicBool>,
) -> BoxFut<'static, Result<()>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(&dest).await.with_path(&dest)?;

        let tree = db
            .transaction({
                let r = r;
                move |tx| {
                    let store = PartitionStore::new(tx, pid);
                    get_tree(&store, &r)
                }
            })
            .await?;

        let mut handles = Vec::new();
        for entry in tree.entries() {
            let child_dest = dest.join(&entry.name);
            let child_ref = entry.r#ref;
            let child_mode = entry.mode;

            match sem.clone().try_acquire_owned() {
                Ok(permit) => {
                    let db2 = db.clone();
                    let sem2 = sem.clone();
                    let failed2 = failed.clone();
                    handles.push(tokio::spawn(async move {
                        let _permit = permit;
                        export_node(db2, pid, child_ref, child_dest, child_mode, overwrite, sem2, failed2).await
                    }));
                }
                Err(_) => {
                    let res =
                        export_node(db.clone(), pid, child_ref, child_dest, child_mode, overwrite, sem.clone(), failed.clone())
                            .await;
                    if res.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    res?;
                }
            }
        }

        let mut first_err = None;
        for h in handles {
            match h.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed.store(true, Ordering::SeqCst);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    failed.store(true, Ordering::SeqCst);
                    if first_err.is_none() {
                        first_err = Some(Error::Archive(e.to_string()));
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(())
    })
}

async fn export_symlink(db: &Db, pid: PartitionId, r: Ref, dest: &Path, overwrite: bool) -> Result<()> {
    ensure_dest_clear(dest, overwrite).await?;
    let bytes = db
        .transaction(move |tx| {
            let store = PartitionStore::new(tx, pid);
            get_blob(&store, &r)
        })
        .await?;
    let target = String::from_utf8_lossy(&bytes).into_owned();
    tokio::task::spawn_blocking({
        let dest = dest.to_path_buf();
        move || std::os::unix::fs::symlink(&target, &dest)
    })
    .await
    .map_err(|e| Error::Archive(e.to_string()))?
    .with_path(dest)?;
    Ok(())
}

/// cache-aware regular-file export (§4.3): skip the write entirely when the
/// on-disk file's mtime has not advanced past the cached entry and the
/// cached ref matches the target ref.
async fn export_blob_cached(db: &Db, pid: PartitionId, r: Ref, dest: &Path, mode: u32, overwrite: bool) -> Result<()> {
    let dest_key = dest.to_string_lossy().into_owned();

    let existing_mtime = tokio::fs::metadata(dest).await.ok().and_then(|m| m.modified().ok());
    let cached = {
        let dest_key = dest_key.clone();
        db.transaction(move |tx| fs_cache_get(tx, &dest_key)).await?
    };

    if let (Some(mtime), Some((cached_ref, modified_at))) = (existing_mtime, cached) {
        if mtime <= modified_at && cached_ref == r {
            return Ok(());
        }
    }

    ensure_dest_clear(dest, overwrite).await?;
    let bytes = db
        .transaction(move |tx| {
            let store = PartitionStore::new(tx, pid);
            get_blob(&store, &r)
        })
        .await?;
    tokio::fs::write(dest, &bytes).await.with_path(dest)?;
    #[cfg(unix)]
    tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode & 0o777))
        .await
        .with_path(dest)?;

    let new_mtime = tokio::fs::metadata(dest).await.with_path(dest)?.modified().with_path(dest)?;
    db.transaction(move |tx| fs_cache_put(tx, &dest_key, new_mtime, &r)).await?;
    Ok(())
}

async fn ensure_dest_clear(dest: &Path, overwrite: bool) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.with_path(parent)?;
    }
    if tokio::fs::symlink_metadata(dest).await.is_ok() {
        if !overwrite {
            return Err(Error::TargetNotEmpty(dest.to_path_buf()));
        }
        tokio::fs::remove_file(dest).await.with_path(dest)?;
    }
    Ok(())
}

fn system_time_to_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i64).unwrap_or(0)
}

fn nanos_to_system_time(n: i64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_nanos(n.max(0) as u64)
}

fn fs_cache_get(tx: &rusqlite::Transaction<'_>, path: &str) -> Result<Option<(Ref, SystemTime)>> {
    let row: Option<(String, i64)> = tx
        .query_row(
            "SELECT root_json, mtime FROM fs_cache WHERE path = ?1",
            params![path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((json, mtime)) => {
            let r: Ref = serde_json::from_str(&json)?;
            Ok(Some((r, nanos_to_system_time(mtime))))
        }
        None => Ok(None),
    }
}

fn fs_cache_put(tx: &rusqlite::Transaction<'_>, path: &str, mtime: SystemTime, r: &Ref) -> Result<()> {
    let json = serde_json::to_string(r)?;
    tx.execute(
        "INSERT INTO fs_cache (path, mtime, root_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET mtime = excluded.mtime, root_json = excluded.root_json",
        params![path, system_time_to_nanos(mtime), json],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::create_partition;
    use tempfile::tempdir;

    async fn fresh_partition(db: &Db) -> PartitionId {
        db.transaction(|tx| create_partition(tx)).await.unwrap()
    }

    #[tokio::test]
    async fn import_export_roundtrip_regular_files() {
        let db = Db::open_in_memory().unwrap();
        let pid = fresh_partition(&db).await;

        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("top.txt"), "top content").unwrap();
        std::fs::write(src.path().join("sub/nested.txt"), "nested content").unwrap();
        let mut perms = std::fs::metadata(src.path().join("top.txt")).unwrap().permissions();
        perms.set_mode(0o640);
        std::fs::set_permissions(src.path().join("top.txt"), perms).unwrap();

        let root = import(&db, pid, src.path(), Arc::new(AtomicBool::new(false))).await.unwrap();

        let dest = tempdir().unwrap();
        export(&db, pid, root, dest.path(), 0o755, true).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.path().join("top.txt")).unwrap(), "top content");
        assert_eq!(
            std::fs::read_to_string(dest.path().join("sub/nested.txt")).unwrap(),
            "nested content"
        );
        let mode = std::fs::metadata(dest.path().join("top.txt")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[tokio::test]
    async fn import_preserves_symlinks() {
        let db = Db::open_in_memory().unwrap();
        let pid = fresh_partition(&db).await;

        let src = tempdir().unwrap();
        std::fs::write(src.path().join("target.txt"), "hi").unwrap();
        std::os::unix::fs::symlink("target.txt", src.path().join("link")).unwrap();

        let root = import(&db, pid, src.path(), Arc::new(AtomicBool::new(false))).await.unwrap();

        let dest = tempdir().unwrap();
        export(&db, pid, root, dest.path(), 0o755, true).await.unwrap();

        let link = dest.path().join("link");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("target.txt"));
    }

    #[tokio::test]
    async fn export_skips_write_when_cache_is_warm() {
        let db = Db::open_in_memory().unwrap();
        let pid = fresh_partition(&db).await;

        let src = tempdir().unwrap();
        std::fs::write(src.path().join("f.txt"), "content").unwrap();
        let root = import(&db, pid, src.path(), Arc::new(AtomicBool::new(false))).await.unwrap();

        let dest = tempdir().unwrap();
        export(&db, pid, root, dest.path(), 0o755, true).await.unwrap();

        let before = std::fs::metadata(dest.path().join("f.txt")).unwrap().modified().unwrap();
        // re-export the identical root; cache should report no write needed.
        export(&db, pid, root, dest.path(), 0o755, true).await.unwrap();
        let after = std::fs::metadata(dest.path().join("f.txt")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn import_returns_cancelled_when_token_already_set() {
        let db = Db::open_in_memory().unwrap();
        let pid = fresh_partition(&db).await;
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/a.txt"), "a").unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let err = import(&db, pid, src.path(), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
