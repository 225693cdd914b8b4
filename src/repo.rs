//! C7: the repo facade.
//!
//! a repo is a directory containing a hidden `.bpm/` metadata directory with
//! a single sqlite database file. the working directory is the repo
//! directory itself, with `.bpm/**` filtered out of actualization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::assets;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::porting;
use crate::snapshot::{self, Commit};
use crate::tree::Ref;

const METADATA_DIR: &str = ".bpm";
const DB_FILE: &str = "bpm.db";

pub struct Repo {
    path: PathBuf,
    db: Db,
}

impl Repo {
    /// create `<path>/.bpm/` and an empty database with the schema applied.
    pub fn init(path: &Path) -> Result<Self> {
        let meta_dir = path.join(METADATA_DIR);
        if meta_dir.exists() {
            return Err(Error::RepoExists(path.to_path_buf()));
        }
        std::fs::create_dir_all(&meta_dir).map_err(|e| Error::Io {
            path: meta_dir.clone(),
            source: e,
        })?;
        let db = Db::open(&meta_dir.join(DB_FILE))?;
        Ok(Self {
            path: path.to_path_buf(),
            db,
        })
    }

    /// open an existing repo. fails with `NoRepo` if `.bpm/` is absent.
    pub fn open(path: &Path) -> Result<Self> {
        let meta_dir = path.join(METADATA_DIR);
        if !meta_dir.is_dir() {
            return Err(Error::NoRepo(path.to_path_buf()));
        }
        let db = Db::open(&meta_dir.join(DB_FILE))?;
        Ok(Self {
            path: path.to_path_buf(),
            db,
        })
    }

    /// the repo path as given by `$BPM_PATH`, falling back to `$HOME/pkg`.
    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var("BPM_PATH") {
            return PathBuf::from(p);
        }
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("pkg")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// the repo's working directory: its root, minus `.bpm/**`.
    pub fn working_dir(&self) -> &Path {
        &self.path
    }

    /// make the working directory reflect `tlds`: for each top-level
    /// directory, look up the asset owning its root ref (hence its
    /// partition) and cache-aware-export it in place.
    pub async fn actualize(&self, tlds: &BTreeMap<String, Ref>) -> Result<()> {
        actualize(&self.db, &self.path, tlds).await
    }

    pub async fn get_current(&self) -> Result<Option<(i64, crate::hash::Hash)>> {
        snapshot::get_current(&self.db).await
    }

    pub async fn list_commits(&self) -> Result<Vec<Commit>> {
        snapshot::list_commits(&self.db).await
    }

    /// append a commit pointing at `snap_cid` and actualize it onto the
    /// working directory. the commit row is written before actualization so
    /// a crash mid-actualize leaves the commit in place for a later
    /// re-converging call.
    pub async fn deploy(&self, snap_cid: crate::hash::Hash) -> Result<i64> {
        let db = self.db.clone();
        let path = self.path.clone();
        snapshot::deploy(&db, snap_cid, move |tlds| async move { actualize(&db, &path, &tlds).await }).await
    }

    /// read the current commit's snapshot tlds, apply `f`, post and deploy
    /// the result, actualizing it onto the working directory.
    pub async fn modify(&self, f: impl FnOnce(&mut BTreeMap<String, Ref>)) -> Result<i64> {
        let db = self.db.clone();
        let path = self.path.clone();
        snapshot::modify(&db, f, move |tlds| {
            let db = db.clone();
            let path = path.clone();
            async move { actualize(&db, &path, &tlds).await }
        })
        .await
    }
}

async fn actualize(db: &Db, working_dir: &Path, tlds: &BTreeMap<String, Ref>) -> Result<()> {
    for (name, root) in tlds {
        let asset_id = assets::asset_by_root(db, *root)
            .await?
            .ok_or(Error::PathNotFound(name.clone()))?;
        let asset = assets::get_asset(db, asset_id).await?;
        let dest = working_dir.join(name);
        porting::export(db, asset.partition, *root, &dest, 0o755, true).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_metadata_dir() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        assert!(dir.path().join(".bpm").is_dir());
        assert!(dir.path().join(".bpm/bpm.db").is_file());
        assert_eq!(repo.path(), dir.path());
    }

    #[test]
    fn init_twice_fails() {
        let dir = tempdir().unwrap();
        Repo::init(dir.path()).unwrap();
        assert!(matches!(Repo::init(dir.path()), Err(Error::RepoExists(_))));
    }

    #[test]
    fn open_missing_repo_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(Repo::open(dir.path()), Err(Error::NoRepo(_))));
    }

    #[tokio::test]
    async fn create_asset_and_deploy_actualizes_working_dir() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();

        let src = tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), "hello world\n").unwrap();
        let asset_id = assets::create_asset_from_path(repo.db(), src.path()).await.unwrap();
        let asset = assets::get_asset(repo.db(), asset_id).await.unwrap();
        let root = asset.root.unwrap();

        repo.modify(move |tlds| {
            tlds.insert("app".to_string(), root);
        })
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("app/hello.txt")).unwrap(),
            "hello world\n"
        );
    }
}
