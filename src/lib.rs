//! bpm - content-addressed package manager
//!
//! a local package store over a single sqlite database: blob dedup within
//! per-asset partitions (C1), a canonical tree DAG for directory structure
//! (C2), a porting engine for moving filesystem trees in and out of the
//! store (C3), an asset/label index with jq-style queries (C4), a
//! snapshot/commit graph for the working directory's top-level layout (C5),
//! and a remote source pipeline for fetching and pulling package bundles
//! from GitHub releases/tags or a plain HTTP index (C6). `Repo` (C7) ties
//! these together as the library's entry point.
//!
//! # Example usage
//!
//! ```no_run
//! use bpm::Repo;
//! use std::path::Path;
//!
//! # async fn run() -> bpm::Result<()> {
//! let repo = Repo::init(Path::new("/path/to/repo"))?;
//! let asset_id = bpm::assets::create_asset_from_path(repo.db(), Path::new("/source")).await?;
//! let asset = bpm::assets::get_asset(repo.db(), asset_id).await?;
//! repo.modify(|tlds| {
//!     tlds.insert("app".to_string(), asset.root.unwrap());
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod db;
mod error;
mod hash;
pub mod porting;
pub mod predicate;
mod repo;
pub mod snapshot;
pub mod sources;
pub mod store;
pub mod tree;

pub use error::{Error, Result};
pub use hash::Hash;
pub use repo::Repo;
