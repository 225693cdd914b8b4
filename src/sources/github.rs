//! the GitHub code-hosting source: enumerates releases (and their release
//! assets) and tags as two concatenated paginated streams, synthesizing
//! `arch`/`os`/`semver` labels from filenames and tag names.

use std::collections::BTreeMap;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::store::PartitionId;
use crate::tree::Ref;

use super::{import_blob, import_gzip_tar, import_zip, RemoteAsset, Source};

const TAG_PREFIX: &str = "git-";
const ASSET_PREFIX: &str = "ra-";

pub struct GitHubSource {
    account: String,
    repo: String,
    token: Option<String>,
}

impl GitHubSource {
    pub fn new(account: &str, repo: &str) -> Self {
        Self {
            account: account.to_string(),
            repo: repo.to_string(),
            token: std::env::var("GITHUB_TOKEN").ok(),
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().user_agent("bpm");
        if let Some(token) = &self.token {
            let mut headers = reqwest::header::HeaderMap::new();
            let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Archive(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        builder.build().map_err(Error::from)
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    name: Option<String>,
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseAsset {
    id: i64,
    name: String,
    node_id: Option<String>,
    content_type: Option<String>,
    label: Option<String>,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    commit: TagCommit,
}

#[derive(Debug, Deserialize)]
struct TagCommit {
    sha: Option<String>,
}

#[async_trait::async_trait]
impl Source for GitHubSource {
    async fn fetch(&self) -> Result<BoxStream<'static, Result<RemoteAsset>>> {
        let releases = release_assets_stream(self.client()?, self.account.clone(), self.repo.clone());
        let tags = tags_stream(self.client()?, self.account.clone(), self.repo.clone());
        Ok(releases.chain(tags).boxed())
    }

    async fn pull(&self, db: &Db, pid: PartitionId, id: &str) -> Result<Ref> {
        let client = self.client()?;
        if let Some(tag) = id.strip_prefix(TAG_PREFIX) {
            let url = format!(
                "https://api.github.com/repos/{}/{}/tarball/refs/tags/{}",
                self.account, self.repo, tag
            );
            let bytes = download(&client, &url).await?;
            return import_gzip_tar(db, pid, bytes).await;
        }
        if let Some(raw_id) = id.strip_prefix(ASSET_PREFIX) {
            let asset_id: i64 = raw_id.parse().map_err(|_| Error::InvalidUrl(id.to_string()))?;
            let url = format!(
                "https://api.github.com/repos/{}/{}/releases/assets/{}",
                self.account, self.repo, asset_id
            );
            let asset: ReleaseAsset = client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .send()
                .await?
                .error_for_status()
                .map_err(|e| Error::RemoteTransient(e.to_string()))?
                .json()
                .await?;
            let bytes = download(&client, &asset.browser_download_url).await?;
            return match asset.content_type.as_deref() {
                Some("application/zip") => import_zip(db, pid, bytes).await,
                Some("application/x-gtar") | Some("application/gzip") => import_gzip_tar(db, pid, bytes).await,
                _ => import_blob(db, pid, bytes).await,
            };
        }
        Err(Error::InvalidUrl(id.to_string()))
    }
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::RemoteTransient(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::RemoteTransient(format!("{url}: {}", resp.status())));
    }
    Ok(resp.bytes().await?.to_vec())
}

fn release_assets_stream(client: reqwest::Client, account: String, repo: String) -> BoxStream<'static, Result<RemoteAsset>> {
    stream::unfold(PageState::First, move |state| {
        let client = client.clone();
        let account = account.clone();
        let repo = repo.clone();
        async move {
            let page = match state {
                PageState::First => 1,
                PageState::Page(p) => p,
                PageState::Done => return None,
            };
            let url = format!(
                "https://api.github.com/repos/{account}/{repo}/releases?page={page}&per_page=100"
            );
            let releases: Vec<Release> = match client.get(&url).send().await {
                Ok(resp) => match resp.json().await {
                    Ok(r) => r,
                    Err(e) => return Some((vec![Err(Error::from(e))], PageState::Done)),
                },
                Err(e) => return Some((vec![Err(Error::RemoteTransient(e.to_string()))], PageState::Done)),
            };
            if releases.is_empty() {
                return None;
            }
            let mut items = Vec::new();
            for rel in &releases {
                for asset in &rel.assets {
                    items.push(Ok(release_asset_to_remote(rel, asset)));
                }
            }
            Some((items, PageState::Page(page + 1)))
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

fn tags_stream(client: reqwest::Client, account: String, repo: String) -> BoxStream<'static, Result<RemoteAsset>> {
    stream::unfold(PageState::First, move |state| {
        let client = client.clone();
        let account = account.clone();
        let repo = repo.clone();
        async move {
            let page = match state {
                PageState::First => 1,
                PageState::Page(p) => p,
                PageState::Done => return None,
            };
            let url = format!("https://api.github.com/repos/{account}/{repo}/tags?page={page}&per_page=1000");
            let tags: Vec<Tag> = match client.get(&url).send().await {
                Ok(resp) => match resp.json().await {
                    Ok(t) => t,
                    Err(e) => return Some((vec![Err(Error::from(e))], PageState::Done)),
                },
                Err(e) => return Some((vec![Err(Error::RemoteTransient(e.to_string()))], PageState::Done)),
            };
            if tags.is_empty() {
                return None;
            }
            let items = tags.iter().map(|t| Ok(tag_to_remote(t))).collect::<Vec<_>>();
            Some((items, PageState::Page(page + 1)))
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

enum PageState {
    First,
    Page(u32),
    Done,
}

fn release_asset_to_remote(rel: &Release, asset: &ReleaseAsset) -> RemoteAsset {
    let mut labels = BTreeMap::new();
    labels.insert("tag_name".to_string(), canonical_semver(&rel.tag_name).unwrap_or_else(|| rel.tag_name.clone()));
    if let Some(name) = &rel.name {
        labels.insert("release_name".to_string(), name.clone());
    }
    labels.insert("filename".to_string(), asset.name.clone());
    labels.insert("asset_id".to_string(), asset.id.to_string());
    if let Some(node_id) = &asset.node_id {
        labels.insert("node_id".to_string(), node_id.clone());
    }
    if let Some(ct) = &asset.content_type {
        labels.insert("content_type".to_string(), ct.clone());
    }
    if let Some(label) = &asset.label {
        labels.insert("label".to_string(), label.clone());
    }
    fuzz_semver(&mut labels);
    fuzz_arch(&mut labels);
    fuzz_os(&mut labels);
    RemoteAsset {
        id: format!("{ASSET_PREFIX}{}", asset.id),
        labels,
    }
}

fn tag_to_remote(tag: &Tag) -> RemoteAsset {
    let mut labels = BTreeMap::new();
    labels.insert("git_tag".to_string(), tag.name.clone());
    if let Some(sha) = &tag.commit.sha {
        labels.insert("git_sha".to_string(), sha.clone());
    }
    labels.insert("tag_name".to_string(), tag.name.clone());
    fuzz_semver(&mut labels);
    fuzz_arch(&mut labels);
    fuzz_os(&mut labels);
    RemoteAsset {
        id: format!("{TAG_PREFIX}{}", tag.name),
        labels,
    }
}

fn fuzz_semver(labels: &mut BTreeMap<String, String>) {
    let Some(tag) = labels.get("tag_name") else { return };
    if let Some(sv) = canonical_semver(tag) {
        labels.insert("semver".to_string(), sv);
    }
}

fn fuzz_arch(labels: &mut BTreeMap<String, String>) {
    let Some(name) = labels.get("filename").cloned() else { return };
    for arch in ["amd64", "arm64", "aarch64", "riscv"] {
        if name.contains(arch) {
            labels.insert("arch".to_string(), arch.to_string());
        }
    }
}

fn fuzz_os(labels: &mut BTreeMap<String, String>) {
    let Some(name) = labels.get("filename").cloned() else { return };
    for os in ["linux", "darwin", "windows"] {
        if name.contains(os) {
            labels.insert("os".to_string(), os.to_string());
        }
    }
}

/// canonicalize a tag name the way `golang.org/x/mod/semver.Canonical` does:
/// strip an optional leading `v`, require at least a major.minor, zero-fill
/// a missing patch, and re-prefix with `v`. returns `None` for non-numeric
/// (non-semver) tag names.
fn canonical_semver(tag: &str) -> Option<String> {
    let body = tag.strip_prefix('v').unwrap_or(tag);
    let mut parts = body.splitn(3, '.');
    let major = parts.next()?;
    let minor = parts.next().unwrap_or("0");
    let patch = parts.next().unwrap_or("0");
    if !major.chars().all(|c| c.is_ascii_digit()) || major.is_empty() {
        return None;
    }
    if !minor.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let patch_numeric: String = patch.chars().take_while(|c| c.is_ascii_digit()).collect();
    let patch = if patch_numeric.is_empty() { "0" } else { patch_numeric.as_str() };
    Some(format!("v{major}.{minor}.{patch}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_tag_names() {
        assert_eq!(canonical_semver("v1.2.3").as_deref(), Some("v1.2.3"));
        assert_eq!(canonical_semver("1.2.3").as_deref(), Some("v1.2.3"));
        assert_eq!(canonical_semver("v1.2").as_deref(), Some("v1.2.0"));
        assert_eq!(canonical_semver("not-a-version"), None);
    }

    #[test]
    fn fuzzes_arch_and_os_from_filename() {
        let mut labels = BTreeMap::new();
        labels.insert("filename".to_string(), "tool-1.2.3-linux-amd64.tar.gz".to_string());
        labels.insert("tag_name".to_string(), "v1.2.3".to_string());
        fuzz_semver(&mut labels);
        fuzz_arch(&mut labels);
        fuzz_os(&mut labels);
        assert_eq!(labels.get("os").map(String::as_str), Some("linux"));
        assert_eq!(labels.get("arch").map(String::as_str), Some("amd64"));
        assert_eq!(labels.get("semver").map(String::as_str), Some("v1.2.3"));
    }
}
