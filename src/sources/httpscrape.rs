//! the illustrative HTTP-scraper source: lists links under a target URL by
//! scraping its HTML for `a[href]`. `pull` is intentionally unimplemented,
//! matching the original Go source which never implemented it either.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use scraper::{Html, Selector};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::store::PartitionId;
use crate::tree::Ref;

use super::{RemoteAsset, Source};

pub struct HttpScraper {
    target: reqwest::Url,
}

impl HttpScraper {
    /// parse `target`, forcing the scheme to `https`.
    pub fn new(target: &str) -> Result<Self> {
        let raw = if target.contains("://") {
            target.to_string()
        } else {
            format!("https://{target}")
        };
        let mut url = reqwest::Url::parse(&raw).map_err(|_| Error::InvalidUrl(target.to_string()))?;
        let _ = url.set_scheme("https");
        Ok(Self { target: url })
    }
}

#[async_trait::async_trait]
impl Source for HttpScraper {
    async fn fetch(&self) -> Result<BoxStream<'static, Result<RemoteAsset>>> {
        let resp = reqwest::get(self.target.clone())
            .await
            .map_err(|e| Error::RemoteTransient(e.to_string()))?;
        let body = resp.text().await.map_err(|e| Error::RemoteTransient(e.to_string()))?;

        let base = self.target.clone();
        let document = Html::parse_document(&body);
        let selector = Selector::parse("a[href]").expect("static selector");

        let mut items = Vec::new();
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else { continue };
            let Ok(absolute) = base.join(href) else { continue };
            if !absolute.as_str().starts_with(base.as_str()) {
                continue;
            }
            let suffix = absolute.as_str()[base.as_str().len()..].trim_start_matches('/').to_string();
            if suffix.is_empty() {
                continue;
            }
            let filename = suffix.rsplit('/').next().unwrap_or(&suffix).to_string();
            let name = element.text().collect::<String>();
            let mut labels = std::collections::BTreeMap::new();
            labels.insert("name".to_string(), name);
            labels.insert("filename".to_string(), filename);
            items.push(Ok(RemoteAsset { id: suffix, labels }));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn pull(&self, _db: &Db, _pid: PartitionId, _id: &str) -> Result<Ref> {
        Err(Error::NotImplemented("http-scrape pull"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forces_https_scheme() {
        let s = HttpScraper::new("example.com/dist").unwrap();
        assert_eq!(s.target.scheme(), "https");
    }

    #[test]
    fn rejects_unparseable_target() {
        assert!(HttpScraper::new("::::").is_err());
    }
}
