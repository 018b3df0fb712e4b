//! Where the feed document comes from.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use maskmap_core::{Error, Result};

/// Location of the feed: an HTTP(S) URL or a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Url(String),
    File(PathBuf),
}

impl FeedSource {
    /// `http://` and `https://` locations are URLs, everything else is a path.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(Error::Config("feed source is empty".to_string()));
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(FeedSource::Url(location.to_string()))
        } else {
            Ok(FeedSource::File(PathBuf::from(location)))
        }
    }

    /// Read the whole document.
    pub async fn fetch(&self, client: &reqwest::Client) -> Result<String> {
        let body = match self {
            FeedSource::Url(url) => {
                let response = client.get(url).send().await?.error_for_status()?;
                response.text().await?
            }
            FeedSource::File(path) => tokio::fs::read_to_string(path).await?,
        };
        debug!(
            subsystem = "ingest",
            op = "fetch",
            source = %self,
            bytes = body.len(),
            "Feed fetched"
        );
        Ok(body)
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedSource::Url(url) => f.write_str(url),
            FeedSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}
