use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ClassConfig, ListLocation};
use crate::error::SourceError;
use crate::types::{Candidate, ProtocolClass};

/// Parse a newline-separated `host:port` list into candidates for `class`.
///
/// - one address per line, `\n` or `\r\n` endings
/// - blank lines (including the usual trailing one) are skipped
/// - everything after `#` is ignored
/// - order and duplicates are preserved
pub fn parse_candidates_str(s: &str, class: ProtocolClass) -> Vec<Candidate> {
    s.lines()
        .filter_map(|raw| {
            let line = raw.split('#').next().unwrap_or("");
            Candidate::new(line, class)
        })
        .collect()
}

/// Build candidates from already-split raw entries, dropping blank ones.
pub fn candidates_from_entries<I, S>(entries: I, class: ProtocolClass) -> Vec<Candidate>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|e| Candidate::new(e, class))
        .collect()
}

/// Produces the candidate list for a protocol class.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn fetch(&self, class: ProtocolClass) -> Result<Vec<Candidate>, SourceError>;

    /// Human-readable origin of the list, used in logs and reports.
    fn describe(&self, class: ProtocolClass) -> String;
}

/// Reads candidate lists from remote URLs or local files.
#[derive(Debug, Clone)]
pub struct ListSource {
    client: reqwest::Client,
    lists: HashMap<ProtocolClass, ListLocation>,
}

impl ListSource {
    pub fn new(classes: &[ClassConfig]) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            // Builder only fails on TLS backend init; the default client is equivalent.
            .unwrap_or_else(|_| reqwest::Client::new());
        let lists = classes.iter().map(|c| (c.class, c.location())).collect();
        Self { client, lists }
    }

    async fn fetch_url(&self, class: ProtocolClass, url: &str) -> Result<String, SourceError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| SourceError::Request {
                class,
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(SourceError::Status {
                class,
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(|source| SourceError::Request {
            class,
            url: url.to_string(),
            source,
        })
    }

    async fn read_file(&self, class: ProtocolClass, path: &Path) -> Result<String, SourceError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SourceError::Read {
                class,
                path: path.to_path_buf(),
                source,
            })
    }
}

#[async_trait]
impl EndpointSource for ListSource {
    async fn fetch(&self, class: ProtocolClass) -> Result<Vec<Candidate>, SourceError> {
        let body = match self.lists.get(&class) {
            Some(ListLocation::Url(url)) => self.fetch_url(class, url).await?,
            Some(ListLocation::File(path)) => self.read_file(class, path).await?,
            None => return Err(SourceError::NotConfigured(class)),
        };
        Ok(parse_candidates_str(&body, class))
    }

    fn describe(&self, class: ProtocolClass) -> String {
        match self.lists.get(&class) {
            Some(ListLocation::Url(url)) => url.clone(),
            Some(ListLocation::File(path)) => path.display().to_string(),
            None => "<none>".to_string(),
        }
    }
}

/// In-memory lists. A class registered with [`StaticSource::unavailable`]
/// answers like a remote list returning `503`.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    lists: HashMap<ProtocolClass, Option<String>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(mut self, class: ProtocolClass, body: impl Into<String>) -> Self {
        self.lists.insert(class, Some(body.into()));
        self
    }

    pub fn unavailable(mut self, class: ProtocolClass) -> Self {
        self.lists.insert(class, None);
        self
    }
}

#[async_trait]
impl EndpointSource for StaticSource {
    async fn fetch(&self, class: ProtocolClass) -> Result<Vec<Candidate>, SourceError> {
        match self.lists.get(&class) {
            Some(Some(body)) => Ok(parse_candidates_str(body, class)),
            Some(None) => Err(SourceError::Status {
                class,
                url: self.describe(class),
                status: 503,
            }),
            None => Err(SourceError::NotConfigured(class)),
        }
    }

    fn describe(&self, class: ProtocolClass) -> String {
        format!("memory://{class}")
    }
}
