//! Fetching and parsing of call documents.
//!
//! A [`Fetcher`] retrieves bytes plus an opaque change-detection state for a
//! URL; fetchers are selected by URL scheme. The [`YamlParser`] validates
//! payloads against the embedded JSON Schema and stamps the campaign onto
//! every call. [`Sourcer`] composes the two for the poller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use rrule::{RRule, Unvalidated};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

use crate::model::Source;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to parse url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("git error: {0}")]
    Git(String),
}

/// Fetches the content of a URL, returning the bytes and an opaque state
/// string that changes when the content changes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), SourceError>;
}

fn content_state(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Dispatches fetches to scheme-specific fetchers.
#[derive(Default)]
pub struct CompositeFetcher {
    fetchers: HashMap<String, Box<dyn Fetcher>>,
}

impl CompositeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fetcher(&mut self, scheme: impl Into<String>, fetcher: Box<dyn Fetcher>) {
        self.fetchers.insert(scheme.into(), fetcher);
    }
}

#[async_trait]
impl Fetcher for CompositeFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), SourceError> {
        let parsed = Url::parse(url).map_err(|err| SourceError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let fetcher = self
            .fetchers
            .get(parsed.scheme())
            .ok_or_else(|| SourceError::UnsupportedScheme(parsed.scheme().to_string()))?;
        fetcher.fetch(url).await
    }
}

/// Fetches documents over HTTP(S). The state is the `ETag` header when
/// present, then `Last-Modified`, then a hash of the body.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default http client");
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SourceError::Fetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(SourceError::Fetch {
                url: url.to_string(),
                reason: format!("status code {}", response.status().as_u16()),
            });
        }

        let header_state = response
            .headers()
            .get(reqwest::header::ETAG)
            .or_else(|| response.headers().get(reqwest::header::LAST_MODIFIED))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|err| SourceError::Fetch {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

        let state = header_state.unwrap_or_else(|| content_state(&body));
        Ok((body.to_vec(), state))
    }
}

/// Reads `file://` documents from the local filesystem.
#[derive(Default)]
pub struct FileFetcher;

impl FileFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), SourceError> {
        let parsed = Url::parse(url).map_err(|err| SourceError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let data = std::fs::read(parsed.path())?;
        let state = content_state(&data);
        Ok((data, state))
    }
}

/// Reads a file out of a git repository.
///
/// URLs have the shape `git://<host>/<owner>/<repo>/tree/<refspec>/<path>`.
/// The repository is shallow-cloned over HTTPS into a scratch directory;
/// hosts may have a token configured for authentication.
pub struct GitFetcher {
    tokens: HashMap<String, String>,
}

impl GitFetcher {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    fn fetch_blocking(&self, url: &str) -> Result<(Vec<u8>, String), SourceError> {
        let parsed = Url::parse(url).map_err(|err| SourceError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SourceError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|segments| segments.collect())
            .unwrap_or_default();
        // <owner>/<repo>/tree/<refspec>/<path...>
        if segments.len() < 5 || segments[2] != "tree" {
            return Err(SourceError::InvalidUrl {
                url: url.to_string(),
                reason: "expected git://<host>/<owner>/<repo>/tree/<refspec>/<path>".to_string(),
            });
        }
        let (owner, repo, refspec) = (segments[0], segments[1], segments[3]);
        let file_path: PathBuf = segments[4..].iter().collect();

        let remote = match self.tokens.get(&host) {
            Some(token) => format!("https://x-access-token:{token}@{host}/{owner}/{repo}.git"),
            None => format!("https://{host}/{owner}/{repo}.git"),
        };

        let scratch = tempfile::tempdir()?;
        let output = Command::new("git")
            .arg("clone")
            .arg("--quiet")
            .arg("--depth")
            .arg("1")
            .arg("--branch")
            .arg(refspec)
            .arg(&remote)
            .arg(scratch.path())
            .output()?;
        if !output.status.success() {
            // The remote URL may embed a token; report stderr only.
            return Err(SourceError::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let data = std::fs::read(scratch.path().join(&file_path))?;
        let state = content_state(&data);
        Ok((data, state))
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), SourceError> {
        let fetcher = Self {
            tokens: self.tokens.clone(),
        };
        let url = url.to_string();
        tokio::task::spawn_blocking(move || fetcher.fetch_blocking(&url))
            .await
            .map_err(|err| SourceError::Git(err.to_string()))?
    }
}

/// Parses fetched bytes into a [`Source`]. Returns `Ok(None)` for documents
/// that are invalid but non-fatal: the caller skips them.
pub trait Parser: Send + Sync {
    fn parse(&self, url: &str, data: &[u8]) -> Result<Option<Source>, SourceError>;
}

const SOURCE_SCHEMA: &str = include_str!("schema.json");

pub struct YamlParser {
    schema: jsonschema::JSONSchema,
}

impl YamlParser {
    pub fn new() -> Self {
        let schema: serde_json::Value =
            serde_json::from_str(SOURCE_SCHEMA).expect("embedded schema is valid json");
        let schema =
            jsonschema::JSONSchema::compile(&schema).expect("embedded schema compiles");
        Self { schema }
    }

    fn fill_campaign(&self, url: &str, source: &mut Source) {
        let path = Url::parse(url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        if source.campaign.id.is_empty() {
            let base = path.rsplit('/').next().unwrap_or(&path);
            let stem = base
                .strip_suffix(".yaml")
                .or_else(|| base.strip_suffix(".yml"))
                .unwrap_or(base);
            source.campaign.id = stem.replace('.', "-");
        }
        if source.campaign.name.is_empty() {
            source.campaign.name = path;
        }
    }
}

impl Default for YamlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for YamlParser {
    fn parse(&self, url: &str, data: &[u8]) -> Result<Option<Source>, SourceError> {
        // The schema validator works on JSON, so round-trip the YAML first.
        let document: serde_json::Value = match serde_yaml::from_slice(data) {
            Ok(value) => value,
            Err(err) => return Err(SourceError::Parse(err)),
        };

        if let Err(errors) = self.schema.validate(&document) {
            warn!("document '{}' is not valid", url);
            for error in errors {
                warn!("- {} at {}", error, error.instance_path);
            }
            return Ok(None);
        }

        let mut source: Source = serde_yaml::from_slice(data)?;
        self.fill_campaign(url, &mut source);
        for call in &mut source.calls {
            call.campaign = source.campaign.clone();
        }

        // Reject documents carrying rrules that will never expand.
        for call in &source.calls {
            for trigger in &call.triggers {
                if let Some(rule) = trigger.rrule.as_deref() {
                    if rule.parse::<RRule<Unvalidated>>().is_err() {
                        warn!("document '{}' is not valid: bad rrule '{}'", url, rule);
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(source))
    }
}

/// Fetch-and-parse composition consumed by the poller. The returned state
/// is the fetcher's; a `None` source means the document was skipped.
pub struct Sourcer {
    fetcher: Box<dyn Fetcher>,
    parser: Box<dyn Parser>,
}

impl Sourcer {
    pub fn new(fetcher: Box<dyn Fetcher>, parser: Box<dyn Parser>) -> Self {
        Self { fetcher, parser }
    }

    pub async fn source(&self, url: &str) -> Result<(Option<Source>, String), SourceError> {
        let (data, state) = self.fetcher.fetch(url).await?;
        let source = self.parser.parse(url, &data)?;
        Ok((source, state))
    }
}

/// Build the default sourcer from the configured git tokens.
pub fn build_sourcer(git_tokens: HashMap<String, String>) -> Sourcer {
    let mut fetcher = CompositeFetcher::new();
    fetcher.add_fetcher("http", Box::new(HttpFetcher::new()));
    fetcher.add_fetcher("https", Box::new(HttpFetcher::new()));
    fetcher.add_fetcher("file", Box::new(FileFetcher::new()));
    fetcher.add_fetcher("git", Box::new(GitFetcher::new(git_tokens)));
    Sourcer::new(Box::new(fetcher), Box::new(YamlParser::new()))
}
