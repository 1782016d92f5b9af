//! Change detection over the configured source URLs.

use std::collections::HashMap;

use tracing::warn;

use crate::model::Source;
use crate::sourcer::{SourceError, Sourcer};

/// Polls sources and returns only those whose opaque state changed since
/// the previous poll.
pub struct Poller {
    sourcer: Sourcer,
    known_state: HashMap<String, String>,
}

impl Poller {
    pub fn new(sourcer: Sourcer) -> Self {
        Self {
            sourcer,
            known_state: HashMap::new(),
        }
    }

    /// Poll every URL. Per-URL failures are logged and skipped so one bad
    /// source cannot starve the rest; if every URL failed and nothing was
    /// returned, the last error is surfaced.
    pub async fn poll(&mut self, urls: &[String]) -> Result<Vec<Source>, SourceError> {
        let mut sources = Vec::new();
        let mut last_error = None;
        for url in urls {
            match self.poll_url(url).await {
                Ok(Some(source)) => sources.push(source),
                Ok(None) => {}
                Err(err) => {
                    warn!("error checking source {}: {}", url, err);
                    last_error = Some(err);
                }
            }
        }

        if sources.is_empty() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Ok(sources)
    }

    async fn poll_url(&mut self, url: &str) -> Result<Option<Source>, SourceError> {
        let (source, state) = self.sourcer.source(url).await?;
        let source = match source {
            Some(source) => source,
            // Invalid document: skip without touching the known state.
            None => return Ok(None),
        };

        if self.known_state.get(url) == Some(&state) {
            return Ok(None);
        }

        self.known_state.insert(url.to_string(), state);
        Ok(Some(source))
    }
}
