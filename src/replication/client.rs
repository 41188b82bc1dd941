//! HTTP access to the replication feed.

use std::time::Duration;

use backon::Retryable;
use reqwest::Client;
use tracing::{debug, warn};

use super::diff::{changesets_from_envelopes, changesets_from_osc, DiffChangeset};
use super::path::path_fragment;
use super::state::ReplicationState;
use super::{FetchError, Result};
use crate::config::TrackerConfig;
use crate::model::FeedType;
use crate::utils::retry::feed_backoff;

/// Client for one replication feed server.
#[derive(Clone)]
pub struct ReplicationClient {
    http: Client,
    base_url: String,
    state_timeout: Duration,
    diff_timeout: Duration,
}

impl ReplicationClient {
    pub fn new(base_url: impl Into<String>, state_timeout: Duration, diff_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state_timeout,
            diff_timeout,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(
            config.replication_url.clone(),
            Duration::from_secs(config.state_timeout_secs),
            Duration::from_secs(config.diff_timeout_secs),
        )
    }

    /// URL of the state document at `seqno`, or of the head state.
    pub fn state_url(&self, feed: FeedType, seqno: Option<u64>) -> String {
        match (feed, seqno) {
            (FeedType::Changesets, None) => format!("{}/{}/state.yaml", self.base_url, feed),
            (_, None) => format!("{}/{}/state.txt", self.base_url, feed),
            (_, Some(seqno)) => format!(
                "{}/{}/{}.state.txt",
                self.base_url,
                feed,
                path_fragment(seqno)
            ),
        }
    }

    /// URL of the compressed diff payload at `seqno`.
    pub fn diff_url(&self, feed: FeedType, seqno: u64) -> String {
        let extension = match feed {
            FeedType::Changesets => "osm.gz",
            _ => "osc.gz",
        };
        format!(
            "{}/{}/{}.{}",
            self.base_url,
            feed,
            path_fragment(seqno),
            extension
        )
    }

    /// Fetch and parse a state document. `None` fetches the head state.
    pub async fn state(&self, feed: FeedType, seqno: Option<u64>) -> Result<ReplicationState> {
        let url = self.state_url(feed, seqno);
        let body = self.get_with_retry(&url, self.state_timeout).await?;
        let text = String::from_utf8_lossy(&body);
        let state = ReplicationState::parse(feed, &text)?;
        debug!(feed = %feed, seqno = state.seqno, timestamp = %state.timestamp, "Loaded state");
        Ok(state)
    }

    /// Fetch the diff payload at `seqno` and extract its changesets.
    pub async fn diff_changesets(&self, feed: FeedType, seqno: u64) -> Result<Vec<DiffChangeset>> {
        let url = self.diff_url(feed, seqno);
        let body = self.get_with_retry(&url, self.diff_timeout).await?;
        debug!(feed = %feed, seqno, bytes = body.len(), "Parsing diff");
        match feed {
            FeedType::Changesets => changesets_from_envelopes(&body),
            _ => changesets_from_osc(&body),
        }
    }

    async fn get_with_retry(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        (|| async { self.get(url, timeout).await })
            .retry(feed_backoff())
            .when(FetchError::is_transient)
            .notify(|e, delay| {
                warn!(url, error = %e, delay_ms = delay.as_millis() as u64, "Feed request failed, retrying");
            })
            .await
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let response = self.http.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
