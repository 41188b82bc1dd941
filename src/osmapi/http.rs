//! reqwest-backed `ChangesetApi`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::xml::{parse_changeset, parse_elements, parse_osm_change};
use super::{ApiError, ChangesetApi, Result};
use crate::config::TrackerConfig;
use crate::model::{ChangesetMeta, Element, ElementType, Modification};
use crate::utils::retry::api_backoff;

/// Client for the OSM API 0.6.
#[derive(Clone)]
pub struct OsmApiClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl OsmApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(
            config.osm_api_url.clone(),
            Duration::from_secs(config.api_timeout_secs),
        )
    }

    pub fn changeset_url(&self, cid: i64) -> String {
        format!(
            "{}/api/0.6/changeset/{}?include_discussion=true",
            self.base_url, cid
        )
    }

    pub fn download_url(&self, cid: i64) -> String {
        format!("{}/api/0.6/changeset/{}/download", self.base_url, cid)
    }

    pub fn element_url(&self, element_type: ElementType, id: i64, version: Option<u32>) -> String {
        match version {
            Some(v) => format!("{}/api/0.6/{}/{}/{}", self.base_url, element_type, id, v),
            None => format!("{}/api/0.6/{}/{}", self.base_url, element_type, id),
        }
    }

    pub fn history_url(&self, element_type: ElementType, id: i64) -> String {
        format!("{}/api/0.6/{}/{}/history", self.base_url, element_type, id)
    }

    /// GET with retries. `Ok(None)` for 404 and 410.
    async fn get_text(&self, url: &str) -> Result<Option<String>> {
        (|| async { self.get(url).await })
            .retry(api_backoff())
            .when(ApiError::is_transient)
            .notify(|e, delay| {
                warn!(url, error = %e, delay_ms = delay.as_millis() as u64, "API request failed, retrying");
            })
            .await
    }

    async fn get(&self, url: &str) -> Result<Option<String>> {
        let response = self.http.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!(url, status = status.as_u16(), "Resource gone");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(Some(response.text().await?))
    }

    async fn require_text(&self, url: String) -> Result<String> {
        self.get_text(&url).await?.ok_or(ApiError::NotFound(url))
    }
}

#[async_trait]
impl ChangesetApi for OsmApiClient {
    async fn changeset(&self, cid: i64) -> Result<ChangesetMeta> {
        let body = self.require_text(self.changeset_url(cid)).await?;
        parse_changeset(&body)
    }

    async fn changeset_download(&self, cid: i64) -> Result<Vec<Modification>> {
        let body = self.require_text(self.download_url(cid)).await?;
        let modifications = parse_osm_change(&body)?;
        debug!(cid, modifications = modifications.len(), "Downloaded changeset");
        Ok(modifications)
    }

    async fn element(
        &self,
        element_type: ElementType,
        id: i64,
        version: Option<u32>,
    ) -> Result<Option<Element>> {
        let Some(body) = self.get_text(&self.element_url(element_type, id, version)).await? else {
            return Ok(None);
        };
        Ok(parse_elements(&body)?
            .into_iter()
            .find(|(t, e)| *t == element_type && e.id == id)
            .map(|(_, e)| e))
    }

    async fn element_history(
        &self,
        element_type: ElementType,
        id: i64,
    ) -> Result<BTreeMap<u32, Element>> {
        let Some(body) = self.get_text(&self.history_url(element_type, id)).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(parse_elements(&body)?
            .into_iter()
            .filter(|(t, e)| *t == element_type && e.id == id)
            .map(|(_, e)| (e.version, e))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = OsmApiClient::new("https://api.openstreetmap.org/", Duration::from_secs(30));
        assert_eq!(
            client.changeset_url(10),
            "https://api.openstreetmap.org/api/0.6/changeset/10?include_discussion=true"
        );
        assert_eq!(
            client.download_url(10),
            "https://api.openstreetmap.org/api/0.6/changeset/10/download"
        );
        assert_eq!(
            client.element_url(ElementType::Way, 5, Some(3)),
            "https://api.openstreetmap.org/api/0.6/way/5/3"
        );
        assert_eq!(
            client.element_url(ElementType::Node, 5, None),
            "https://api.openstreetmap.org/api/0.6/node/5"
        );
        assert_eq!(
            client.history_url(ElementType::Relation, 9),
            "https://api.openstreetmap.org/api/0.6/relation/9/history"
        );
    }

    #[test]
    fn test_transient_statuses() {
        let status = |status| ApiError::Status {
            url: String::new(),
            status,
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(400).is_transient());
        assert!(!ApiError::NotFound("x".to_string()).is_transient());
    }
}
