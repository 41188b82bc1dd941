//! In-memory `ChangesetApi` for tests and offline runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ApiError, ChangesetApi, Result};
use crate::model::{ChangesetMeta, Element, ElementType, Modification};

type VersionMap = HashMap<(ElementType, i64), BTreeMap<u32, Element>>;

/// Mock changeset API serving preloaded metadata, downloads and element
/// versions.
#[derive(Default)]
pub struct MockChangesetApi {
    metas: RwLock<HashMap<i64, ChangesetMeta>>,
    downloads: RwLock<HashMap<i64, Vec<Modification>>>,
    versions: RwLock<VersionMap>,
    fail_on_changeset: RwLock<bool>,
    requests: AtomicU64,
}

impl MockChangesetApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_changeset(&self, meta: ChangesetMeta) {
        self.metas.write().await.insert(meta.id, meta);
    }

    pub async fn add_download(&self, cid: i64, modifications: Vec<Modification>) {
        self.downloads.write().await.insert(cid, modifications);
    }

    pub async fn add_version(&self, element_type: ElementType, element: Element) {
        self.versions
            .write()
            .await
            .entry((element_type, element.id))
            .or_default()
            .insert(element.version, element);
    }

    /// Make `changeset` fail with a server error.
    pub async fn set_fail_on_changeset(&self, fail: bool) {
        *self.fail_on_changeset.write().await = fail;
    }

    /// Number of requests served so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangesetApi for MockChangesetApi {
    async fn changeset(&self, cid: i64) -> Result<ChangesetMeta> {
        self.count();
        if *self.fail_on_changeset.read().await {
            return Err(ApiError::Status {
                url: format!("mock://changeset/{}", cid),
                status: 500,
            });
        }
        self.metas
            .read()
            .await
            .get(&cid)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("changeset {}", cid)))
    }

    async fn changeset_download(&self, cid: i64) -> Result<Vec<Modification>> {
        self.count();
        self.downloads
            .read()
            .await
            .get(&cid)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("changeset {} download", cid)))
    }

    async fn element(
        &self,
        element_type: ElementType,
        id: i64,
        version: Option<u32>,
    ) -> Result<Option<Element>> {
        self.count();
        let versions = self.versions.read().await;
        let Some(history) = versions.get(&(element_type, id)) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => history.get(&v).cloned(),
            None => history.values().next_back().cloned(),
        })
    }

    async fn element_history(
        &self,
        element_type: ElementType,
        id: i64,
    ) -> Result<BTreeMap<u32, Element>> {
        self.count();
        Ok(self
            .versions
            .read()
            .await
            .get(&(element_type, id))
            .cloned()
            .unwrap_or_default())
    }
}
