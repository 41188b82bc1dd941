//! Element version history for one analysis run.
//!
//! Ways and relations reference unversioned nodes and members, so most
//! lookups are "the version in effect at a timestamp" or "the newest version
//! we know of". Misses are filled from the injected `ChangesetApi`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{AnalysisError, Result};
use crate::model::{Element, ElementType, Geometry};
use crate::osmapi::ChangesetApi;

/// Cached versions within this many seconds of a target timestamp are used
/// without asking upstream. Covers nodes created together with their way.
const NEAR_SECS: i64 = 2;

/// Which version of an element to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRef {
    Exact(u32),
    /// Newest version already cached, else the current upstream version.
    Newest,
    /// Version in effect at the timestamp.
    At(DateTime<Utc>),
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRef::Exact(v) => write!(f, "{}", v),
            VersionRef::Newest => f.write_str("newest"),
            VersionRef::At(ts) => write!(f, "at {}", ts),
        }
    }
}

/// Version cache keyed by `(type, id, version)`.
pub struct ElementCache {
    api: Arc<dyn ChangesetApi>,
    entries: BTreeMap<(ElementType, i64), BTreeMap<u32, Element>>,
}

impl ElementCache {
    pub fn new(api: Arc<dyn ChangesetApi>) -> Self {
        Self {
            api,
            entries: BTreeMap::new(),
        }
    }

    /// Record a known version. Versions never change once published.
    pub fn insert(&mut self, element_type: ElementType, element: Element) {
        self.entries
            .entry((element_type, element.id))
            .or_default()
            .entry(element.version)
            .or_insert(element);
    }

    pub fn exact(&self, element_type: ElementType, id: i64, version: u32) -> Option<&Element> {
        self.entries.get(&(element_type, id))?.get(&version)
    }

    /// Newest cached version, optionally skipping deleted ones.
    pub fn newest(&self, element_type: ElementType, id: i64, only_visible: bool) -> Option<&Element> {
        self.entries
            .get(&(element_type, id))?
            .values()
            .rev()
            .find(|e| !only_visible || e.visible)
    }

    /// Latest cached version with a timestamp at or before `ts`.
    pub fn at_or_before(&self, element_type: ElementType, id: i64, ts: DateTime<Utc>) -> Option<&Element> {
        self.entries
            .get(&(element_type, id))?
            .values()
            .rev()
            .find(|e| e.timestamp <= ts)
    }

    fn near(&self, element_type: ElementType, id: i64, ts: DateTime<Utc>, only_visible: bool) -> Option<&Element> {
        self.entries.get(&(element_type, id))?.values().find(|e| {
            (e.timestamp - ts).num_seconds().abs() < NEAR_SECS && (!only_visible || e.visible)
        })
    }

    /// Number of cached versions.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every cached version, for later geometry reconstruction.
    pub fn snapshot(&self) -> Geometry {
        let mut geometry = Geometry::new();
        for ((element_type, id), versions) in &self.entries {
            geometry
                .entry(*element_type)
                .or_default()
                .insert(*id, versions.clone());
        }
        geometry
    }

    async fn load_history(&mut self, element_type: ElementType, id: i64) -> Result<()> {
        debug!(element_type = %element_type, id, "Fetching element history");
        let history = self.api.element_history(element_type, id).await?;
        for element in history.into_values() {
            self.insert(element_type, element);
        }
        Ok(())
    }

    /// Make sure `version` is cached, fetching it by version and then by
    /// full history.
    async fn ensure(&mut self, element_type: ElementType, id: i64, version: u32) -> Result<Element> {
        if let Some(e) = self.exact(element_type, id, version) {
            return Ok(e.clone());
        }
        debug!(element_type = %element_type, id, version, "Fetching element version");
        if let Some(e) = self.api.element(element_type, id, Some(version)).await? {
            self.insert(element_type, e);
        } else {
            self.load_history(element_type, id).await?;
        }
        self.exact(element_type, id, version)
            .cloned()
            .ok_or_else(|| not_found(element_type, id, VersionRef::Exact(version)))
    }

    /// Resolve an element version.
    ///
    /// With `only_visible`, a deleted version resolves to the one before it,
    /// since deletions carry no coordinates or tags. Returns `NotFound` when
    /// no visible version remains.
    pub async fn resolve(
        &mut self,
        element_type: ElementType,
        id: i64,
        version: VersionRef,
        only_visible: bool,
    ) -> Result<Element> {
        let mut v = match version {
            VersionRef::Exact(v) => v,
            VersionRef::At(ts) => {
                if let Some(e) = self.near(element_type, id, ts, only_visible) {
                    return Ok(e.clone());
                }
                self.load_history(element_type, id).await?;
                self.at_or_before(element_type, id, ts)
                    .map_or(1, |e| e.version)
            }
            VersionRef::Newest => {
                if let Some(e) = self.newest(element_type, id, only_visible) {
                    return Ok(e.clone());
                }
                match self.api.element(element_type, id, None).await? {
                    Some(e) => self.insert(element_type, e),
                    None => self.load_history(element_type, id).await?,
                }
                self.newest(element_type, id, false)
                    .map(|e| e.version)
                    .ok_or_else(|| not_found(element_type, id, version))?
            }
        };

        loop {
            let element = self.ensure(element_type, id, v).await?;
            if !only_visible || element.visible {
                return Ok(element);
            }
            if v <= 1 {
                return Err(not_found(element_type, id, version));
            }
            debug!(element_type = %element_type, id, version = v, "Deleted version, trying previous");
            v -= 1;
        }
    }
}

fn not_found(element_type: ElementType, id: i64, version: VersionRef) -> AnalysisError {
    AnalysisError::NotFound {
        element_type: element_type.to_string(),
        id,
        version: version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osmapi::MockChangesetApi;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn node(id: i64, version: u32, minute: u32, visible: bool) -> Element {
        Element {
            id,
            version,
            changeset: 100 + version as i64,
            timestamp: ts(minute),
            visible,
            uid: version as i64,
            user: Some(format!("user{}", version)),
            tag: BTreeMap::new(),
            lat: visible.then_some(55.0 + version as f64),
            lon: visible.then_some(12.0),
            nd: Vec::new(),
            member: Vec::new(),
        }
    }

    async fn api_with(versions: Vec<Element>) -> Arc<MockChangesetApi> {
        let api = Arc::new(MockChangesetApi::new());
        for v in versions {
            api.add_version(ElementType::Node, v).await;
        }
        api
    }

    #[tokio::test]
    async fn test_exact_fetches_once() {
        let api = api_with(vec![node(1, 1, 0, true), node(1, 2, 10, true)]).await;
        let mut cache = ElementCache::new(api.clone());

        let e = cache
            .resolve(ElementType::Node, 1, VersionRef::Exact(2), true)
            .await
            .unwrap();
        assert_eq!(e.version, 2);
        let served = api.requests();

        cache
            .resolve(ElementType::Node, 1, VersionRef::Exact(2), true)
            .await
            .unwrap();
        assert_eq!(api.requests(), served);
    }

    #[tokio::test]
    async fn test_at_timestamp_picks_version_in_effect() {
        let api = api_with(vec![
            node(1, 1, 0, true),
            node(1, 2, 10, true),
            node(1, 3, 20, true),
        ])
        .await;
        let mut cache = ElementCache::new(api);

        let e = cache
            .resolve(ElementType::Node, 1, VersionRef::At(ts(15)), true)
            .await
            .unwrap();
        assert_eq!(e.version, 2);
    }

    #[tokio::test]
    async fn test_at_timestamp_uses_near_cached_version() {
        let api = api_with(Vec::new()).await;
        let mut cache = ElementCache::new(api.clone());
        cache.insert(ElementType::Node, node(1, 1, 30, true));

        let e = cache
            .resolve(
                ElementType::Node,
                1,
                VersionRef::At(ts(30) + chrono::Duration::seconds(1)),
                true,
            )
            .await
            .unwrap();
        assert_eq!(e.version, 1);
        assert_eq!(api.requests(), 0);
    }

    #[tokio::test]
    async fn test_deleted_version_falls_back() {
        let api = api_with(vec![node(1, 1, 0, true), node(1, 2, 10, false)]).await;
        let mut cache = ElementCache::new(api);

        let e = cache
            .resolve(ElementType::Node, 1, VersionRef::Exact(2), true)
            .await
            .unwrap();
        assert_eq!(e.version, 1);
        assert!(e.coordinates().is_some());

        let deleted = cache
            .resolve(ElementType::Node, 1, VersionRef::Exact(2), false)
            .await
            .unwrap();
        assert!(!deleted.visible);
    }

    #[tokio::test]
    async fn test_newest_prefers_cache() {
        let api = api_with(vec![node(1, 5, 0, true)]).await;
        let mut cache = ElementCache::new(api.clone());
        cache.insert(ElementType::Node, node(1, 2, 0, true));

        let e = cache
            .resolve(ElementType::Node, 1, VersionRef::Newest, true)
            .await
            .unwrap();
        assert_eq!(e.version, 2);
        assert_eq!(api.requests(), 0);
    }

    #[tokio::test]
    async fn test_newest_fetches_current_version() {
        let api = api_with(vec![node(1, 1, 0, true), node(1, 4, 5, true)]).await;
        let mut cache = ElementCache::new(api);

        let e = cache
            .resolve(ElementType::Node, 1, VersionRef::Newest, true)
            .await
            .unwrap();
        assert_eq!(e.version, 4);
    }

    #[tokio::test]
    async fn test_newest_only_invisible_is_not_found() {
        let api = api_with(Vec::new()).await;
        let mut cache = ElementCache::new(api);
        cache.insert(ElementType::Node, node(1, 1, 0, false));

        let err = cache
            .resolve(ElementType::Node, 1, VersionRef::Newest, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_element_is_not_found() {
        let api = api_with(Vec::new()).await;
        let mut cache = ElementCache::new(api);
        let err = cache
            .resolve(ElementType::Node, 9, VersionRef::Exact(3), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::NotFound { id: 9, .. }));
    }

    #[test]
    fn test_snapshot_groups_by_type() {
        let api: Arc<dyn ChangesetApi> = Arc::new(MockChangesetApi::new());
        let mut cache = ElementCache::new(api);
        cache.insert(ElementType::Node, node(1, 1, 0, true));
        cache.insert(ElementType::Node, node(1, 2, 1, true));
        let geometry = cache.snapshot();
        assert_eq!(geometry[&ElementType::Node][&1].len(), 2);
        assert_eq!(cache.len(), 2);
    }
}
