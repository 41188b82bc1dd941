//! Tag differences between consecutive element versions.

use std::collections::BTreeMap;

use super::history::{ElementCache, VersionRef};
use super::Result;
use crate::model::{Element, ElementType, TagDiff};

/// An element version next to the one before it.
#[derive(Debug, Clone)]
pub struct VersionPair {
    pub current: Element,
    /// `None` for version 1.
    pub previous: Option<Element>,
}

impl VersionPair {
    /// Resolve `version` and `version - 1`, skipping deleted versions.
    pub async fn resolve(
        cache: &mut ElementCache,
        element_type: ElementType,
        id: i64,
        version: u32,
    ) -> Result<Self> {
        let current = cache
            .resolve(element_type, id, VersionRef::Exact(version), true)
            .await?;
        let previous = if version > 1 {
            Some(
                cache
                    .resolve(element_type, id, VersionRef::Exact(version - 1), true)
                    .await?,
            )
        } else {
            None
        };
        Ok(Self { current, previous })
    }

    fn previous_tags(&self) -> BTreeMap<String, String> {
        self.previous
            .as_ref()
            .map(|e| e.tag.clone())
            .unwrap_or_default()
    }

    pub fn tag_diff(&self) -> TagDiff {
        tag_diff(&self.previous_tags(), &self.current.tag)
    }

    pub fn count_unchanged(&self, counts: &mut BTreeMap<String, u64>) {
        count_unchanged(counts, &self.previous_tags(), &self.current.tag);
    }
}

/// Tag diff from `old` to `new`.
///
/// Created and deleted tags are keyed `k=v`, changed values
/// `k=old --> k=new`.
pub fn tag_diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> TagDiff {
    let mut diff = TagDiff::default();
    for (k, v) in new {
        match old.get(k) {
            Some(o) if o != v => {
                *diff
                    .modify
                    .entry(format!("{}={} --> {}={}", k, o, k, v))
                    .or_insert(0) += 1;
            }
            Some(_) => {}
            None => *diff.create.entry(format!("{}={}", k, v)).or_insert(0) += 1,
        }
    }
    for (k, v) in old {
        if !new.contains_key(k) {
            *diff.delete.entry(format!("{}={}", k, v)).or_insert(0) += 1;
        }
    }
    diff
}

/// Add the `k=v` of every tag equal in `old` and `new` to `counts`.
pub fn count_unchanged(
    counts: &mut BTreeMap<String, u64>,
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) {
    for (k, v) in new {
        if old.get(k) == Some(v) {
            *counts.entry(format!("{}={}", k, v)).or_insert(0) += 1;
        }
    }
}
