//! Human-readable per-element change list.

use std::collections::{BTreeMap, HashSet};

use super::history::ElementCache;
use super::summary::previous;
use super::tagdiff::VersionPair;
use super::Result;
use crate::model::{Action, DiffEntry, DiffList, Element, ElementType, Modification};

/// Tags used to qualify a label, in priority order.
const KEY_TAGS: [&str; 7] = [
    "highway", "amenity", "man_made", "leisure", "historic", "landuse", "type",
];

/// Display label of an element version.
///
/// `highway=residential, name=Main Street`, `name=Main Street`, `Way<42>`, or
/// `way<42>` for untagged elements.
pub fn element_label(element_type: ElementType, element: &Element) -> String {
    if element.tag.is_empty() {
        return format!("{}<{}>", element_type, element.id);
    }
    let label = match element.tag.get("name") {
        Some(name) => format!("name={}", name),
        None => format!("{}<{}>", element_type.title(), element.id),
    };
    KEY_TAGS
        .iter()
        .find_map(|kt| element.tag.get(*kt).map(|v| format!("{}={}, {}", kt, v, label)))
        .unwrap_or(label)
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// `(added, removed)` between two id lists, `None` if they hold the same ids.
pub fn diff_stat(old: &[i64], new: &[i64]) -> Option<(usize, usize)> {
    let old: HashSet<i64> = old.iter().copied().collect();
    let new: HashSet<i64> = new.iter().copied().collect();
    let added = new.difference(&old).count();
    let removed = old.difference(&new).count();
    if added == 0 && removed == 0 {
        None
    } else {
        Some((added, removed))
    }
}

/// Accumulates the diff list of a changeset.
#[derive(Debug, Clone, Default)]
pub struct DiffListBuilder {
    diffs: DiffList,
}

impl DiffListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&mut self, cache: &mut ElementCache, modification: &Modification) -> Result<()> {
        let element_type = modification.element_type;
        let data = &modification.data;

        let pair = VersionPair::resolve(cache, element_type, data.id, data.version).await?;
        let diff = pair.tag_diff();
        let mut entry = DiffEntry {
            action: modification.action,
            label: element_label(element_type, &pair.current),
            tag_diff: (!diff.is_empty()).then_some(diff),
            notes: Vec::new(),
            prev_authors: Vec::new(),
        };

        if modification.action == Action::Modify {
            let old = previous(cache, modification).await?;
            let changed_tags = entry.tag_diff.is_some();
            match element_type {
                ElementType::Way => {
                    let ops = diff_stat(&old.nd, &data.nd);
                    if let Some((added, removed)) = ops {
                        if added > 0 {
                            entry.notes.push(format!("added {} node{}", added, plural(added)));
                        }
                        if removed > 0 {
                            entry
                                .notes
                                .push(format!("removed {} node{}", removed, plural(removed)));
                        }
                    }
                    if (ops.is_some() || changed_tags) && old.uid != data.uid {
                        entry.prev_authors.push(old.user.clone());
                    }
                }
                ElementType::Relation => {
                    let old_refs: Vec<i64> = old.member.iter().map(|m| m.reference).collect();
                    let new_refs: Vec<i64> = data.member.iter().map(|m| m.reference).collect();
                    let ops = diff_stat(&old_refs, &new_refs);
                    if let Some((added, removed)) = ops {
                        if added > 0 {
                            entry
                                .notes
                                .push(format!("added {} member{}", added, plural(added)));
                        }
                        if removed > 0 {
                            entry
                                .notes
                                .push(format!("deleted {} member{}", removed, plural(removed)));
                        }
                    }
                    if (ops.is_some() || changed_tags) && old.uid != data.uid {
                        entry.prev_authors.push(old.user.clone());
                    }
                    if ops.is_none() && old_refs != new_refs {
                        entry.notes.push("Reordered members".to_string());
                    }
                }
                ElementType::Node => {}
            }
        }

        self.diffs
            .entry(element_type)
            .or_insert_with(BTreeMap::new)
            .insert(data.id, entry);
        Ok(())
    }

    pub fn finish(self) -> DiffList {
        self.diffs
    }
}
