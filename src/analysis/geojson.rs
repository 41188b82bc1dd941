//! GeoJSON features of a changeset for map display.

use serde_json::{json, Map, Value};

use super::history::{ElementCache, VersionRef};
use super::summary::previous;
use super::Result;
use crate::model::{Action, DiffEntry, DiffList, Element, ElementType, Modification};

pub const COLOUR_CREATE: &str = "#009a00";
pub const COLOUR_DELETE: &str = "#ff2200";
pub const COLOUR_OLD: &str = "#ffff60";
pub const COLOUR_MODIFY: &str = "#66aacc";

const PARAGRAPH_START: &str = "<p>";
const PARAGRAPH_END: &str = "</p>";

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Append `t2` to the paragraph text `t1`.
///
/// An empty `t2` closes the open paragraph. Otherwise `t2` starts a new
/// paragraph when `t1` has none open or `new_paragraph` is set, and is
/// comma-joined to the open one when not (no comma after a colon).
pub fn join_txt(t1: &str, t2: &str, new_paragraph: bool) -> String {
    let mut out = t1.to_string();
    if (t1.is_empty() || t1.ends_with(PARAGRAPH_END)) && !t2.is_empty() {
        out.push_str(PARAGRAPH_START);
        out.push_str(&capitalize(t2));
    } else if t2.is_empty() {
        out.push_str(PARAGRAPH_END);
    } else if new_paragraph {
        if !t1.is_empty() {
            out.push('.');
            out.push_str(PARAGRAPH_END);
        }
        out.push_str(PARAGRAPH_START);
        out.push_str(&capitalize(t2));
    } else {
        if !t1.ends_with(':') {
            out.push_str(", ");
        }
        out.push_str(t2);
    }
    out
}

/// Popup HTML for one diff entry. Empty if there is nothing to say.
pub fn popup_text(entry: &DiffEntry) -> String {
    let mut txt = String::new();

    // Created elements already show their tags.
    if entry.action != Action::Create {
        if let Some(diff) = &entry.tag_diff {
            for (action, heading) in [
                (Action::Create, "Added tags:"),
                (Action::Modify, "Modified tags:"),
                (Action::Delete, "Removed tags:"),
            ] {
                let bucket = diff.bucket(action);
                if !bucket.is_empty() {
                    txt = join_txt(&txt, heading, false);
                }
                for key in bucket.keys() {
                    txt = join_txt(&txt, key, false);
                }
            }
            txt = join_txt(&txt, "", true);
        }
    }

    if !entry.notes.is_empty() {
        for note in &entry.notes {
            txt = join_txt(&txt, note, false);
        }
        txt = join_txt(&txt, "", true);
    }

    if !entry.prev_authors.is_empty() {
        txt = join_txt(&txt, "Affects edits by:", true);
        for author in &entry.prev_authors {
            txt = join_txt(&txt, author.as_deref().unwrap_or("(Anonymous)"), false);
        }
    }

    if !txt.is_empty() {
        txt = join_txt(&txt, "", false);
    }
    txt
}

fn point(lon: f64, lat: f64) -> Value {
    json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [lon, lat]},
        "properties": {},
    })
}

fn line_string(points: &[(f64, f64)]) -> Value {
    let coordinates: Vec<[f64; 2]> = points.iter().map(|&(lon, lat)| [lon, lat]).collect();
    json!({
        "type": "Feature",
        "geometry": {"type": "LineString", "coordinates": coordinates},
        "properties": {},
    })
}

fn properties(feature: &mut Value) -> Option<&mut Map<String, Value>> {
    feature.get_mut("properties")?.as_object_mut()
}

async fn way_points(cache: &mut ElementCache, way: &Element) -> Result<Vec<(f64, f64)>> {
    let mut points = Vec::with_capacity(way.nd.len());
    for &nid in &way.nd {
        // The way as it was at its own timestamp.
        let node = cache
            .resolve(ElementType::Node, nid, VersionRef::At(way.timestamp), true)
            .await?;
        points.extend(node.coordinates());
    }
    Ok(points)
}

/// Build a FeatureCollection for the changeset.
///
/// Nodes become points and ways line strings. A moved node also gets a line
/// from its new to its old position. Relations have no feature.
pub async fn geojson_diff(
    cache: &mut ElementCache,
    changes: &[Modification],
    diffs: Option<&DiffList>,
) -> Result<Value> {
    let mut features = Vec::new();

    for modification in changes {
        let element_type = modification.element_type;
        let action = modification.action;
        let data = &modification.data;

        let current = cache
            .resolve(element_type, data.id, VersionRef::Exact(data.version), true)
            .await?;
        let shown = if action == Action::Delete {
            previous(cache, modification).await?
        } else {
            current.clone()
        };

        let mut feature = match element_type {
            ElementType::Node => {
                let Some((lon, lat)) = shown.coordinates() else {
                    continue;
                };
                if action == Action::Modify {
                    let old = previous(cache, modification).await?;
                    if let Some(old_point) = old.coordinates() {
                        let mut moved = line_string(&[(lon, lat), old_point]);
                        if let Some(props) = properties(&mut moved) {
                            props.insert("color".into(), json!(COLOUR_OLD));
                            props.insert("popupContent".into(), json!("Node moved"));
                            props.insert("action".into(), json!(action));
                            props.insert("type".into(), json!(element_type));
                        }
                        features.push(moved);
                    }
                }
                point(lon, lat)
            }
            ElementType::Way => line_string(&way_points(cache, &shown).await?),
            ElementType::Relation => continue,
        };

        let colour = match action {
            Action::Create => COLOUR_CREATE,
            Action::Delete => COLOUR_DELETE,
            Action::Modify => COLOUR_MODIFY,
        };
        let mut tags = Map::new();
        tags.insert(data.version.to_string(), json!(current.tag));
        if action == Action::Modify {
            let old = previous(cache, modification).await?;
            tags.insert((data.version - 1).to_string(), json!(old.tag));
        }

        if let Some(props) = properties(&mut feature) {
            props.insert("action".into(), json!(action));
            props.insert("type".into(), json!(element_type));
            props.insert("id".into(), json!(data.id));
            props.insert("color".into(), json!(colour));
            props.insert("tag".into(), Value::Object(tags));

            let entry = diffs
                .and_then(|d| d.get(&element_type))
                .and_then(|d| d.get(&data.id));
            if let Some(entry) = entry {
                let txt = popup_text(entry);
                if !txt.is_empty() {
                    props.insert("popupContent".into(), json!(txt));
                }
            }
        }
        features.push(feature);
    }

    Ok(json!({"type": "FeatureCollection", "features": features}))
}
