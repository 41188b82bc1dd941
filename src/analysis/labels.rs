//! Label rules.
//!
//! A rule yields its label when its regex part and its area part (whichever
//! are present) both match.
//!
//! Regex parts are a list of `{path: regex}` maps: any map matches if all of
//! its entries match. Paths:
//! - `.meta.tag.comment`, `.id`: looked up in `{"id": cid, "meta": meta}`
//! - `.changes[.action][.type].<field>`: looked up in the data of the first
//!   modification (optionally filtered by action and element type) where the
//!   field has a value
//! - `comment`: shorthand for `.meta.tag.comment`
//!
//! Regexes match at the start of the value.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use super::poly::Polygon;
use super::{AnalysisError, Result};
use crate::config::{AreaCheckType, LabelRuleConfig};
use crate::model::{Action, ChangesetMeta, ElementType, Modification};

/// Values a label rule is evaluated against.
pub struct LabelContext<'a> {
    root: Value,
    meta: &'a ChangesetMeta,
    changes: Option<&'a [Modification]>,
}

impl<'a> LabelContext<'a> {
    pub fn new(cid: i64, meta: &'a ChangesetMeta, changes: Option<&'a [Modification]>) -> Self {
        let meta_value = serde_json::to_value(meta).unwrap_or_default();
        Self {
            root: json!({"id": cid, "meta": meta_value}),
            meta,
            changes,
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn lookup<'v>(mut value: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// A path into the changeset, parsed once.
#[derive(Debug, Clone, PartialEq)]
enum FieldPath {
    Root(Vec<String>),
    Changes {
        action: Option<Action>,
        element_type: Option<ElementType>,
        field: Vec<String>,
    },
}

impl FieldPath {
    fn parse(path: &str) -> Self {
        let Some(rest) = path.strip_prefix('.') else {
            return FieldPath::Root(vec!["meta".into(), "tag".into(), path.to_string()]);
        };
        let mut segments: Vec<&str> = rest.split('.').collect();
        if segments.first() != Some(&"changes") {
            return FieldPath::Root(segments.into_iter().map(String::from).collect());
        }
        segments.remove(0);

        let action = segments.first().and_then(|s| s.parse::<Action>().ok());
        if action.is_some() {
            segments.remove(0);
        }
        let element_type = segments.first().and_then(|s| s.parse::<ElementType>().ok());
        if element_type.is_some() {
            segments.remove(0);
        }
        FieldPath::Changes {
            action,
            element_type,
            field: segments.into_iter().map(String::from).collect(),
        }
    }

    fn matches(&self, regex: &Regex, ctx: &LabelContext<'_>) -> bool {
        match self {
            FieldPath::Root(segments) => {
                let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                lookup(&ctx.root, &segments)
                    .and_then(scalar)
                    .is_some_and(|value| regex.is_match(&value))
            }
            FieldPath::Changes {
                action,
                element_type,
                field,
            } => {
                let Some(changes) = ctx.changes else {
                    return false;
                };
                let field: Vec<&str> = field.iter().map(String::as_str).collect();
                for modification in changes {
                    if action.is_some_and(|a| a != modification.action)
                        || element_type.is_some_and(|t| t != modification.element_type)
                    {
                        continue;
                    }
                    let Ok(data) = serde_json::to_value(&modification.data) else {
                        continue;
                    };
                    if let Some(value) = lookup(&data, &field).and_then(scalar) {
                        return regex.is_match(&value);
                    }
                }
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AreaRule {
    polygon: Polygon,
    check: AreaCheckType,
}

impl AreaRule {
    fn matches(&self, meta: &ChangesetMeta) -> bool {
        let Some(bbox) = meta.bbox() else {
            return false;
        };
        match self.check {
            AreaCheckType::CsetBbox => self.polygon.intersects_bbox(&bbox),
            AreaCheckType::CsetCenter => self.polygon.contains_bbox_center(&bbox),
        }
    }
}

/// A compiled label rule.
#[derive(Debug, Clone)]
pub struct LabelRule {
    pub label: String,
    regex: Option<Vec<Vec<(FieldPath, Regex)>>>,
    area: Option<AreaRule>,
}

impl LabelRule {
    pub fn from_config(config: &LabelRuleConfig) -> Result<Self> {
        let regex = config
            .regex
            .as_ref()
            .map(|alternatives| alternatives.iter().map(compile_conditions).collect())
            .transpose()?;
        let area = config
            .area_file
            .as_ref()
            .map(|path| {
                let polygon = Polygon::load(path)?;
                debug!(path = %path, points = polygon.len(), "Loaded area polygon");
                Ok::<_, AnalysisError>(AreaRule {
                    polygon,
                    check: config.area_check_type,
                })
            })
            .transpose()?;
        Ok(Self {
            label: config.label.clone(),
            regex,
            area,
        })
    }

    pub fn from_configs(configs: &[LabelRuleConfig]) -> Result<Vec<Self>> {
        configs.iter().map(Self::from_config).collect()
    }

    /// A rule built in code, for an area already in memory.
    pub fn with_area(label: impl Into<String>, polygon: Polygon, check: AreaCheckType) -> Self {
        Self {
            label: label.into(),
            regex: None,
            area: Some(AreaRule { polygon, check }),
        }
    }

    fn regex_matches(&self, ctx: &LabelContext<'_>) -> bool {
        let Some(alternatives) = &self.regex else {
            return true;
        };
        alternatives.iter().any(|conditions| {
            conditions
                .iter()
                .all(|(path, regex)| path.matches(regex, ctx))
        })
    }

    pub fn matches(&self, ctx: &LabelContext<'_>) -> bool {
        if !self.regex_matches(ctx) {
            return false;
        }
        self.area.as_ref().map_or(true, |area| area.matches(ctx.meta))
    }
}

fn compile_conditions(conditions: &BTreeMap<String, String>) -> Result<Vec<(FieldPath, Regex)>> {
    conditions
        .iter()
        .map(|(path, pattern)| {
            let regex = Regex::new(&format!("^(?:{})", pattern))
                .map_err(|e| AnalysisError::Rule(format!("{}: {}", path, e)))?;
            Ok((FieldPath::parse(path), regex))
        })
        .collect()
}

/// Labels of every matching rule, each label at most once, in rule order.
pub fn build_labels(rules: &[LabelRule], ctx: &LabelContext<'_>) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for rule in rules {
        if labels.contains(&rule.label) {
            continue;
        }
        if rule.matches(ctx) {
            debug!(label = %rule.label, "Label matched");
            labels.push(rule.label.clone());
        }
    }
    labels
}

/// True if `labels` holds every label of at least one group.
pub fn passes_prefilter(labels: &[String], groups: &[Vec<String>]) -> bool {
    groups
        .iter()
        .any(|group| group.iter().all(|label| labels.contains(label)))
}

#[cfg(test)]
mod tests;
