//! OSM elements and the modification records of a changeset.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OSM element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    pub const ALL: [ElementType; 3] = [ElementType::Node, ElementType::Way, ElementType::Relation];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Node => "node",
            ElementType::Way => "way",
            ElementType::Relation => "relation",
        }
    }

    /// Capitalized name, as used in diff labels (`Way<42>`).
    pub fn title(&self) -> &'static str {
        match self {
            ElementType::Node => "Node",
            ElementType::Way => "Way",
            ElementType::Relation => "Relation",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(ElementType::Node),
            "way" => Ok(ElementType::Way),
            "relation" => Ok(ElementType::Relation),
            other => Err(format!("unknown element type: {}", other)),
        }
    }
}

/// Modification action in an osmChange document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Modify,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Create, Action::Modify, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Modify => "modify",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "modify" => Ok(Action::Modify),
            "delete" => Ok(Action::Delete),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Relation member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "type")]
    pub member_type: ElementType,
    #[serde(rename = "ref")]
    pub reference: i64,
    #[serde(default)]
    pub role: String,
}

/// One version of a node, way or relation.
///
/// Versions predating April 2009 may lack author fields; those parse as
/// `uid = 0` and `user = None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: i64,
    pub version: u32,
    pub changeset: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub tag: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nd: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member: Vec<Member>,
}

fn default_visible() -> bool {
    true
}

impl Element {
    /// Coordinates as `(lon, lat)`, if this is a visible node version.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lon, self.lat) {
            (Some(lon), Some(lat)) => Some((lon, lat)),
            _ => None,
        }
    }
}

/// One `{action, type, data}` record of a changeset download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub action: Action,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub data: Element,
}
