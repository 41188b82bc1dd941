//! Tracker configuration: feed, analysis timing and label rules.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::ConfigError;
use crate::model::FeedType;

/// How an area rule tests a changeset against its polygon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum AreaCheckType {
    /// The changeset bounding box intersects the polygon.
    #[default]
    #[serde(rename = "cset-bbox")]
    CsetBbox,
    /// The changeset bounding box centre lies inside the polygon.
    #[serde(rename = "cset-center")]
    CsetCenter,
}

/// One label rule.
///
/// `regex` is a list of `{field-path: regex}` maps (OR across maps, AND
/// within one). When both `regex` and `area_file` are given, both must match.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelRuleConfig {
    pub label: String,
    #[serde(default)]
    pub regex: Option<Vec<BTreeMap<String, String>>>,
    #[serde(default)]
    pub area_file: Option<String>,
    #[serde(default)]
    pub area_check_type: AreaCheckType,
}

/// Tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// OSM API base URL.
    pub osm_api_url: String,
    /// Replication feed base URL.
    pub replication_url: String,
    /// Feed granularity to follow.
    pub feed_type: FeedType,
    /// Minimum age of an open changeset before it is re-analyzed.
    pub refresh_open_minutes: i64,
    /// Minimum age of changeset metadata before it is refreshed.
    pub refresh_meta_minutes: i64,
    /// Records not updated for this long are evicted.
    pub horizon_hours: i64,
    /// Wall-clock budget for the deep analysis of one changeset.
    pub cset_processing_time_max_s: Option<u64>,
    /// Age after which a record stuck in a transient state is reclaimed.
    pub claim_timeout_secs: i64,
    /// Failed steps after which a changeset is quarantined.
    pub max_failures: u32,
    /// Worker idle delay between claim rounds.
    pub poll_interval_secs: u64,
    /// Fetch loop delay after a transient network error.
    pub fetch_retry_delay_secs: u64,
    /// Timeout for diff payload downloads.
    pub diff_timeout_secs: u64,
    /// Timeout for state document downloads.
    pub state_timeout_secs: u64,
    /// Timeout for changeset API requests.
    pub api_timeout_secs: u64,
    /// Label rules evaluated on metadata before the pre-filter.
    pub pre_labels: Vec<LabelRuleConfig>,
    /// Label rules evaluated after the deep analysis.
    pub post_labels: Vec<LabelRuleConfig>,
    /// Label groups; a changeset passes if it carries every label of any group.
    pub prefilter_labels: Vec<Vec<String>>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            osm_api_url: "https://api.openstreetmap.org".to_string(),
            replication_url: "https://planet.osm.org/replication".to_string(),
            feed_type: FeedType::Minute,
            refresh_open_minutes: 5,
            refresh_meta_minutes: 15,
            horizon_hours: 48,
            cset_processing_time_max_s: None,
            claim_timeout_secs: 1200,
            max_failures: 5,
            poll_interval_secs: 15,
            fetch_retry_delay_secs: 60,
            diff_timeout_secs: 50,
            state_timeout_secs: 10,
            api_timeout_secs: 60,
            pre_labels: Vec::new(),
            post_labels: Vec::new(),
            // A single empty group is a subset of every label set.
            prefilter_labels: vec![Vec::new()],
        }
    }
}

impl TrackerConfig {
    /// Point every area rule at `path`.
    pub fn override_area_files(&mut self, path: &str) {
        for rule in self.pre_labels.iter_mut().chain(self.post_labels.iter_mut()) {
            if rule.area_file.is_some() {
                rule.area_file = Some(path.to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon_hours <= 0 {
            return Err(ConfigError::Invalid(format!(
                "horizon_hours must be positive, got {}",
                self.horizon_hours
            )));
        }
        if self.claim_timeout_secs <= 0 {
            return Err(ConfigError::Invalid(format!(
                "claim_timeout_secs must be positive, got {}",
                self.claim_timeout_secs
            )));
        }
        if self.max_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_failures must be at least 1".to_string(),
            ));
        }
        for rule in self.pre_labels.iter().chain(self.post_labels.iter()) {
            if rule.label.is_empty() {
                return Err(ConfigError::Invalid("label rule without label".to_string()));
            }
            if rule.regex.is_none() && rule.area_file.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "label rule '{}' has neither regex nor area_file",
                    rule.label
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(label: &str, area: Option<&str>) -> LabelRuleConfig {
        LabelRuleConfig {
            label: label.to_string(),
            regex: None,
            area_file: area.map(str::to_string),
            area_check_type: AreaCheckType::default(),
        }
    }

    #[test]
    fn test_default_prefilter_passes_everything() {
        let config = TrackerConfig::default();
        assert_eq!(config.prefilter_labels, vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_override_area_files_only_touches_area_rules() {
        let mut config = TrackerConfig::default();
        config.pre_labels = vec![rule("a", Some("dk.poly")), rule("b", None)];
        config.post_labels = vec![rule("c", Some("se.poly"))];
        config.override_area_files("region.poly");
        assert_eq!(config.pre_labels[0].area_file.as_deref(), Some("region.poly"));
        assert!(config.pre_labels[1].area_file.is_none());
        assert_eq!(config.post_labels[0].area_file.as_deref(), Some("region.poly"));
    }

    #[test]
    fn test_validate_rejects_empty_rule() {
        let mut config = TrackerConfig::default();
        config.pre_labels = vec![rule("nothing", None)];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_non_positive_horizon() {
        let config = TrackerConfig {
            horizon_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
