use super::*;
use chrono::{TimeZone, Utc};

use crate::model::Element;

fn meta(comment: &str) -> ChangesetMeta {
    let mut tag = BTreeMap::new();
    tag.insert("comment".to_string(), comment.to_string());
    tag.insert("created_by".to_string(), "JOSM/1.5".to_string());
    ChangesetMeta {
        id: 10,
        user: Some("mapper".to_string()),
        uid: 7,
        open: false,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        closed_at: None,
        min_lat: Some(2.0),
        min_lon: Some(2.0),
        max_lat: Some(4.0),
        max_lon: Some(4.0),
        comments_count: 0,
        changes_count: 1,
        tag,
        discussion: Vec::new(),
    }
}

fn regex_rule(label: &str, alternatives: &[&[(&str, &str)]]) -> LabelRule {
    let config = LabelRuleConfig {
        label: label.to_string(),
        regex: Some(
            alternatives
                .iter()
                .map(|conds| {
                    conds
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .collect(),
        ),
        area_file: None,
        area_check_type: AreaCheckType::default(),
    };
    LabelRule::from_config(&config).unwrap()
}

fn square(min: f64, max: f64) -> Polygon {
    Polygon::new(vec![(min, min), (max, min), (max, max), (min, max)])
}

fn node_change(action: Action, tags: &[(&str, &str)]) -> Modification {
    Modification {
        action,
        element_type: ElementType::Node,
        data: Element {
            id: 1,
            version: 1,
            changeset: 10,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            visible: true,
            uid: 7,
            user: Some("mapper".to_string()),
            tag: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            lat: Some(3.0),
            lon: Some(3.0),
            nd: Vec::new(),
            member: Vec::new(),
        },
    }
}

#[test]
fn test_comment_prefix_matches() {
    let m = meta("Adjustments at somewhere");
    let ctx = LabelContext::new(10, &m, None);
    let rule = regex_rule("adjustments", &[&[(".meta.tag.comment", "Adjustments")]]);
    assert!(rule.matches(&ctx));

    let m = meta("Some Adjustments");
    let ctx = LabelContext::new(10, &m, None);
    assert!(!rule.matches(&ctx));
}

#[test]
fn test_bare_key_is_tag_shorthand() {
    let m = meta("Adjustments at somewhere");
    let ctx = LabelContext::new(10, &m, None);
    assert!(regex_rule("a", &[&[("comment", "^Adjustments")]]).matches(&ctx));
    assert!(regex_rule("josm", &[&[("created_by", "JOSM")]]).matches(&ctx));
}

#[test]
fn test_conditions_and_within_or_across() {
    let m = meta("Adjustments at somewhere");
    let ctx = LabelContext::new(10, &m, None);

    let both = regex_rule(
        "x",
        &[&[(".meta.tag.comment", "Adjustments"), (".meta.user", "someone-else")]],
    );
    assert!(!both.matches(&ctx));

    let either = regex_rule(
        "x",
        &[&[(".meta.user", "someone-else")], &[(".meta.user", "map")]],
    );
    assert!(either.matches(&ctx));
}

#[test]
fn test_numbers_and_missing_paths() {
    let m = meta("x");
    let ctx = LabelContext::new(10, &m, None);
    assert!(regex_rule("id", &[&[(".id", "10$")]]).matches(&ctx));
    assert!(regex_rule("uid", &[&[(".meta.uid", "7")]]).matches(&ctx));
    assert!(!regex_rule("missing", &[&[(".meta.tag.source", ".*")]]).matches(&ctx));
}

#[test]
fn test_changes_path() {
    let m = meta("x");
    let changes = vec![
        node_change(Action::Modify, &[]),
        node_change(Action::Create, &[("amenity", "bench")]),
    ];
    let ctx = LabelContext::new(10, &m, Some(&changes));

    assert!(regex_rule("bench", &[&[(".changes.tag.amenity", "bench")]]).matches(&ctx));
    assert!(regex_rule("bench", &[&[(".changes.create.node.tag.amenity", "bench")]]).matches(&ctx));
    assert!(!regex_rule("bench", &[&[(".changes.delete.tag.amenity", "bench")]]).matches(&ctx));
    assert!(!regex_rule("bench", &[&[(".changes.way.tag.amenity", "bench")]]).matches(&ctx));

    let without = LabelContext::new(10, &m, None);
    assert!(!regex_rule("bench", &[&[(".changes.tag.amenity", "bench")]]).matches(&without));
}

#[test]
fn test_invalid_regex_is_rule_error() {
    let config = LabelRuleConfig {
        label: "bad".to_string(),
        regex: Some(vec![[("comment".to_string(), "(".to_string())].into_iter().collect()]),
        area_file: None,
        area_check_type: AreaCheckType::default(),
    };
    assert!(matches!(
        LabelRule::from_config(&config),
        Err(AnalysisError::Rule(_))
    ));
}

#[test]
fn test_missing_area_file_is_area_error() {
    let config = LabelRuleConfig {
        label: "area".to_string(),
        regex: None,
        area_file: Some("/nonexistent/region.poly".to_string()),
        area_check_type: AreaCheckType::default(),
    };
    assert!(matches!(
        LabelRule::from_config(&config),
        Err(AnalysisError::Area { .. })
    ));
}

#[test]
fn test_area_checks() {
    let m = meta("x");
    let ctx = LabelContext::new(10, &m, None);

    // bbox 2..4 overlaps the square 3.5..10 but its centre (3, 3) lies outside
    let overlap = square(3.5, 10.0);
    assert!(LabelRule::with_area("a", overlap.clone(), AreaCheckType::CsetBbox).matches(&ctx));
    assert!(!LabelRule::with_area("a", overlap, AreaCheckType::CsetCenter).matches(&ctx));

    let around = square(0.0, 10.0);
    assert!(LabelRule::with_area("a", around.clone(), AreaCheckType::CsetCenter).matches(&ctx));

    let far = square(20.0, 30.0);
    assert!(!LabelRule::with_area("a", far, AreaCheckType::CsetBbox).matches(&ctx));

    let mut empty = meta("x");
    empty.min_lat = None;
    let ctx = LabelContext::new(10, &empty, None);
    assert!(!LabelRule::with_area("a", around, AreaCheckType::CsetBbox).matches(&ctx));
}

#[test]
fn test_build_labels_skips_duplicates() {
    let m = meta("Adjustments at somewhere");
    let ctx = LabelContext::new(10, &m, None);
    let rules = vec![
        regex_rule("adjustments", &[&[("comment", "Adjustments")]]),
        regex_rule("adjustments", &[&[("comment", "Adj")]]),
        regex_rule("josm", &[&[("created_by", "JOSM")]]),
        regex_rule("id", &[&[("created_by", "iD")]]),
        LabelRule::with_area("inside", square(0.0, 10.0), AreaCheckType::CsetCenter),
    ];
    assert_eq!(build_labels(&rules, &ctx), vec!["adjustments", "josm", "inside"]);
}

#[test]
fn test_prefilter() {
    let labels = vec!["adjustments".to_string(), "inside".to_string()];
    let group = |ls: &[&str]| ls.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    assert!(passes_prefilter(&labels, &[Vec::new()]));
    assert!(passes_prefilter(&labels, &[group(&["inside"])]));
    assert!(passes_prefilter(&labels, &[group(&["other"]), group(&["adjustments", "inside"])]));
    assert!(!passes_prefilter(&labels, &[group(&["adjustments", "other"])]));
    assert!(!passes_prefilter(&labels, &[]));
    assert!(passes_prefilter(&[], &[Vec::new()]));
}
