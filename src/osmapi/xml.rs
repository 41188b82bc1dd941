//! OSM API 0.6 XML parsing.
//!
//! Three document shapes are handled, all as event streams:
//! - `<osm><changeset>` metadata with tags and discussion
//! - `<osmChange>` modification streams (`<create>`, `<modify>`, `<delete>`)
//! - `<osm>` element lists, as returned by element and history requests

use std::collections::BTreeMap;

use quick_xml::encoding::Decoder;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{ApiError, Result};
use crate::model::{
    parse_osm_timestamp, Action, ChangesetMeta, Comment, Element, ElementType, Member,
    Modification,
};

fn attributes(element: &BytesStart<'_>, decoder: Decoder) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| ApiError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .decode_and_unescape_value(decoder)
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        attrs.insert(key, value.into_owned());
    }
    Ok(attrs)
}

fn required<'a>(attrs: &'a BTreeMap<String, String>, key: &str, what: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ApiError::Parse(format!("{} without {}", what, key)))
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ApiError::Parse(format!("invalid {}: {:?}", key, value)))
}

fn optional_num<T: std::str::FromStr>(attrs: &BTreeMap<String, String>, key: &str) -> Result<Option<T>> {
    attrs.get(key).map(|v| parse_num(v, key)).transpose()
}

fn timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_osm_timestamp(value).ok_or_else(|| ApiError::Parse(format!("invalid timestamp: {:?}", value)))
}

fn element_from_attrs(element_type: ElementType, attrs: &BTreeMap<String, String>) -> Result<Element> {
    let what = element_type.as_str();
    Ok(Element {
        id: parse_num(required(attrs, "id", what)?, "id")?,
        version: parse_num(required(attrs, "version", what)?, "version")?,
        changeset: parse_num(required(attrs, "changeset", what)?, "changeset")?,
        timestamp: timestamp(required(attrs, "timestamp", what)?)?,
        visible: attrs.get("visible").map_or(true, |v| v != "false"),
        // Versions from before 2009 may be anonymous.
        uid: optional_num(attrs, "uid")?.unwrap_or(0),
        user: attrs.get("user").cloned(),
        tag: BTreeMap::new(),
        lat: optional_num(attrs, "lat")?,
        lon: optional_num(attrs, "lon")?,
        nd: Vec::new(),
        member: Vec::new(),
    })
}

fn element_type_of(name: &[u8]) -> Option<ElementType> {
    match name {
        b"node" => Some(ElementType::Node),
        b"way" => Some(ElementType::Way),
        b"relation" => Some(ElementType::Relation),
        _ => None,
    }
}

fn action_of(name: &[u8]) -> Option<Action> {
    match name {
        b"create" => Some(Action::Create),
        b"modify" => Some(Action::Modify),
        b"delete" => Some(Action::Delete),
        _ => None,
    }
}

/// Streaming builder for nodes, ways and relations and their children.
#[derive(Default)]
struct ElementParser {
    current: Option<(ElementType, Element)>,
}

impl ElementParser {
    /// Feed a start or empty tag. Returns a completed element for empty
    /// element tags.
    fn open(
        &mut self,
        e: &BytesStart<'_>,
        decoder: Decoder,
        empty: bool,
    ) -> Result<Option<(ElementType, Element)>> {
        let name = e.name();
        if let Some(element_type) = element_type_of(name.as_ref()) {
            let element = element_from_attrs(element_type, &attributes(e, decoder)?)?;
            if empty {
                return Ok(Some((element_type, element)));
            }
            self.current = Some((element_type, element));
            return Ok(None);
        }

        let Some((_, element)) = self.current.as_mut() else {
            return Ok(None);
        };
        match name.as_ref() {
            b"tag" => {
                let attrs = attributes(e, decoder)?;
                let k = required(&attrs, "k", "tag")?.to_string();
                let v = required(&attrs, "v", "tag")?.to_string();
                element.tag.insert(k, v);
            }
            b"nd" => {
                let attrs = attributes(e, decoder)?;
                element.nd.push(parse_num(required(&attrs, "ref", "nd")?, "ref")?);
            }
            b"member" => {
                let attrs = attributes(e, decoder)?;
                let member_type = required(&attrs, "type", "member")?
                    .parse::<ElementType>()
                    .map_err(ApiError::Parse)?;
                element.member.push(Member {
                    member_type,
                    reference: parse_num(required(&attrs, "ref", "member")?, "ref")?,
                    role: attrs.get("role").cloned().unwrap_or_default(),
                });
            }
            _ => {}
        }
        Ok(None)
    }

    /// Feed an end tag. Returns the element it closes, if any.
    fn close(&mut self, name: &[u8]) -> Option<(ElementType, Element)> {
        match (element_type_of(name), &self.current) {
            (Some(closing), Some((open, _))) if closing == *open => self.current.take(),
            _ => None,
        }
    }
}

/// Parse an `<osmChange>` document into its modifications, in order.
pub fn parse_osm_change(xml: &str) -> Result<Vec<Modification>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let decoder = reader.decoder();

    let mut parser = ElementParser::default();
    let mut action = None;
    let mut modifications = Vec::new();

    let mut push = |action: Option<Action>, (element_type, data): (ElementType, Element)| -> Result<()> {
        let action = action.ok_or_else(|| {
            ApiError::Parse(format!("{} {} outside an action block", element_type, data.id))
        })?;
        modifications.push(Modification {
            action,
            element_type,
            data,
        });
        Ok(())
    };

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if let Some(a) = action_of(e.name().as_ref()) {
                    action = Some(a);
                } else if let Some(done) = parser.open(&e, decoder, false)? {
                    push(action, done)?;
                }
            }
            Event::Empty(e) => {
                if let Some(done) = parser.open(&e, decoder, true)? {
                    push(action, done)?;
                }
            }
            Event::End(e) => {
                if action_of(e.name().as_ref()).is_some() {
                    action = None;
                } else if let Some(done) = parser.close(e.name().as_ref()) {
                    push(action, done)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(modifications)
}

/// Parse an `<osm>` document holding node, way and relation versions.
pub fn parse_elements(xml: &str) -> Result<Vec<(ElementType, Element)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let decoder = reader.decoder();

    let mut parser = ElementParser::default();
    let mut elements = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if let Some(done) = parser.open(&e, decoder, false)? {
                    elements.push(done);
                }
            }
            Event::Empty(e) => {
                if let Some(done) = parser.open(&e, decoder, true)? {
                    elements.push(done);
                }
            }
            Event::End(e) => {
                if let Some(done) = parser.close(e.name().as_ref()) {
                    elements.push(done);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(elements)
}

fn changeset_from_attrs(attrs: &BTreeMap<String, String>) -> Result<ChangesetMeta> {
    Ok(ChangesetMeta {
        id: parse_num(required(attrs, "id", "changeset")?, "id")?,
        user: attrs.get("user").cloned(),
        uid: optional_num(attrs, "uid")?.unwrap_or(0),
        open: attrs.get("open").is_some_and(|v| v == "true"),
        created_at: timestamp(required(attrs, "created_at", "changeset")?)?,
        closed_at: attrs.get("closed_at").map(|v| timestamp(v)).transpose()?,
        min_lat: optional_num(attrs, "min_lat")?,
        min_lon: optional_num(attrs, "min_lon")?,
        max_lat: optional_num(attrs, "max_lat")?,
        max_lon: optional_num(attrs, "max_lon")?,
        comments_count: optional_num(attrs, "comments_count")?.unwrap_or(0),
        changes_count: optional_num(attrs, "changes_count")?.unwrap_or(0),
        tag: BTreeMap::new(),
        discussion: Vec::new(),
    })
}

fn comment_from_attrs(attrs: &BTreeMap<String, String>) -> Result<Comment> {
    Ok(Comment {
        date: timestamp(required(attrs, "date", "comment")?)?,
        uid: optional_num(attrs, "uid")?.unwrap_or(0),
        user: attrs.get("user").cloned(),
        text: String::new(),
    })
}

/// Parse a changeset metadata document (`/changeset/{id}`).
pub fn parse_changeset(xml: &str) -> Result<ChangesetMeta> {
    // Text is kept untrimmed: entity references split it into several events.
    let mut reader = Reader::from_str(xml);
    let decoder = reader.decoder();

    let mut meta: Option<ChangesetMeta> = None;
    let mut comment: Option<Comment> = None;
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"changeset" => meta = Some(changeset_from_attrs(&attributes(&e, decoder)?)?),
                b"tag" if comment.is_none() => {
                    if let Some(meta) = meta.as_mut() {
                        let attrs = attributes(&e, decoder)?;
                        meta.tag.insert(
                            required(&attrs, "k", "tag")?.to_string(),
                            required(&attrs, "v", "tag")?.to_string(),
                        );
                    }
                }
                b"comment" => comment = Some(comment_from_attrs(&attributes(&e, decoder)?)?),
                b"text" => in_text = true,
                _ => {}
            },
            Event::Text(t) if in_text => {
                if let Some(comment) = comment.as_mut() {
                    let text = t.decode().map_err(|e| ApiError::Parse(e.to_string()))?;
                    comment.text.push_str(&text);
                }
            }
            Event::GeneralRef(r) if in_text => {
                if let Some(comment) = comment.as_mut() {
                    match r.resolve_char_ref().map_err(|e| ApiError::Parse(e.to_string()))? {
                        Some(ch) => comment.text.push(ch),
                        None => {
                            let name = r.decode().map_err(|e| ApiError::Parse(e.to_string()))?;
                            if let Some(resolved) = resolve_predefined_entity(&name) {
                                comment.text.push_str(resolved);
                            }
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"text" => in_text = false,
                b"comment" => {
                    if let (Some(meta), Some(mut done)) = (meta.as_mut(), comment.take()) {
                        done.text = done.text.trim().to_string();
                        meta.discussion.push(done);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    meta.ok_or_else(|| ApiError::Parse("document has no changeset".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse_changeset_with_discussion() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="OpenStreetMap server">
  <changeset id="10" created_at="2016-07-02T22:10:00Z" closed_at="2016-07-02T22:20:00Z" open="false" user="Bo" uid="7" min_lat="55.6" min_lon="12.5" max_lat="55.7" max_lon="12.6" comments_count="1" changes_count="4">
    <tag k="comment" v="Adjustments at somewhere"/>
    <tag k="created_by" v="JOSM/1.5"/>
    <discussion>
      <comment date="2016-07-03T08:00:00Z" uid="8" user="Al">
        <text>Thanks &amp; welcome</text>
      </comment>
    </discussion>
  </changeset>
</osm>"#;
        let meta = parse_changeset(xml).unwrap();
        assert_eq!(meta.id, 10);
        assert_eq!(meta.user.as_deref(), Some("Bo"));
        assert!(!meta.open);
        assert_eq!(
            meta.closed_at,
            Some(Utc.with_ymd_and_hms(2016, 7, 2, 22, 20, 0).unwrap())
        );
        assert_eq!(meta.tag["comment"], "Adjustments at somewhere");
        assert_eq!(meta.discussion.len(), 1);
        assert_eq!(meta.discussion[0].user.as_deref(), Some("Al"));
        assert_eq!(meta.discussion[0].text, "Thanks & welcome");
        assert_eq!(meta.bbox().map(|b| b.max_lon), Some(12.6));
    }

    #[test]
    fn test_parse_open_changeset_without_bbox() {
        let xml = r#"<osm><changeset id="11" created_at="2016-07-02T22:10:00Z" open="true" user="Bo" uid="7" comments_count="0" changes_count="0"/></osm>"#;
        let meta = parse_changeset(xml).unwrap();
        assert!(meta.open);
        assert!(meta.closed_at.is_none());
        assert!(meta.bbox().is_none());
    }

    #[test]
    fn test_parse_changeset_missing() {
        assert!(matches!(parse_changeset("<osm/>"), Err(ApiError::Parse(_))));
    }

    #[test]
    fn test_parse_osm_change() {
        let xml = r#"<osmChange version="0.6">
  <create>
    <node id="1" changeset="10" timestamp="2016-07-02T22:11:00Z" version="1" visible="true" user="Bo" uid="7" lat="55.6" lon="12.5"/>
    <way id="5" changeset="10" timestamp="2016-07-02T22:11:00Z" version="1" visible="true" user="Bo" uid="7">
      <nd ref="1"/>
      <nd ref="2"/>
      <tag k="highway" v="residential"/>
    </way>
  </create>
  <modify>
    <relation id="9" changeset="10" timestamp="2016-07-02T22:12:00Z" version="4" visible="true" user="Bo" uid="7">
      <member type="way" ref="5" role="outer"/>
      <tag k="type" v="multipolygon"/>
    </relation>
  </modify>
  <delete>
    <node id="3" changeset="10" timestamp="2016-07-02T22:13:00Z" version="2" visible="false" user="Bo" uid="7"/>
  </delete>
</osmChange>"#;
        let mods = parse_osm_change(xml).unwrap();
        assert_eq!(mods.len(), 4);

        assert_eq!(mods[0].action, Action::Create);
        assert_eq!(mods[0].element_type, ElementType::Node);
        assert_eq!(mods[0].data.coordinates(), Some((12.5, 55.6)));

        assert_eq!(mods[1].element_type, ElementType::Way);
        assert_eq!(mods[1].data.nd, vec![1, 2]);
        assert_eq!(mods[1].data.tag["highway"], "residential");

        assert_eq!(mods[2].action, Action::Modify);
        assert_eq!(mods[2].data.member[0].member_type, ElementType::Way);
        assert_eq!(mods[2].data.member[0].role, "outer");

        assert_eq!(mods[3].action, Action::Delete);
        assert!(!mods[3].data.visible);
        assert!(mods[3].data.coordinates().is_none());
    }

    #[test]
    fn test_parse_elements_anonymous_version() {
        let xml = r#"<osm version="0.6">
  <node id="1" changeset="100" timestamp="2008-01-01T00:00:00Z" version="1" visible="true" lat="1.0" lon="2.0"/>
  <node id="1" changeset="200" timestamp="2012-01-01T00:00:00Z" version="2" visible="true" user="Bo" uid="7" lat="1.5" lon="2.5">
    <tag k="amenity" v="bench"/>
  </node>
</osm>"#;
        let elements = parse_elements(xml).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].1.uid, 0);
        assert!(elements[0].1.user.is_none());
        assert_eq!(elements[1].1.tag["amenity"], "bench");
    }

    #[test]
    fn test_parse_osm_change_rejects_bad_number() {
        let xml = r#"<osmChange><create><node id="x" changeset="1" timestamp="2016-07-02T22:11:00Z" version="1"/></create></osmChange>"#;
        assert!(matches!(parse_osm_change(xml), Err(ApiError::Parse(_))));
    }
}
