//! Changeset extraction from replication diff payloads.
//!
//! Only the owning changeset of each element is of interest here, so the
//! payload is scanned as a stream instead of being materialized.

use std::collections::HashSet;
use std::io::BufReader;

use flate2::read::GzDecoder;
use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{FetchError, Result};
use crate::model::BBox;

/// A changeset referenced by a diff payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffChangeset {
    pub cid: i64,
    /// Only known for the changesets feed.
    pub bbox: Option<BBox>,
}

/// Distinct changesets referenced by node, way and relation elements of a
/// gzip-compressed osmChange payload, in order of first appearance.
pub fn changesets_from_osc(compressed: &[u8]) -> Result<Vec<DiffChangeset>> {
    scan(compressed, |name, element, decoder| {
        if !matches!(name, b"node" | b"way" | b"relation") {
            return Ok(None);
        }
        let cid = attr_i64(element, decoder, b"changeset")?;
        Ok(Some(DiffChangeset { cid, bbox: None }))
    })
}

/// Changeset envelopes of a gzip-compressed changesets feed payload.
pub fn changesets_from_envelopes(compressed: &[u8]) -> Result<Vec<DiffChangeset>> {
    scan(compressed, |name, element, decoder| {
        if name != b"changeset" {
            return Ok(None);
        }
        let cid = attr_i64(element, decoder, b"id")?;
        let coord = |key: &[u8]| -> Option<f64> {
            attr(element, decoder, key)
                .ok()
                .flatten()
                .and_then(|v| v.parse().ok())
        };
        let bbox = match (
            coord(b"min_lon"),
            coord(b"min_lat"),
            coord(b"max_lon"),
            coord(b"max_lat"),
        ) {
            (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => Some(BBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            }),
            _ => None,
        };
        Ok(Some(DiffChangeset { cid, bbox }))
    })
}

fn scan<F>(compressed: &[u8], mut visit: F) -> Result<Vec<DiffChangeset>>
where
    F: FnMut(&[u8], &BytesStart<'_>, Decoder) -> Result<Option<DiffChangeset>>,
{
    let mut reader = Reader::from_reader(BufReader::new(GzDecoder::new(compressed)));
    let mut buf = Vec::new();
    let mut found: Vec<DiffChangeset> = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => {
                let element = e.into_owned();
                if let Some(cset) = visit(element.name().as_ref(), &element, reader.decoder())? {
                    if seen.insert(cset.cid) {
                        found.push(cset);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(found)
}

fn attr(element: &BytesStart<'_>, decoder: Decoder, key: &[u8]) -> Result<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(quick_xml::Error::from)?;
        if attribute.key.as_ref() == key {
            let value = attribute.decode_and_unescape_value(decoder)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn attr_i64(element: &BytesStart<'_>, decoder: Decoder, key: &[u8]) -> Result<i64> {
    let raw = attr(element, decoder, key)?.ok_or_else(|| {
        FetchError::Parse(format!(
            "<{}> without {}",
            String::from_utf8_lossy(element.name().as_ref()),
            String::from_utf8_lossy(key)
        ))
    })?;
    raw.parse()
        .map_err(|e| FetchError::Parse(format!("{:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_changesets_from_osc_distinct_in_order() {
        let osc = r#"<?xml version='1.0' encoding='UTF-8'?>
<osmChange version="0.6" generator="Osmosis">
  <modify>
    <node id="1" version="2" timestamp="2016-07-02T22:23:17Z" uid="1" user="a" changeset="30" lat="55.0" lon="12.0"/>
    <way id="5" version="3" timestamp="2016-07-02T22:23:17Z" uid="1" user="a" changeset="10">
      <nd ref="1"/>
      <tag k="highway" v="residential"/>
    </way>
  </modify>
  <create>
    <node id="2" version="1" timestamp="2016-07-02T22:23:17Z" uid="2" user="b" changeset="30" lat="55.1" lon="12.1"/>
    <relation id="9" version="1" timestamp="2016-07-02T22:23:17Z" uid="2" user="b" changeset="20">
      <member type="way" ref="5" role="outer"/>
    </relation>
  </create>
</osmChange>"#;
        let csets = changesets_from_osc(&gzip(osc)).unwrap();
        let cids: Vec<i64> = csets.iter().map(|c| c.cid).collect();
        assert_eq!(cids, vec![30, 10, 20]);
        assert!(csets.iter().all(|c| c.bbox.is_none()));
    }

    #[test]
    fn test_changesets_from_large_osc() {
        let mut osc = String::from("<osmChange version=\"0.6\"><modify>");
        for id in 0..20_000 {
            let cid = 1_000 + (id * 7919) % 2_000;
            osc.push_str(&format!(
                r#"<node id="{}" version="1" changeset="{}" lat="55.0" lon="12.0"/>"#,
                id, cid
            ));
        }
        osc.push_str("</modify></osmChange>");

        let csets = changesets_from_osc(&gzip(&osc)).unwrap();
        assert_eq!(csets.len(), 2_000);
        assert_eq!(csets[0].cid, 1_000);
        assert_eq!(csets[1].cid, 1_000 + 7919 % 2_000);
        let distinct: HashSet<i64> = csets.iter().map(|c| c.cid).collect();
        assert_eq!(distinct.len(), csets.len());
    }

    #[test]
    fn test_changesets_from_envelopes_with_bbox() {
        let osm = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="replicate_changesets.rb">
  <changeset id="100" created_at="2016-07-02T22:20:00Z" open="true" user="a" uid="1" min_lat="55.0" max_lat="55.5" min_lon="12.0" max_lon="12.5" num_changes="3">
    <tag k="comment" v="Adjustments"/>
  </changeset>
  <changeset id="101" created_at="2016-07-02T22:21:00Z" open="true" user="b" uid="2" num_changes="0"/>
</osm>"#;
        let csets = changesets_from_envelopes(&gzip(osm)).unwrap();
        assert_eq!(csets.len(), 2);
        assert_eq!(
            csets[0].bbox,
            Some(BBox {
                min_lon: 12.0,
                min_lat: 55.0,
                max_lon: 12.5,
                max_lat: 55.5
            })
        );
        assert_eq!(csets[1].cid, 101);
        assert!(csets[1].bbox.is_none());
    }

    #[test]
    fn test_changesets_from_osc_rejects_garbage() {
        assert!(changesets_from_osc(b"not gzip").is_err());
    }

    #[test]
    fn test_missing_changeset_attribute() {
        let osc = r#"<osmChange><create><node id="1" version="1"/></create></osmChange>"#;
        assert!(matches!(
            changesets_from_osc(&gzip(osc)),
            Err(FetchError::Parse(_))
        ));
    }
}
