use std::fmt;
use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use serde::de::value::{MapAccessDeserializer, SeqAccessDeserializer};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};

use crate::item::{Item, NTRANS, Trans};

/// One record object as it appears on the wire, before validation. Unknown
/// keys are dropped by serde; numbers must be plain integers (serde_json
/// rejects fractions and exponents for integer targets).
#[derive(Deserialize, Default)]
struct RawRecord {
    path: Option<String>,
    size: Option<u64>,
    w: Option<u32>,
    h: Option<u32>,
    mtime: Option<i64>,
    etime: Option<i64>,
    base: Option<u64>,
    rot1: Option<u64>,
    rot2: Option<u64>,
    rot3: Option<u64>,
    flip: Option<u64>,
    flr1: Option<u64>,
    flr2: Option<u64>,
    flr3: Option<u64>,
    dist: Option<u32>,
    xform: Option<String>,
    hash: Option<u64>,
}

/// A top-level stream entry: either a record object (hasher output) or an
/// array of record objects (one cluster of grouper output).
enum RawEntry {
    One(RawRecord),
    Many(Vec<RawRecord>),
}

impl<'de> Deserialize<'de> for RawEntry {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = RawEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an image record or an array of image records")
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<RawEntry, A::Error> {
                RawRecord::deserialize(MapAccessDeserializer::new(map)).map(RawEntry::One)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<RawEntry, A::Error> {
                Vec::<RawRecord>::deserialize(SeqAccessDeserializer::new(seq)).map(RawEntry::Many)
            }
        }

        de.deserialize_any(EntryVisitor)
    }
}

/// Parser state: owns the list under construction and materialises one item
/// per record as the stream is consumed.
pub struct RecordSink<'a> {
    pub items: &'a mut Vec<Item>,
    pub missing_ok: bool,
    pub verbose: i32,
}

impl RecordSink<'_> {
    fn push(&mut self, raw: RawRecord) -> Result<()> {
        let Some(path) = raw.path else {
            bail!("record without a path");
        };
        let path = PathBuf::from(path);

        let mut hashes = [0u64; NTRANS];
        hashes[Trans::Base.index()] = raw.base.unwrap_or(0);
        hashes[Trans::Rot1.index()] = raw.rot1.unwrap_or(0);
        hashes[Trans::Rot2.index()] = raw.rot2.unwrap_or(0);
        hashes[Trans::Rot3.index()] = raw.rot3.unwrap_or(0);
        hashes[Trans::Flip.index()] = raw.flip.unwrap_or(0);
        hashes[Trans::Flr1.index()] = raw.flr1.unwrap_or(0);
        hashes[Trans::Flr2.index()] = raw.flr2.unwrap_or(0);
        hashes[Trans::Flr3.index()] = raw.flr3.unwrap_or(0);

        // Cluster-peer records carry a single hash under its variant name.
        if let Some(name) = &raw.xform {
            let t = trans_from_name(name)
                .ok_or_else(|| anyhow!("unknown transform name {name:?}"))?;
            hashes[t.index()] = raw.hash.unwrap_or(0);
        } else if raw.hash.is_some() {
            bail!("hash value without a transform name");
        }
        if let Some(d) = raw.dist
            && d > 64
        {
            bail!("distance {d} out of range");
        }

        if !self.missing_ok && !path.exists() {
            if self.verbose > 1 {
                eprintln!("skipping missing file {}", path.display());
            }
            return Ok(());
        }

        self.items.push(Item {
            path,
            size: raw.size.unwrap_or(0),
            w: raw.w.unwrap_or(0),
            h: raw.h.unwrap_or(0),
            mtime: raw.mtime.unwrap_or(0),
            etime: raw.etime,
            hashes,
        });
        Ok(())
    }
}

impl<'de, 'a, 'b> DeserializeSeed<'de> for &'a mut RecordSink<'b> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, de: D) -> Result<(), D::Error> {
        de.deserialize_seq(self)
    }
}

impl<'de, 'a, 'b> Visitor<'de> for &'a mut RecordSink<'b> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of image records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(entry) = seq.next_element::<RawEntry>()? {
            match entry {
                RawEntry::One(raw) => self.push(raw).map_err(de::Error::custom)?,
                RawEntry::Many(group) => {
                    for raw in group {
                        self.push(raw).map_err(de::Error::custom)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn trans_from_name(name: &str) -> Option<Trans> {
    match name {
        "base" => Some(Trans::Base),
        "rot1" => Some(Trans::Rot1),
        "rot2" => Some(Trans::Rot2),
        "rot3" => Some(Trans::Rot3),
        "flip" => Some(Trans::Flip),
        "flr1" => Some(Trans::Flr1),
        "flr2" => Some(Trans::Flr2),
        "flr3" => Some(Trans::Flr3),
        _ => None,
    }
}

/// Parse one record stream into the sink. Any parse or validation failure
/// is fatal and reports where in the input it happened.
pub fn parse_records(input: &str, name: &str, sink: &mut RecordSink<'_>) -> Result<()> {
    let mut de = serde_json::Deserializer::from_str(input);
    let outcome = sink.deserialize(&mut de).and_then(|()| de.end());
    outcome.map_err(|e| match byte_offset(input, e.line(), e.column()) {
        Some(off) => anyhow!("unable to parse records past byte {off} in {name}: {e}"),
        None => anyhow!("unable to parse records in {name}: {e}"),
    })
}

// serde_json reports 1-based line/column; recover the byte offset from them.
fn byte_offset(input: &str, line: usize, column: usize) -> Option<usize> {
    if line == 0 {
        return None;
    }
    let mut off = 0usize;
    for (n, l) in input.split('\n').enumerate() {
        if n + 1 == line {
            return Some(off + column.saturating_sub(1).min(l.len()));
        }
        off += l.len() + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut sink = RecordSink { items: &mut items, missing_ok: true, verbose: 1 };
        parse_records(input, "test", &mut sink)?;
        Ok(items)
    }

    #[test]
    fn parses_full_records() {
        let items = parse(
            r#"[
              {"path":"a.jpg","size":10,"w":64,"h":48,"mtime":1700000000,"etime":5,
               "base":1,"rot1":2,"rot2":3,"rot3":4,"flip":5,"flr1":6,"flr2":7,"flr3":8},
              {"path":"b.jpg","size":20,"w":32,"h":32,"mtime":0,
               "base":18446744073709551615,"rot1":0,"rot2":0,"rot3":0,"flip":0,"flr1":0,"flr2":0,"flr3":0}
            ]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path.to_str(), Some("a.jpg"));
        assert_eq!(items[0].etime, Some(5));
        assert_eq!(items[0].hashes, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(items[1].hashes[Trans::Base.index()], u64::MAX);
        assert_eq!(items[1].etime, None);
    }

    #[test]
    fn keys_arrive_in_any_order_and_unknown_keys_are_ignored() {
        let items = parse(
            r#"[{"flip":9,"path":"a.jpg","whatever":"x","nested":{"deep":[1,2]},"size":1,
                 "w":8,"h":8,"mtime":2,"base":7,"rot1":0,"rot2":0,"rot3":0,"flr1":0,"flr2":0,"flr3":0}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].hashes[Trans::Flip.index()], 9);
        assert_eq!(items[0].hashes[Trans::Base.index()], 7);
    }

    #[test]
    fn peer_records_store_hash_under_their_transform() {
        let items = parse(
            r#"[{"path":"p.jpg","size":1,"w":8,"h":8,"mtime":2,"dist":3,"xform":"rot2","hash":77}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].hashes[Trans::Rot2.index()], 77);
        assert_eq!(items[0].hashes[Trans::Base.index()], 0);
    }

    #[test]
    fn grouper_output_arrays_flatten() {
        let items = parse(
            r#"[
              [{"path":"root.jpg","size":1,"w":8,"h":8,"mtime":0,
                "base":5,"rot1":0,"rot2":0,"rot3":0,"flip":0,"flr1":0,"flr2":0,"flr3":0},
               {"path":"peer.jpg","size":2,"w":8,"h":8,"mtime":0,"dist":1,"xform":"flip","hash":4}],
              {"path":"solo.jpg","size":3,"w":8,"h":8,"mtime":0,
               "base":9,"rot1":0,"rot2":0,"rot3":0,"flip":0,"flr1":0,"flr2":0,"flr3":0}
            ]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].hashes[Trans::Flip.index()], 4);
        assert_eq!(items[2].hashes[Trans::Base.index()], 9);
    }

    #[test]
    fn fractional_numbers_are_fatal() {
        let err = parse(r#"[{"path":"a.jpg","size":1.5}]"#).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("unable to parse records"), "got: {msg}");
        assert!(msg.contains("byte"), "offset missing: {msg}");
    }

    #[test]
    fn exponent_numbers_are_fatal() {
        assert!(parse(r#"[{"path":"a.jpg","size":1e3}]"#).is_err());
    }

    #[test]
    fn negative_hashes_are_fatal() {
        assert!(parse(r#"[{"path":"a.jpg","base":-1}]"#).is_err());
    }

    #[test]
    fn unknown_transform_name_is_fatal() {
        assert!(parse(r#"[{"path":"a.jpg","xform":"rot9","hash":1}]"#).is_err());
    }

    #[test]
    fn record_without_path_is_fatal() {
        assert!(parse(r#"[{"size":1}]"#).is_err());
    }

    #[test]
    fn trailing_garbage_is_fatal() {
        assert!(parse(r#"[] trailing"#).is_err());
    }

    #[test]
    fn missing_files_are_dropped_unless_allowed() {
        let input = r#"[{"path":"/no/such/file/anywhere.jpg","size":1,"w":8,"h":8,"mtime":0,
                         "base":1,"rot1":0,"rot2":0,"rot3":0,"flip":0,"flr1":0,"flr2":0,"flr3":0}]"#;

        let mut dropped = Vec::new();
        let mut sink = RecordSink { items: &mut dropped, missing_ok: false, verbose: 1 };
        parse_records(input, "test", &mut sink).unwrap();
        assert!(dropped.is_empty());

        let mut kept = Vec::new();
        let mut sink = RecordSink { items: &mut kept, missing_ok: true, verbose: 1 };
        parse_records(input, "test", &mut sink).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn hasher_records_round_trip() {
        use crate::records::{FullRecord, RecordWriter};

        let original = vec![
            Item {
                path: "one.jpg".into(),
                size: 9,
                w: 100,
                h: 50,
                mtime: 1700000001,
                etime: Some(1600000000),
                hashes: [11, 22, 33, 44, 55, 66, 77, 88],
            },
            Item {
                path: "two.jpg".into(),
                size: 10,
                w: 8,
                h: 8,
                mtime: -5,
                etime: None,
                hashes: [u64::MAX, 0, 1, 2, 3, 4, 5, 6],
            },
        ];

        let mut buf = Vec::new();
        let mut w = RecordWriter::new(&mut buf).unwrap();
        for item in &original {
            w.record(&FullRecord::from_item(item)).unwrap();
        }
        w.finish().unwrap();

        let parsed = parse(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(parsed.len(), original.len());
        for (a, b) in original.iter().zip(&parsed) {
            assert_eq!(a.path, b.path);
            assert_eq!(a.size, b.size);
            assert_eq!((a.w, a.h), (b.w, b.h));
            assert_eq!(a.mtime, b.mtime);
            assert_eq!(a.etime, b.etime);
            assert_eq!(a.hashes, b.hashes);
        }
    }

    #[test]
    fn byte_offsets_point_into_the_input() {
        let input = "[\n{\"path\":\"a.jpg\",\"size\":1.5}\n]";
        let err = parse(input).unwrap_err();
        let msg = format!("{err}");
        // The reported offset must land on the second line.
        let off: usize = msg
            .split("byte ")
            .nth(1)
            .and_then(|s| s.split(' ').next())
            .and_then(|s| s.parse().ok())
            .unwrap();
        assert!(off > 2 && off < input.len(), "offset {off} out of range");
    }
}
