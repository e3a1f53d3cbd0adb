use std::borrow::Cow;
use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use crate::item::{Item, Trans};

/// The full wire form of one hashed image: metadata plus all eight variant
/// hashes as decimal 64-bit integers.
#[derive(Serialize)]
pub struct FullRecord<'a> {
    pub path: Cow<'a, str>,
    pub size: u64,
    pub w: u32,
    pub h: u32,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etime: Option<i64>,
    pub base: u64,
    pub rot1: u64,
    pub rot2: u64,
    pub rot3: u64,
    pub flip: u64,
    pub flr1: u64,
    pub flr2: u64,
    pub flr3: u64,
}

impl<'a> FullRecord<'a> {
    pub fn from_item(item: &'a Item) -> Self {
        FullRecord {
            path: item.path.to_string_lossy(),
            size: item.size,
            w: item.w,
            h: item.h,
            mtime: item.mtime,
            etime: item.etime,
            base: item.hashes[Trans::Base.index()],
            rot1: item.hashes[Trans::Rot1.index()],
            rot2: item.hashes[Trans::Rot2.index()],
            rot3: item.hashes[Trans::Rot3.index()],
            flip: item.hashes[Trans::Flip.index()],
            flr1: item.hashes[Trans::Flr1.index()],
            flr2: item.hashes[Trans::Flr2.index()],
            flr3: item.hashes[Trans::Flr3.index()],
        }
    }
}

/// Incremental writer for a record stream: one top-level JSON array whose
/// entries arrive one at a time, possibly from different workers (callers
/// serialize on their own lock). Entries are any serializable value; the
/// hasher writes `FullRecord`s, the grouper writes whole cluster arrays.
pub struct RecordWriter<W: Write> {
    out: W,
    first: bool,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(b"[")?;
        Ok(RecordWriter { out, first: true })
    }

    pub fn record<T: Serialize>(&mut self, rec: &T) -> Result<()> {
        self.out.write_all(if self.first { b"\n " } else { b",\n " })?;
        serde_json::to_writer(&mut self.out, rec)?;
        self.first = false;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.write_all(b"\n]\n")?;
        self.out.flush()?;
        Ok(())
    }
}
