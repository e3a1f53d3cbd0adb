use std::borrow::Cow;
use std::io::Write;
use std::ops::Range;

use anyhow::Result;
use serde::Serialize;

use crate::item::{Item, NTRANS, Trans};
use crate::records::{FullRecord, RecordWriter};

/// Transform evaluation order for matching. The mirror is tried before the
/// rotations, so it wins ties; this order is what `xform` in the output
/// reflects.
pub const MATCH_ORDER: [Trans; NTRANS] = [
    Trans::Base,
    Trans::Flip,
    Trans::Rot1,
    Trans::Rot2,
    Trans::Rot3,
    Trans::Flr1,
    Trans::Flr2,
    Trans::Flr3,
];

pub fn hash_dist(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Distance-at-most test with an early exit once the running count passes
/// the threshold.
pub fn hash_near(a: u64, b: u64, threshold: u32) -> bool {
    let mut c = a ^ b;
    let mut d = 0u32;
    while c != 0 {
        d += 1;
        if d > threshold {
            return false;
        }
        c &= c - 1;
    }
    true
}

// Cluster membership lives outside the items, as an index-linked side
// table: parent/next realize the union-find chain and the root's intrusive
// peer list, trans/dist record how a peer matched.
#[derive(Clone, Copy, Default)]
struct Link {
    parent: Option<u32>,
    next: Option<u32>,
    trans: Option<Trans>,
    dist: Option<u32>,
    n: u32,
}

pub struct Clusters {
    links: Vec<Link>,
    threshold: u32,
}

impl Clusters {
    pub fn new(n: usize, threshold: u32) -> Self {
        Clusters { links: vec![Link::default(); n], threshold }
    }

    fn find_root(&self, mut i: usize) -> usize {
        while let Some(p) = self.links[i].parent {
            i = p as usize;
        }
        i
    }

    /// Try to claim `cand` for `reference`'s cluster. A candidate already in
    /// a cluster is never reassigned. The reference's BASE hash is compared
    /// against every variant of the candidate in MATCH_ORDER; the first
    /// transform within the threshold wins.
    fn pair(&mut self, items: &[Item], reference: usize, cand: usize) {
        if self.links[cand].parent.is_some() {
            return;
        }

        let ref_base = items[reference].hashes[Trans::Base.index()];
        let matched = MATCH_ORDER
            .into_iter()
            .find(|t| hash_near(ref_base, items[cand].hashes[t.index()], self.threshold));
        let Some(t) = matched else {
            return;
        };

        let root = self.find_root(reference);
        let dist = hash_dist(items[root].hashes[Trans::Base.index()], items[cand].hashes[t.index()]);

        self.links[cand].parent = Some(root as u32);
        self.links[cand].next = self.links[root].next;
        self.links[cand].trans = Some(t);
        self.links[cand].dist = Some(dist);
        self.links[root].next = Some(cand as u32);
        self.links[root].n += 1;
    }

    /// All unordered pairs within `range`, earlier item as reference.
    pub fn intra(&mut self, items: &[Item], range: Range<usize>) {
        for r in range.clone() {
            for c in (r + 1)..range.end {
                self.pair(items, r, c);
            }
        }
    }

    /// Every reference against every candidate; candidates are never
    /// compared to each other.
    pub fn reference(&mut self, items: &[Item], nrefs: usize) {
        for r in 0..nrefs {
            for c in nrefs..items.len() {
                self.pair(items, r, c);
            }
        }
    }

    fn peers(&self, root: usize) -> PeerIter<'_> {
        PeerIter { links: &self.links, cur: self.links[root].next }
    }

    pub fn print_plain<W: Write>(
        &self,
        items: &[Item],
        roots: Range<usize>,
        out: &mut W,
    ) -> Result<()> {
        for r in roots {
            if self.links[r].n == 0 {
                continue;
            }
            writeln!(out, "{}", items[r].path.display())?;
            for (c, _, _) in self.peers(r) {
                writeln!(out, "{}", items[c].path.display())?;
            }
        }
        Ok(())
    }

    pub fn write_records<W: Write>(
        &self,
        items: &[Item],
        roots: Range<usize>,
        writer: &mut RecordWriter<W>,
    ) -> Result<()> {
        for r in roots {
            if self.links[r].n == 0 {
                continue;
            }
            let mut group = vec![GroupEntry::Full(FullRecord::from_item(&items[r]))];
            for (c, t, d) in self.peers(r) {
                let item = &items[c];
                group.push(GroupEntry::Peer(PeerRecord {
                    path: item.path.to_string_lossy(),
                    size: item.size,
                    w: item.w,
                    h: item.h,
                    mtime: item.mtime,
                    etime: item.etime,
                    dist: d,
                    xform: t.name(),
                    hash: item.hashes[t.index()],
                }));
            }
            writer.record(&group)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn link(&self, i: usize) -> (Option<u32>, Option<Trans>, Option<u32>, u32) {
        let l = &self.links[i];
        (l.parent, l.trans, l.dist, l.n)
    }
}

struct PeerIter<'a> {
    links: &'a [Link],
    cur: Option<u32>,
}

impl Iterator for PeerIter<'_> {
    type Item = (usize, Trans, u32);

    fn next(&mut self) -> Option<(usize, Trans, u32)> {
        while let Some(c) = self.cur {
            let link = &self.links[c as usize];
            self.cur = link.next;
            if let (Some(t), Some(d)) = (link.trans, link.dist) {
                return Some((c as usize, t, d));
            }
        }
        None
    }
}

/// A matched peer in cluster output: metadata plus which variant matched the
/// root's base hash, at what distance.
#[derive(Serialize)]
struct PeerRecord<'a> {
    path: Cow<'a, str>,
    size: u64,
    w: u32,
    h: u32,
    mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    etime: Option<i64>,
    dist: u32,
    xform: &'static str,
    hash: u64,
}

#[derive(Serialize)]
#[serde(untagged)]
enum GroupEntry<'a> {
    Full(FullRecord<'a>),
    Peer(PeerRecord<'a>),
}
