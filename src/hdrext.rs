//! RTP header extension negotiation.

use serde::{Deserialize, Serialize};

use crate::dir::Direction;

/// Id of an extension still waiting for a number.
pub const UNASSIGNED: u16 = 256;

/// An RTP header extension, as in `a=extmap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderExtension {
    /// In `[1, 255]`, or [`UNASSIGNED`].
    pub id: u16,
    pub direction: Direction,
    pub uri: String,
}

impl HeaderExtension {
    pub fn new(id: u16, direction: Direction, uri: &str) -> Self {
        HeaderExtension {
            id,
            direction,
            uri: uri.to_string(),
        }
    }

    fn has_valid_id(&self) -> bool {
        (1..=255).contains(&self.id)
    }
}

struct IdMap([bool; 256]);

impl IdMap {
    fn new<'a>(exts: impl Iterator<Item = &'a HeaderExtension>) -> Self {
        let mut m = IdMap([false; 256]);
        for e in exts {
            if e.has_valid_id() {
                m.0[e.id as usize] = true;
            }
        }
        m
    }

    fn is_used(&self, id: u16) -> bool {
        self.0.get(id as usize).copied().unwrap_or(true)
    }

    fn take_lowest(&mut self) -> Option<u16> {
        let id = (1..=255u16).find(|id| !self.0[*id as usize])?;
        self.0[id as usize] = true;
        Some(id)
    }
}

/// Local extensions, keeping ids the previous negotiation gave each URI.
pub fn create_local_header_extensions(
    prefs: &[HeaderExtension],
    old: &[HeaderExtension],
) -> Vec<HeaderExtension> {
    let mut out: Vec<HeaderExtension> = vec![];

    for p in prefs {
        let mut h = p.clone();

        if let Some(o) = old.iter().find(|o| o.uri == p.uri && o.has_valid_id()) {
            h.id = o.id;
        }
        if !h.has_valid_id() || out.iter().any(|x| x.id == h.id) {
            h.id = UNASSIGNED;
        }

        out.push(h);
    }

    out
}

/// Pair local extensions with what one remote announced. Extensions the
/// remote lacks are dropped.
///
/// With `favor_remote` the remote ids are taken. Otherwise the local ids are
/// kept and remote ids only fill in unassigned ones.
pub fn negotiate_stream_header_extensions(
    local: Vec<HeaderExtension>,
    remote: &[HeaderExtension],
    favor_remote: bool,
) -> Vec<HeaderExtension> {
    let mut paired: Vec<(HeaderExtension, u16)> = vec![];

    for l in local {
        let Some(r) = remote.iter().find(|r| r.uri == l.uri) else {
            debug!("Dropping header extension {}, not used by remote", l.uri);
            continue;
        };
        let mut h = l;
        h.direction = h.direction.intersect(r.direction);
        paired.push((h, r.id));
    }

    if favor_remote {
        let mut out: Vec<HeaderExtension> = vec![];
        for (mut h, rid) in paired {
            h.id = if (1..=255).contains(&rid) && !out.iter().any(|x| x.id == rid) {
                rid
            } else {
                UNASSIGNED
            };
            out.push(h);
        }
        return out;
    }

    let mut used = IdMap::new(paired.iter().map(|(h, _)| h));
    paired
        .into_iter()
        .map(|(mut h, rid)| {
            if h.id == UNASSIGNED && !used.is_used(rid) {
                h.id = rid;
                used.0[rid as usize] = true;
            }
            h
        })
        .collect()
}

/// Give every unassigned extension the lowest free id. Later duplicates of
/// a URI are dropped, as are extensions no id is left for.
pub fn finish_header_extensions(list: Vec<HeaderExtension>) -> Vec<HeaderExtension> {
    let mut used = IdMap::new(list.iter());
    let mut out: Vec<HeaderExtension> = vec![];

    for mut h in list {
        if out.iter().any(|x| x.uri == h.uri) {
            debug!("Dropping duplicate header extension {}", h.uri);
            continue;
        }
        if !h.has_valid_id() {
            match used.take_lowest() {
                Some(id) => h.id = id,
                None => {
                    debug!("No id left for header extension {}", h.uri);
                    continue;
                }
            }
        }
        out.push(h);
    }

    out
}
