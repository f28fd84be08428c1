//! Telephone-event lists, e.g. `0-15,32`.

use std::fmt;
use std::str::FromStr;

use combine::error::StreamError;
use combine::parser::char::*;
use combine::stream::StreamErrorFor;
use combine::*;
use combine::{ParseError, Parser, Stream};

use super::CapsError;

/// Set of telephony event numbers in `[0, 255]`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventList([u64; 4]);

impl EventList {
    /// The events every RFC 4733 implementation supports.
    pub fn dtmf_default() -> Self {
        let mut l = EventList::default();
        l.insert_range(0, 15);
        l
    }

    pub fn insert(&mut self, ev: u8) {
        self.0[(ev / 64) as usize] |= 1 << (ev % 64);
    }

    pub fn insert_range(&mut self, from: u8, to: u8) {
        for ev in from..=to {
            self.insert(ev);
        }
    }

    pub fn contains(&self, ev: u8) -> bool {
        self.0[(ev / 64) as usize] & (1 << (ev % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn intersect(&self, other: &EventList) -> EventList {
        let mut out = EventList::default();
        for i in 0..4 {
            out.0[i] = self.0[i] & other.0[i];
        }
        out
    }

    /// Consecutive runs as inclusive ranges.
    fn runs(&self) -> Vec<(u8, u8)> {
        let mut runs: Vec<(u8, u8)> = vec![];
        for ev in 0..=255_u8 {
            if !self.contains(ev) {
                continue;
            }
            match runs.last_mut() {
                Some((_, end)) if *end as u16 + 1 == ev as u16 => *end = ev,
                _ => runs.push((ev, ev)),
            }
        }
        runs
    }
}

impl fmt::Display for EventList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (start, end)) in self.runs().into_iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EventList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventList({})", self)
    }
}

impl FromStr for EventList {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        event_list_parser()
            .easy_parse(s)
            .map(|(l, _)| l)
            .map_err(|e| CapsError::Parse(e.to_string()))
    }
}

fn event_list_parser<Input>() -> impl Parser<Input, Output = EventList>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let num = || {
        many1::<String, _, _>(digit())
            .and_then(|s| s.parse::<u8>().map_err(StreamErrorFor::<Input>::message_format))
    };

    let element = (num(), optional((token('-'), num()).map(|(_, n)| n))).and_then(
        |(from, to): (u8, Option<u8>)| {
            let to = to.unwrap_or(from);
            if to < from {
                return Err(StreamErrorFor::<Input>::message_format(format!(
                    "reversed range {}-{}",
                    from, to
                )));
            }
            Ok((from, to))
        },
    );

    (sep_by1::<Vec<_>, _, _, _>(element, token(',')), eof()).map(|(elements, _)| {
        let mut l = EventList::default();
        for (from, to) in elements {
            l.insert_range(from, to);
        }
        l
    })
}
