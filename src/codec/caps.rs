//! Media capabilities: a small structured description of what a pad or an
//! element accepts, e.g. `audio/x-raw, rate=(int)16000, channels=(int)1`.

use std::fmt;
use std::str::FromStr;

use combine::error::*;
use combine::parser::char::*;
use combine::parser::combinator::*;
use combine::stream::StreamErrorFor;
use combine::*;
use combine::{ParseError, Parser, Stream};
use thiserror::Error;

/// Errors from parsing caps strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapsError {
    /// The caps string is malformed.
    #[error("caps parse: {0}")]
    Parse(String),
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsValue {
    /// Integer.
    Int(i64),
    /// Inclusive integer range.
    IntRange(i64, i64),
    /// String.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Any of the values.
    List(Vec<CapsValue>),
}

impl CapsValue {
    /// Intersection of two values, `None` if they are disjoint.
    pub fn intersect(&self, other: &CapsValue) -> Option<CapsValue> {
        use CapsValue::*;
        match (self, other) {
            (List(l), v) | (v, List(l)) => {
                let mut out: Vec<CapsValue> = vec![];
                for x in l {
                    if let Some(i) = x.intersect(v) {
                        match i {
                            List(more) => out.extend(more),
                            i => out.push(i),
                        }
                    }
                }
                match out.len() {
                    0 => None,
                    1 => out.pop(),
                    _ => Some(List(out)),
                }
            }
            (Int(a), Int(b)) => (a == b).then_some(Int(*a)),
            (Int(a), IntRange(lo, hi)) | (IntRange(lo, hi), Int(a)) => {
                (a >= lo && a <= hi).then_some(Int(*a))
            }
            (IntRange(l1, h1), IntRange(l2, h2)) => {
                let lo = *l1.max(l2);
                let hi = *h1.min(h2);
                if lo > hi {
                    None
                } else if lo == hi {
                    Some(Int(lo))
                } else {
                    Some(IntRange(lo, hi))
                }
            }
            (Str(a), Str(b)) => (a == b).then(|| Str(a.clone())),
            (Bool(a), Bool(b)) => (a == b).then_some(Bool(*a)),
            _ => None,
        }
    }

    /// Largest integer the value allows.
    pub fn max_int(&self) -> Option<i64> {
        match self {
            CapsValue::Int(v) => Some(*v),
            CapsValue::IntRange(_, hi) => Some(*hi),
            CapsValue::List(l) => l.iter().filter_map(|v| v.max_int()).max(),
            _ => None,
        }
    }

    /// Smallest integer the value allows.
    pub fn min_int(&self) -> Option<i64> {
        match self {
            CapsValue::Int(v) => Some(*v),
            CapsValue::IntRange(lo, _) => Some(*lo),
            CapsValue::List(l) => l.iter().filter_map(|v| v.min_int()).min(),
            _ => None,
        }
    }

    /// String form of a fixed scalar value.
    pub fn as_string(&self) -> Option<String> {
        match self {
            CapsValue::Int(v) => Some(v.to_string()),
            CapsValue::Str(v) => Some(v.clone()),
            CapsValue::Bool(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsValue::Int(v) => write!(f, "(int){}", v),
            CapsValue::IntRange(lo, hi) => write!(f, "(int)[ {}, {} ]", lo, hi),
            CapsValue::Str(v) => {
                if v.chars().all(|c| c.is_ascii_alphanumeric() || "-_./+".contains(c)) {
                    write!(f, "(string){}", v)
                } else {
                    write!(f, "(string)\"{}\"", v)
                }
            }
            CapsValue::Bool(v) => write!(f, "(boolean){}", v),
            CapsValue::List(l) => {
                write!(f, "{{ ")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// A named set of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    name: String,
    fields: Vec<(String, CapsValue)>,
}

impl Structure {
    /// New empty structure.
    pub fn new(name: impl Into<String>) -> Self {
        Structure {
            name: name.into(),
            fields: vec![],
        }
    }

    /// Builder style field setter.
    pub fn with(mut self, name: &str, value: CapsValue) -> Self {
        self.set(name, value);
        self
    }

    /// Structure name, e.g. `application/x-rtp`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace or add a field.
    pub fn set(&mut self, name: &str, value: CapsValue) {
        if let Some(f) = self.fields.iter_mut().find(|(n, _)| n == name) {
            f.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    /// Remove a field.
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| n != name);
    }

    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&CapsValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// A fixed integer field.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            CapsValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// A fixed string field.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            CapsValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Intersection of two structures. Fields only present on one side
    /// are kept as is.
    pub fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.name != other.name {
            return None;
        }

        let mut out = self.clone();

        for (name, v) in &other.fields {
            match self.get(name) {
                Some(mine) => {
                    let i = mine.intersect(v)?;
                    out.set(name, i);
                }
                None => out.fields.push((name.clone(), v.clone())),
            }
        }

        Some(out)
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (n, v) in &self.fields {
            write!(f, ", {}={}", n, v)?;
        }
        Ok(())
    }
}

/// A set of alternative structures, or ANY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    any: bool,
    structures: Vec<Structure>,
}

impl Caps {
    /// Caps that intersect with everything.
    pub fn new_any() -> Self {
        Caps {
            any: true,
            structures: vec![],
        }
    }

    /// Caps that intersect with nothing.
    pub fn new_empty() -> Self {
        Caps {
            any: false,
            structures: vec![],
        }
    }

    /// Caps from a list of structures.
    pub fn from_structures(structures: Vec<Structure>) -> Self {
        Caps {
            any: false,
            structures,
        }
    }

    /// Caps with a single structure.
    pub fn from_structure(s: Structure) -> Self {
        Self::from_structures(vec![s])
    }

    /// Whether these are ANY caps.
    pub fn is_any(&self) -> bool {
        self.any
    }

    /// Whether these caps allow nothing.
    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    /// The structures.
    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    /// Append the structures of `other`.
    pub fn append(&mut self, other: Caps) {
        if other.any {
            self.any = true;
            self.structures.clear();
        } else if !self.any {
            for s in other.structures {
                if !self.structures.contains(&s) {
                    self.structures.push(s);
                }
            }
        }
    }

    /// Intersection of two caps.
    pub fn intersect(&self, other: &Caps) -> Caps {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }

        let mut out = vec![];
        for a in &self.structures {
            for b in &other.structures {
                if let Some(s) = a.intersect(b) {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
        }

        Caps::from_structures(out)
    }

    /// Whether the intersection is non-empty.
    pub fn can_intersect(&self, other: &Caps) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Largest integer any structure allows for `field`.
    pub fn max_int(&self, field: &str) -> Option<i64> {
        self.structures
            .iter()
            .filter_map(|s| s.get(field).and_then(|v| v.max_int()))
            .max()
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }
        if self.structures.is_empty() {
            return write!(f, "EMPTY");
        }
        for (i, s) in self.structures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", s)?;
        }
        Ok(())
    }
}

impl FromStr for Caps {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        caps_parser()
            .easy_parse(s)
            .map(|(caps, _)| caps)
            .map_err(|e| CapsError::Parse(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Hint {
    Int,
    Str,
    Bool,
}

enum Raw {
    Scalar(String, bool),
    Range(String, String),
    List(Vec<(Option<Hint>, String, bool)>),
}

fn coerce(hint: Option<Hint>, s: &str, quoted: bool) -> Result<CapsValue, String> {
    match hint {
        Some(Hint::Int) => s
            .parse::<i64>()
            .map(CapsValue::Int)
            .map_err(|e| format!("{}: {}", s, e)),
        Some(Hint::Bool) => match s {
            "true" | "yes" | "1" => Ok(CapsValue::Bool(true)),
            "false" | "no" | "0" => Ok(CapsValue::Bool(false)),
            _ => Err(format!("not a boolean: {}", s)),
        },
        Some(Hint::Str) => Ok(CapsValue::Str(s.to_string())),
        None if quoted => Ok(CapsValue::Str(s.to_string())),
        None => Ok(s
            .parse::<i64>()
            .map(CapsValue::Int)
            .unwrap_or_else(|_| match s {
                "true" => CapsValue::Bool(true),
                "false" => CapsValue::Bool(false),
                _ => CapsValue::Str(s.to_string()),
            })),
    }
}

fn caps_parser<Input>() -> impl Parser<Input, Output = Caps>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let any = attempt(string("ANY")).map(|_| Caps::new_any());
    let empty = attempt(string("EMPTY")).map(|_| Caps::new_empty());
    let list = sep_by1::<Vec<_>, _, _, _>(
        structure(),
        attempt((spaces(), token(';'), spaces())),
    )
    .map(Caps::from_structures);

    (spaces(), choice((any, empty, list)), spaces(), eof()).map(|(_, caps, _, _)| caps)
}

fn structure<Input>() -> impl Parser<Input, Output = Structure>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let name = many1::<String, _, _>(satisfy(|c: char| {
        c.is_ascii_alphanumeric() || "/_.+-".contains(c)
    }));

    let field = attempt((spaces(), token(','), spaces(), field())).map(|(_, _, _, f)| f);

    (name, many::<Vec<_>, _, _>(field)).map(|(name, fields)| {
        let mut s = Structure::new(name);
        for (n, v) in fields {
            s.set(&n, v);
        }
        s
    })
}

fn field<Input>() -> impl Parser<Input, Output = (String, CapsValue)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let name = many1::<String, _, _>(satisfy(|c: char| {
        c.is_ascii_alphanumeric() || "-_".contains(c)
    }));

    let range = (
        token('['),
        spaces(),
        scalar(),
        spaces(),
        token(','),
        spaces(),
        scalar(),
        spaces(),
        token(']'),
    )
        .map(|(_, _, lo, _, _, _, hi, _, _)| Raw::Range(lo.0, hi.0));

    let list = (
        token('{'),
        spaces(),
        sep_by::<Vec<_>, _, _, _>(
            (optional(hint()), spaces(), scalar(), spaces())
                .map(|(h, _, (s, q), _)| (h, s, q)),
            (token(','), spaces()),
        ),
        token('}'),
    )
        .map(|(_, _, l, _)| Raw::List(l));

    let raw = choice((range, list, scalar().map(|(s, q)| Raw::Scalar(s, q))));

    (
        name,
        spaces(),
        token('='),
        spaces(),
        optional(hint()),
        spaces(),
        raw,
    )
        .and_then(|(name, _, _, _, hint, _, raw)| {
            let value = match raw {
                Raw::Scalar(s, q) => coerce(hint, &s, q),
                Raw::Range(lo, hi) => match (lo.parse::<i64>(), hi.parse::<i64>()) {
                    (Ok(lo), Ok(hi)) if lo <= hi => Ok(CapsValue::IntRange(lo, hi)),
                    _ => Err(format!("bad range: [{}, {}]", lo, hi)),
                },
                Raw::List(l) => l
                    .iter()
                    .map(|(h, s, q)| coerce(h.or(hint), s, *q))
                    .collect::<Result<Vec<_>, _>>()
                    .map(CapsValue::List),
            };
            value
                .map(|v| (name, v))
                .map_err(StreamErrorFor::<Input>::message_format)
        })
}

fn hint<Input>() -> impl Parser<Input, Output = Hint>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    between(token('('), token(')'), many1::<String, _, _>(letter())).and_then(|s: String| {
        match s.as_str() {
            "int" | "i" | "uint" | "u" => Ok(Hint::Int),
            "string" | "str" | "s" => Ok(Hint::Str),
            "boolean" | "bool" | "b" => Ok(Hint::Bool),
            _ => Err(StreamErrorFor::<Input>::message_format(format!(
                "unknown type: {}",
                s
            ))),
        }
    })
}

fn scalar<Input>() -> impl Parser<Input, Output = (String, bool)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let quoted = between(
        token('"'),
        token('"'),
        many::<String, _, _>(satisfy(|c| c != '"')),
    )
    .map(|s| (s, true));

    let bare = many1::<String, _, _>(satisfy(|c: char| {
        !c.is_whitespace() && !",;{}[]\"".contains(c)
    }))
    .map(|s| (s, false));

    choice((quoted, bare))
}
