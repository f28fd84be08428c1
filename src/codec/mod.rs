//! Codec descriptors and per-encoding negotiation rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::Pt;

mod caps;
pub use caps::{Caps, CapsError, CapsValue, Structure};

mod events;
pub use events::EventList;

mod h264;

mod specific;
pub use specific::{adjust_for_caps, codec_has_config_data_named, codec_needs_config};
pub use specific::{codec_copy_filtered, codecs_list_has_codec_config_changed};
pub use specific::{sdp_negotiate_codec, ParamType};

/// Optional parameter holding a send builder description.
pub const SEND_PROFILE: &str = "farstream-send-profile";

/// Optional parameter holding a receive builder description.
pub const RECV_PROFILE: &str = "farstream-recv-profile";

/// Encoding name of placeholder preferences that reserve a payload type.
pub const RESERVE_PT: &str = "reserve-pt";

/// Media type of a codec or a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Audio.
    Audio,
    /// Video.
    Video,
    /// Application data.
    Application,
}

impl MediaType {
    /// Raw media structure name for the type.
    pub fn raw_caps_name(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio/x-raw",
            MediaType::Video => "video/x-raw",
            MediaType::Application => "application/octet-stream",
        }
    }
}

impl From<&str> for MediaType {
    fn from(v: &str) -> Self {
        match v {
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            _ => MediaType::Application,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MediaType::Audio => "audio",
                MediaType::Video => "video",
                MediaType::Application => "application",
            }
        )
    }
}

/// Payload type of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    /// A fixed payload type in `[0, 127]`.
    Pt(Pt),
    /// To be assigned.
    Any,
    /// Matching codecs are forbidden.
    Disable,
}

impl CodecId {
    /// The fixed payload type, if any.
    pub fn pt(&self) -> Option<Pt> {
        match self {
            CodecId::Pt(pt) => Some(*pt),
            _ => None,
        }
    }
}

impl From<u8> for CodecId {
    fn from(v: u8) -> Self {
        CodecId::Pt(v.into())
    }
}

impl From<Pt> for CodecId {
    fn from(v: Pt) -> Self {
        CodecId::Pt(v)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::Pt(pt) => write!(f, "{}", pt),
            CodecId::Any => write!(f, "ANY"),
            CodecId::Disable => write!(f, "DISABLE"),
        }
    }
}

/// An optional `name=value` codec parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParam {
    pub name: String,
    pub value: String,
}

/// An RTCP feedback parameter (`a=rtcp-fb`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedbackParam {
    pub kind: String,
    pub subtype: String,
    pub extra: String,
}

impl FeedbackParam {
    pub fn new(kind: &str, subtype: &str, extra: &str) -> Self {
        FeedbackParam {
            kind: kind.into(),
            subtype: subtype.into(),
            extra: extra.into(),
        }
    }

    pub(crate) fn matches(&self, other: &FeedbackParam) -> bool {
        self.kind.eq_ignore_ascii_case(&other.kind)
            && self.subtype.eq_ignore_ascii_case(&other.subtype)
            && self.extra.eq_ignore_ascii_case(&other.extra)
    }
}

/// Codec descriptor.
///
/// A zero `clock_rate` or `channels` means unspecified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codec {
    pub id: CodecId,
    pub encoding_name: String,
    pub media_type: MediaType,
    pub clock_rate: u32,
    pub channels: u32,
    /// Minimum RTCP reporting interval in milliseconds.
    pub minimum_reporting_interval: Option<u32>,
    params: Vec<CodecParam>,
    feedback: Vec<FeedbackParam>,
}

impl Codec {
    /// Create a codec without optional parameters.
    pub fn new(id: impl Into<CodecId>, encoding_name: &str, media_type: MediaType, clock_rate: u32) -> Self {
        Codec {
            id: id.into(),
            encoding_name: encoding_name.to_string(),
            media_type,
            clock_rate,
            channels: 0,
            minimum_reporting_interval: None,
            params: vec![],
            feedback: vec![],
        }
    }

    /// Builder style channel setter.
    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    /// Builder style parameter setter.
    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.set_param(name, value);
        self
    }

    /// Builder style feedback setter.
    pub fn with_feedback(mut self, kind: &str, subtype: &str, extra: &str) -> Self {
        self.add_feedback(kind, subtype, extra);
        self
    }

    /// The fixed payload type, if any.
    pub fn pt(&self) -> Option<Pt> {
        self.id.pt()
    }

    /// Whether the encoding name matches, ignoring case.
    pub fn is_named(&self, name: &str) -> bool {
        self.encoding_name.eq_ignore_ascii_case(name)
    }

    /// Value of an optional parameter. Names are compared ignoring case.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    /// All optional parameters in order.
    pub fn params(&self) -> &[CodecParam] {
        &self.params
    }

    /// Replace the value of `name` or append it.
    pub fn set_param(&mut self, name: &str, value: &str) {
        if let Some(p) = self
            .params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            p.value = value.to_string();
        } else {
            self.params.push(CodecParam {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    /// Remove all parameters named `name`.
    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    pub(crate) fn retain_params(&mut self, f: impl FnMut(&CodecParam) -> bool) {
        self.params.retain(f);
    }

    /// Feedback parameters in order.
    pub fn feedback(&self) -> &[FeedbackParam] {
        &self.feedback
    }

    /// Add a feedback parameter unless an identical one exists.
    pub fn add_feedback(&mut self, kind: &str, subtype: &str, extra: &str) {
        let fb = FeedbackParam::new(kind, subtype, extra);
        if !self.feedback.iter().any(|f| f.matches(&fb)) {
            self.feedback.push(fb);
        }
    }

    pub(crate) fn set_feedback(&mut self, feedback: Vec<FeedbackParam>) {
        self.feedback = feedback;
    }

    pub(crate) fn retain_feedback(&mut self, f: impl FnMut(&FeedbackParam) -> bool) {
        self.feedback.retain(f);
    }

    /// Channel count with the default of 1.
    pub(crate) fn effective_channels(&self) -> u32 {
        if self.channels == 0 {
            1
        } else {
            self.channels
        }
    }

    /// Compare everything except the payload type.
    pub fn eq_ignoring_pt(&self, other: &Codec) -> bool {
        let mut a = self.clone();
        a.id = other.id;
        a == *other
    }

    /// RTP caps describing this codec.
    pub fn to_rtp_caps(&self) -> Caps {
        let mut s = Structure::new("application/x-rtp")
            .with("media", CapsValue::Str(self.media_type.to_string()));

        if !self.encoding_name.is_empty() {
            s.set(
                "encoding-name",
                CapsValue::Str(self.encoding_name.to_ascii_uppercase()),
            );
        }
        if self.clock_rate > 0 {
            s.set("clock-rate", CapsValue::Int(self.clock_rate as i64));
        }
        if let Some(pt) = self.pt() {
            s.set("payload", CapsValue::Int(*pt as i64));
        }
        if self.channels > 0 && self.media_type == MediaType::Audio {
            s.set("encoding-params", CapsValue::Str(self.channels.to_string()));
        }

        for p in &self.params {
            if p.name.eq_ignore_ascii_case(SEND_PROFILE) || p.name.eq_ignore_ascii_case(RECV_PROFILE) {
                continue;
            }
            s.set(&p.name.to_ascii_lowercase(), CapsValue::Str(p.value.clone()));
        }

        Caps::from_structure(s)
    }

    /// Codec from one structure of RTP caps. Fields that are not fixed are
    /// skipped.
    pub fn from_rtp_structure(s: &Structure) -> Option<Codec> {
        if s.name() != "application/x-rtp" {
            return None;
        }

        let media_type = MediaType::from(s.get_str("media")?);
        let encoding_name = s.get_str("encoding-name")?;
        let clock_rate = s.get_int("clock-rate").unwrap_or(0).max(0) as u32;

        let id = match s.get_int("payload") {
            Some(pt) if (0..96).contains(&pt) => CodecId::Pt((pt as u8).into()),
            _ => CodecId::Any,
        };

        let mut codec = Codec::new(id, encoding_name, media_type, clock_rate);

        for (name, value) in s.fields() {
            match name {
                "media" | "encoding-name" | "clock-rate" | "payload" => {}
                "encoding-params" => {
                    if let Some(c) = value.as_string().and_then(|v| v.parse().ok()) {
                        codec.channels = c;
                    }
                }
                _ if name.starts_with("rtcp-fb-") => {}
                _ if name.starts_with("ssrc") || name.starts_with("clock-base") => {}
                _ if name.starts_with("seqnum-base") => {}
                _ => {
                    if let Some(v) = value.as_string() {
                        codec.set_param(name, &v);
                    }
                }
            }
        }

        Some(codec)
    }
}

impl PartialEq for Codec {
    fn eq(&self, other: &Self) -> bool {
        fn same_set<T, F: Fn(&T, &T) -> bool>(a: &[T], b: &[T], f: F) -> bool {
            a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| f(x, y)))
        }

        self.id == other.id
            && self.media_type == other.media_type
            && self.clock_rate == other.clock_rate
            && self.channels == other.channels
            && self.minimum_reporting_interval == other.minimum_reporting_interval
            && self.encoding_name.eq_ignore_ascii_case(&other.encoding_name)
            && same_set(&self.params, &other.params, |x, y| {
                x.name.eq_ignore_ascii_case(&y.name) && x.value == y.value
            })
            && same_set(&self.feedback, &other.feedback, |x, y| x.matches(y))
    }
}

impl Eq for Codec {}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} clock:{} channels:{}",
            self.id, self.media_type, self.encoding_name, self.clock_rate, self.channels
        )?;
        for p in &self.params {
            write!(f, " {}={}", p.name, p.value)?;
        }
        for fb in &self.feedback {
            write!(f, " {}:{} {}", fb.kind, fb.subtype, fb.extra)?;
        }
        Ok(())
    }
}

/// Whether two codec lists are equal element by element.
pub fn codec_lists_equal(a: &[Codec], b: &[Codec]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}
