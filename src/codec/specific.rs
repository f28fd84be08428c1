//! Per-encoding parameter negotiation.
//!
//! Every optional parameter of a codec has a type describing which side of
//! a session it applies to, and a rule describing how two values are
//! intersected. Parameters without a registered rule are copied from
//! whichever side has them and must agree when both sides do.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use super::h264::ProfileLevelId;
use super::{Caps, Codec, CodecId, EventList, MediaType};

/// Bit set describing which side of a negotiation a parameter belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamType(u8);

impl ParamType {
    /// Parameters describing what is sent.
    pub const SEND: ParamType = ParamType(1);
    /// Parameters describing what can be received.
    pub const RECV: ParamType = ParamType(2);
    /// Both of the above.
    pub const BOTH: ParamType = ParamType(3);
    /// Out-of-band configuration data.
    pub const CONFIG: ParamType = ParamType(4);
    /// Send parameters that are taken as is rather than negotiated.
    pub const SEND_AVOID_NEGO: ParamType = ParamType(8);
    /// Parameters that must be present on both sides.
    pub const MANDATORY: ParamType = ParamType(16);
    /// Everything except MANDATORY.
    pub const ALL: ParamType = ParamType(15);

    /// Whether any bit is shared.
    pub fn intersects(&self, other: ParamType) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ParamType {
    type Output = ParamType;

    fn bitor(self, rhs: Self) -> Self::Output {
        ParamType(self.0 | rhs.0)
    }
}

impl BitAnd for ParamType {
    type Output = ParamType;

    fn bitand(self, rhs: Self) -> Self::Output {
        ParamType(self.0 & rhs.0)
    }
}

impl Not for ParamType {
    type Output = ParamType;

    fn not(self) -> Self::Output {
        ParamType(!self.0 & 0x1f)
    }
}

impl fmt::Debug for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SEND, "SEND"),
            (Self::RECV, "RECV"),
            (Self::CONFIG, "CONFIG"),
            (Self::SEND_AVOID_NEGO, "SEND_AVOID_NEGO"),
            (Self::MANDATORY, "MANDATORY"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(t, _)| self.intersects(*t))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "ParamType({})", set.join("|"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nego {
    /// Kept only when both sides carry the same value.
    Equal,
    /// Both sides (or their defaults) must agree, otherwise the codec is
    /// rejected.
    EqualOrReject,
    /// Smallest integer of both sides, missing values take the default.
    Minimum,
    /// Local value, remote value ignored.
    LocalOnly,
    /// Local value if present, else the remote one.
    LocalFirst,
    /// Never part of a negotiated codec.
    Strip,
    /// iLBC frame mode.
    IlbcMode,
    /// G.729 annex B, "no" wins.
    AnnexB,
    /// H.264 profile-level-id.
    H264Profile,
    /// Telephone-event lists.
    Events,
    /// Picture size MPIs, negotiated as a group.
    PictureSize,
}

struct ParamRule {
    media: Option<MediaType>,
    encoding: Option<&'static str>,
    name: &'static str,
    kind: ParamType,
    nego: Nego,
    default: Option<&'static str>,
    hide_default: bool,
}

impl ParamRule {
    const fn new(
        media: MediaType,
        encoding: &'static str,
        name: &'static str,
        kind: ParamType,
        nego: Nego,
    ) -> Self {
        ParamRule {
            media: Some(media),
            encoding: Some(encoding),
            name,
            kind,
            nego,
            default: None,
            hide_default: false,
        }
    }

    /// Rule applying to all encodings.
    const fn any(name: &'static str, kind: ParamType, nego: Nego) -> Self {
        ParamRule {
            media: None,
            encoding: None,
            name,
            kind,
            nego,
            default: None,
            hide_default: false,
        }
    }

    const fn default(mut self, v: &'static str) -> Self {
        self.default = Some(v);
        self
    }

    const fn hidden_default(mut self, v: &'static str) -> Self {
        self.default = Some(v);
        self.hide_default = true;
        self
    }

    fn applies(&self, codec: &Codec, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            && self.media.map(|m| m == codec.media_type).unwrap_or(true)
            && self.encoding.map(|e| codec.is_named(e)).unwrap_or(true)
    }
}

use MediaType::{Audio, Video};
use Nego::*;

const BOTH: ParamType = ParamType::BOTH;
const RECV: ParamType = ParamType::RECV;
const CONFIG: ParamType = ParamType::CONFIG;

#[rustfmt::skip]
static RULES: &[ParamRule] = &[
    ParamRule::new(Audio, "ILBC", "mode", BOTH, IlbcMode),
    ParamRule::new(Audio, "G729", "annexb", BOTH, AnnexB),

    ParamRule::new(Audio, "OPUS", "stereo", BOTH, Minimum).hidden_default("0"),
    ParamRule::new(Audio, "OPUS", "sprop-stereo", RECV, LocalOnly),
    ParamRule::new(Audio, "OPUS", "sprop-maxcapturerate", RECV, LocalOnly),
    ParamRule::new(Audio, "OPUS", "maxplaybackrate", BOTH, Minimum).hidden_default("48000"),

    ParamRule::new(Audio, "TELEPHONE-EVENT", "events", BOTH, Events).default("0-15"),

    ParamRule::new(Audio, "VORBIS", "configuration", CONFIG, LocalFirst),
    ParamRule::new(Video, "THEORA", "configuration", CONFIG, LocalFirst),

    ParamRule::new(Video, "H261", "qcif", BOTH, PictureSize),
    ParamRule::new(Video, "H261", "cif", BOTH, PictureSize),
    ParamRule::new(Video, "H261", "d", BOTH, Equal),

    ParamRule::new(Video, "H263-1998", "sqcif", BOTH, PictureSize),
    ParamRule::new(Video, "H263-1998", "qcif", BOTH, PictureSize),
    ParamRule::new(Video, "H263-1998", "cif", BOTH, PictureSize),
    ParamRule::new(Video, "H263-1998", "cif4", BOTH, PictureSize),
    ParamRule::new(Video, "H263-1998", "cif16", BOTH, PictureSize),
    ParamRule::new(Video, "H263-1998", "custom", BOTH, PictureSize),
    ParamRule::new(Video, "H263-1998", "f", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "i", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "j", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "k", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "n", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "p", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "t", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "hrd", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "interlace", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "cpcf", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "par", BOTH, Equal),
    ParamRule::new(Video, "H263-1998", "bpp", BOTH, LocalFirst),

    ParamRule::new(Video, "H263-2000", "sqcif", BOTH, PictureSize),
    ParamRule::new(Video, "H263-2000", "qcif", BOTH, PictureSize),
    ParamRule::new(Video, "H263-2000", "cif", BOTH, PictureSize),
    ParamRule::new(Video, "H263-2000", "cif4", BOTH, PictureSize),
    ParamRule::new(Video, "H263-2000", "cif16", BOTH, PictureSize),
    ParamRule::new(Video, "H263-2000", "custom", BOTH, PictureSize),
    ParamRule::new(Video, "H263-2000", "profile", BOTH, EqualOrReject).default("0"),
    ParamRule::new(Video, "H263-2000", "level", BOTH, Minimum).default("0"),

    ParamRule::new(Video, "H264", "profile-level-id", BOTH, H264Profile),
    ParamRule::new(Video, "H264", "sprop-parameter-sets", CONFIG, LocalFirst),
    ParamRule::new(Video, "H264", "sprop-init-buf-time", BOTH, Strip),
    ParamRule::new(Video, "H264", "sprop-interleaving-depth", BOTH, Strip),
    ParamRule::new(Video, "H264", "sprop-deint-buf-req", BOTH, Strip),
    ParamRule::new(Video, "H264", "sprop-max-don-diff", BOTH, Strip),
    ParamRule::new(Video, "H264", "packetization-mode", BOTH, EqualOrReject).default("0"),
    ParamRule::new(Video, "H264", "max-mbps", BOTH, LocalFirst),
    ParamRule::new(Video, "H264", "max-fs", BOTH, LocalFirst),
    ParamRule::new(Video, "H264", "max-cpb", BOTH, LocalFirst),
    ParamRule::new(Video, "H264", "max-dpb", BOTH, LocalFirst),
    ParamRule::new(Video, "H264", "max-br", BOTH, LocalFirst),
    ParamRule::new(Video, "H264", "deint-buf-cap", BOTH, LocalFirst),
    ParamRule::new(Video, "H264", "max-rcmd-nalu-size", BOTH, LocalFirst),

    ParamRule::any("ptime", BOTH, LocalFirst),
    ParamRule::any("maxptime", BOTH, LocalFirst),
    ParamRule::any("minptime", BOTH, LocalFirst),
];

fn find_rule(codec: &Codec, name: &str) -> Option<&'static ParamRule> {
    RULES.iter().find(|r| r.applies(codec, name))
}

fn param_kind(codec: &Codec, name: &str) -> ParamType {
    find_rule(codec, name).map(|r| r.kind).unwrap_or(ParamType::BOTH)
}

/// Picture sizes assumed for a side that lists none.
fn default_sizes(codec: &Codec) -> &'static [(&'static str, &'static str)] {
    if codec.is_named("H261") {
        &[("qcif", "1")]
    } else {
        &[("sqcif", "1"), ("qcif", "1")]
    }
}

/// Negotiate `local` (whose parameters are filtered by `local_types`) with
/// `remote` (filtered by `remote_types`). Returns the resulting codec, or
/// `None` if they are incompatible.
pub fn sdp_negotiate_codec(
    local: &Codec,
    local_types: ParamType,
    remote: &Codec,
    remote_types: ParamType,
) -> Option<Codec> {
    if local.media_type != remote.media_type {
        return None;
    }
    if !local.encoding_name.eq_ignore_ascii_case(&remote.encoding_name) {
        return None;
    }
    if local.clock_rate > 0 && remote.clock_rate > 0 && local.clock_rate != remote.clock_rate {
        return None;
    }
    if local.clock_rate == 0 && remote.clock_rate == 0 {
        return None;
    }
    if !channels_compatible(local, remote) {
        return None;
    }

    let id = match remote.id {
        CodecId::Pt(_) => remote.id,
        _ => local.id,
    };

    let clock_rate = if remote.clock_rate > 0 {
        remote.clock_rate
    } else {
        local.clock_rate
    };

    let mut out = Codec::new(id, &remote.encoding_name, remote.media_type, clock_rate);
    out.channels = if local.channels > 0 {
        local.channels
    } else {
        remote.channels
    };
    out.minimum_reporting_interval = remote.minimum_reporting_interval;

    let visible = |codec: &Codec, types: ParamType, name: &str| -> Option<String> {
        if types.intersects(param_kind(codec, name)) {
            codec.param(name).map(|v| v.to_string())
        } else {
            None
        }
    };

    let mut names: Vec<&str> = local.params().iter().map(|p| p.name.as_str()).collect();
    for p in remote.params() {
        if !names.iter().any(|n| n.eq_ignore_ascii_case(&p.name)) {
            names.push(&p.name);
        }
    }

    let mut sizes_done = false;

    for name in names {
        let lv = visible(local, local_types, name);
        let rv = visible(remote, remote_types, name);

        let Some(rule) = find_rule(local, name) else {
            match (lv, rv) {
                (Some(l), Some(r)) if l != r => {
                    trace!("Param {} differs: {} vs {}", name, l, r);
                    return None;
                }
                (l, r) => {
                    if let Some(v) = l.or(r) {
                        out.set_param(name, &v);
                    }
                }
            }
            continue;
        };

        if rule.nego == PictureSize {
            if !sizes_done {
                sizes_done = true;
                for (n, v) in negotiate_sizes(local, local_types, remote, remote_types) {
                    out.set_param(&n, &v);
                }
            }
            continue;
        }

        match negotiate_param(rule, lv, rv) {
            Ok(Some(v)) => out.set_param(name, &v),
            Ok(None) => {}
            Err(()) => {
                trace!("Param {} of {} failed to negotiate", name, local.encoding_name);
                return None;
            }
        }
    }

    let fb = local
        .feedback()
        .iter()
        .filter(|f| remote.feedback().iter().any(|r| r.matches(f)))
        .cloned()
        .collect();
    out.set_feedback(fb);

    Some(out)
}

fn channels_compatible(local: &Codec, remote: &Codec) -> bool {
    match (local.channels, remote.channels) {
        (0, 0) => true,
        (a, b) if a > 0 && b > 0 => a == b,
        // One side unspecified means mono, except for Opus which always
        // advertises two channels in its rtpmap.
        (a, b) => local.is_named("OPUS") || a.max(b) == 1,
    }
}

fn negotiate_param(
    rule: &ParamRule,
    lv: Option<String>,
    rv: Option<String>,
) -> Result<Option<String>, ()> {
    let with_default = |v: &Option<String>| v.clone().or(rule.default.map(str::to_string));

    let out = match rule.nego {
        Equal => match (lv, rv) {
            (Some(l), Some(r)) if l == r => Some(l),
            _ => None,
        },
        EqualOrReject => {
            if lv.is_none() && rv.is_none() {
                return Ok(None);
            }
            let l = with_default(&lv);
            let r = with_default(&rv);
            if l != r {
                return Err(());
            }
            l
        }
        Minimum => {
            if lv.is_none() && rv.is_none() {
                return Ok(None);
            }
            let l = with_default(&lv).and_then(|v| v.parse::<u64>().ok());
            let r = with_default(&rv).and_then(|v| v.parse::<u64>().ok());
            let min = match (l, r) {
                (Some(l), Some(r)) => l.min(r),
                (Some(v), None) | (None, Some(v)) => v,
                (None, None) => return Err(()),
            };
            let min = min.to_string();
            if rule.hide_default && rule.default == Some(min.as_str()) {
                None
            } else {
                Some(min)
            }
        }
        LocalOnly => lv,
        LocalFirst => lv.or(rv),
        Strip => None,
        IlbcMode => match (lv, rv) {
            (Some(l), Some(r)) if l == r => Some(r),
            (Some(_), Some(_)) => Some("30".to_string()),
            _ => None,
        },
        AnnexB => {
            let no = |v: &Option<String>| v.as_deref().map(|v| v.eq_ignore_ascii_case("no")).unwrap_or(false);
            if no(&lv) || no(&rv) {
                Some("no".to_string())
            } else {
                None
            }
        }
        H264Profile => {
            let (Some(l), Some(r)) = (lv, rv) else {
                return Ok(None);
            };
            let (Some(l), Some(r)) = (ProfileLevelId::parse(&l), ProfileLevelId::parse(&r)) else {
                return Ok(None);
            };
            match l.negotiate(&r) {
                Some(p) => {
                    trace!("H264 {} negotiated to {}", p.profile_name(), p);
                    Some(p.to_string())
                }
                None => None,
            }
        }
        Events => {
            if lv.is_none() && rv.is_none() {
                return Ok(None);
            }
            let l: EventList = with_default(&lv).unwrap_or_default().parse().map_err(|_| ())?;
            let r: EventList = with_default(&rv).unwrap_or_default().parse().map_err(|_| ())?;
            let i = l.intersect(&r);
            if i.is_empty() {
                return Err(());
            }
            Some(i.to_string())
        }
        PictureSize => None,
    };

    Ok(out)
}

/// Picture sizes present on both sides, keeping the larger minimum picture
/// interval. A side without any size takes the defaults.
fn negotiate_sizes(
    local: &Codec,
    local_types: ParamType,
    remote: &Codec,
    remote_types: ParamType,
) -> Vec<(String, String)> {
    let sizes = |codec: &Codec, types: ParamType| -> Vec<(String, String)> {
        if !types.intersects(ParamType::BOTH) {
            return vec![];
        }
        codec
            .params()
            .iter()
            .filter(|p| {
                find_rule(local, &p.name)
                    .map(|r| r.nego == PictureSize)
                    .unwrap_or(false)
            })
            .map(|p| (p.name.to_ascii_lowercase(), p.value.clone()))
            .collect()
    };

    let mut l = sizes(local, local_types);
    let mut r = sizes(remote, remote_types);

    if l.is_empty() && r.is_empty() {
        return vec![];
    }

    let defaults = || -> Vec<(String, String)> {
        default_sizes(local)
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    };
    if l.is_empty() {
        l = defaults();
    }
    if r.is_empty() {
        r = defaults();
    }

    let mut out = vec![];

    for (name, lv) in &l {
        let Some((_, rv)) = r.iter().find(|(n, _)| n == name) else {
            continue;
        };

        if name == "custom" {
            let parse = |v: &str| -> Option<(u32, u32, u32)> {
                let mut it = v.split(',').map(|x| x.trim().parse::<u32>());
                let x = it.next()?.ok()?;
                let y = it.next()?.ok()?;
                let mpi = it.next()?.ok()?;
                Some((x, y, mpi))
            };
            if let (Some(a), Some(b)) = (parse(lv), parse(rv)) {
                if a.0 == b.0 && a.1 == b.1 {
                    out.push((name.clone(), format!("{},{},{}", a.0, a.1, a.2.max(b.2))));
                }
            }
        } else if let (Ok(a), Ok(b)) = (lv.parse::<u32>(), rv.parse::<u32>()) {
            out.push((name.clone(), a.max(b).to_string()));
        }
    }

    out
}

/// Copy of `codec` without the parameters whose type intersects `types`.
pub fn codec_copy_filtered(codec: &Codec, types: ParamType) -> Codec {
    let mut out = codec.clone();
    let probe = codec.clone();
    out.retain_params(|p| !types.intersects(param_kind(&probe, &p.name)));
    out
}

/// Whether the encoding has configuration parameters and none are set.
pub fn codec_needs_config(codec: &Codec) -> bool {
    let mut has_rules = false;

    for rule in RULES.iter() {
        if rule.kind != ParamType::CONFIG || rule.media.is_none() {
            continue;
        }
        if !rule.applies(codec, rule.name) {
            continue;
        }
        has_rules = true;
        if codec.param(rule.name).is_some() {
            return false;
        }
    }

    has_rules
}

/// Whether `name` is a configuration parameter for the codec's encoding.
pub fn codec_has_config_data_named(codec: &Codec, name: &str) -> bool {
    find_rule(codec, name)
        .map(|r| r.kind.intersects(ParamType::CONFIG))
        .unwrap_or(false)
}

fn config_params(codec: &Codec) -> Vec<(String, String)> {
    let mut v: Vec<_> = codec
        .params()
        .iter()
        .filter(|p| codec_has_config_data_named(codec, &p.name))
        .map(|p| (p.name.to_ascii_lowercase(), p.value.clone()))
        .collect();
    v.sort();
    v
}

/// Codecs of `new` whose configuration differs from the codec with the same
/// payload type in `old`.
pub fn codecs_list_has_codec_config_changed(old: &[Codec], new: &[Codec]) -> Vec<Codec> {
    let mut changed = vec![];

    for codec in new {
        let Some(prev) = old.iter().find(|c| c.id == codec.id) else {
            continue;
        };
        let a = codec_copy_filtered(codec, ParamType::CONFIG);
        let b = codec_copy_filtered(prev, ParamType::CONFIG);
        if a != b {
            continue;
        }
        if config_params(codec) != config_params(prev) {
            changed.push(codec.clone());
        }
    }

    changed
}

/// Reflect restrictions of the raw media caps in the codec parameters.
///
/// `input` is what the send path is allowed to consume and `output` what the
/// receive path may produce.
pub fn adjust_for_caps(codec: &mut Codec, input: &Caps, output: &Caps) {
    if !codec.is_named("OPUS") {
        return;
    }

    let raw = |caps: &Caps| -> Caps {
        let filter: Caps = Caps::from_structure(super::Structure::new("audio/x-raw"));
        if caps.is_any() {
            Caps::new_empty()
        } else {
            caps.intersect(&filter)
        }
    };

    let input = raw(input);
    if !input.is_empty() {
        if input.max_int("channels") == Some(1) {
            codec.set_param("sprop-stereo", "0");
        }
        if let Some(rate) = input.max_int("rate") {
            if rate < 48000 {
                codec.set_param("sprop-maxcapturerate", &rate.to_string());
            }
        }
    }

    let output = raw(output);
    if !output.is_empty() {
        if let Some(rate) = output.max_int("rate") {
            if rate < 48000 {
                codec.set_param("maxplaybackrate", &rate.to_string());
            }
        }
    }
}
