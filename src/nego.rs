//! Codec negotiation.
//!
//! Builds the local association table from blueprints and preferences,
//! intersects it with what each remote offered, and finishes the result so
//! payload types stay stable across renegotiations.

use std::sync::Arc;

use crate::assoc::{AssociationTable, CodecAssociation};
use crate::blueprint::Blueprint;
use crate::codec::{adjust_for_caps, codec_has_config_data_named, codec_needs_config};
use crate::codec::{sdp_negotiate_codec, Caps, Codec, CodecId, MediaType, ParamType};
use crate::codec::{RECV_PROFILE, RESERVE_PT, SEND_PROFILE};
use crate::error::{ConfError, ErrorKind};
use crate::graph::{ProfileError, ProfileInspector};
use crate::id::Pt;

/// A codec the application wants considered, with the raw caps its builder
/// descriptions consume and produce.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecPreference {
    pub codec: Codec,
    pub input_caps: Option<Caps>,
    pub output_caps: Option<Caps>,
}

impl CodecPreference {
    pub fn new(codec: Codec) -> Self {
        CodecPreference {
            codec,
            input_caps: None,
            output_caps: None,
        }
    }
}

fn find_matching_blueprint(codec: &Codec, blueprints: &[Arc<Blueprint>]) -> Option<Arc<Blueprint>> {
    let caps = codec.to_rtp_caps();

    blueprints
        .iter()
        .filter(|b| b.codec.is_named(&codec.encoding_name))
        .filter(|b| {
            codec.clock_rate == 0 || b.codec.clock_rate == 0 || codec.clock_rate == b.codec.clock_rate
        })
        .find(|b| caps.can_intersect(&b.rtp_caps))
        .cloned()
}

/// Check a send builder description. Returns the caps of its sink pad.
fn check_send_profile<I: ProfileInspector + ?Sized>(
    inspector: &I,
    profile: &str,
    codec: &Codec,
) -> Result<Caps, ProfileError> {
    let shape = inspector.inspect_profile(profile)?;

    if shape.sink_pads.len() != 1 {
        return Err(ProfileError::Shape(format!(
            "{} sink pads, wanted 1",
            shape.sink_pads.len()
        )));
    }
    if shape.src_pads.is_empty() {
        return Err(ProfileError::Shape("no source pad".into()));
    }

    let rtp = codec.to_rtp_caps();
    if !shape.src_pads.iter().any(|c| c.can_intersect(&rtp)) {
        return Err(ProfileError::Shape(format!("no source pad producing {}", rtp)));
    }

    Ok(shape.sink_pads[0].clone())
}

/// Check a receive builder description. Returns the caps of its source pad.
fn check_recv_profile<I: ProfileInspector + ?Sized>(
    inspector: &I,
    profile: &str,
    codec: &Codec,
) -> Result<Caps, ProfileError> {
    let shape = inspector.inspect_profile(profile)?;

    let rtp = codec.to_rtp_caps();
    if shape.sink_pads.len() != 1 || !shape.sink_pads[0].can_intersect(&rtp) {
        return Err(ProfileError::Shape(format!("no single sink pad taking {}", rtp)));
    }
    if shape.src_pads.len() != 1 {
        return Err(ProfileError::Shape(format!(
            "{} source pads, wanted 1",
            shape.src_pads.len()
        )));
    }

    Ok(shape.src_pads[0].clone())
}

/// Filter the application's codec preferences down to the ones that can be
/// used for `media_type`.
pub fn validate_codecs_configuration<I: ProfileInspector + ?Sized>(
    media_type: MediaType,
    blueprints: &[Arc<Blueprint>],
    prefs: &[Codec],
    inspector: &I,
) -> Vec<CodecPreference> {
    let mut out = vec![];

    for codec in prefs {
        if codec.media_type != media_type {
            debug!("Dropping {}, not {}", codec, media_type);
            continue;
        }

        if codec.is_named(RESERVE_PT) {
            match codec.pt() {
                Some(pt) if pt.is_valid() => out.push(CodecPreference::new(codec.clone())),
                _ => debug!("Dropping {}, reserving an invalid pt", codec),
            }
            continue;
        }

        if codec.id == CodecId::Disable {
            if codec.encoding_name.is_empty() {
                debug!("Dropping disable preference without encoding name");
            } else {
                out.push(CodecPreference::new(codec.clone()));
            }
            continue;
        }

        let mut pref = CodecPreference::new(codec.clone());

        if let Some(profile) = codec.param(SEND_PROFILE) {
            match check_send_profile(inspector, profile, codec) {
                Ok(caps) => pref.input_caps = Some(caps),
                Err(e) => {
                    debug!("Dropping {}, invalid send profile: {}", codec, e);
                    continue;
                }
            }
        }

        if let Some(profile) = codec.param(RECV_PROFILE) {
            match check_recv_profile(inspector, profile, codec) {
                Ok(caps) => pref.output_caps = Some(caps),
                Err(e) => {
                    debug!("Dropping {}, invalid recv profile: {}", codec, e);
                    continue;
                }
            }
        }

        if find_matching_blueprint(codec, blueprints).is_some() {
            out.push(pref);
            continue;
        }

        // Codecs fully described by the application.
        if codec.param(RECV_PROFILE).is_some() && !codec.encoding_name.is_empty() && codec.clock_rate > 0 {
            out.push(pref);
            continue;
        }

        debug!("Dropping {}, no blueprint and no recv profile", codec);
    }

    out
}

/// Take what the preference left unspecified from the blueprint.
fn absorb_blueprint(codec: &mut Codec, bp: &Codec) {
    if codec.clock_rate == 0 {
        codec.clock_rate = bp.clock_rate;
    }
    if codec.channels == 0 {
        codec.channels = bp.channels;
    }
    for p in bp.params() {
        if codec.param(&p.name).is_none() {
            codec.set_param(&p.name, &p.value);
        }
    }
    if codec.feedback().is_empty() {
        for f in bp.feedback() {
            codec.add_feedback(&f.kind, &f.subtype, &f.extra);
        }
    }
}

/// Whether two codecs describe the same thing, apart from the payload type.
fn same_base_codec(a: &Codec, b: &Codec) -> bool {
    let mut probe = a.clone();
    probe.id = CodecId::Any;
    sdp_negotiate_codec(&probe, ParamType::ALL, b, ParamType::ALL).is_some()
}

fn allowed(caps: Option<&Caps>, allowed: &Caps) -> bool {
    match caps {
        Some(c) if !c.is_empty() => c.can_intersect(allowed),
        _ => true,
    }
}

fn uses_pt(entries: &[CodecAssociation], pt: Pt) -> bool {
    entries.iter().any(|a| a.pt() == Some(pt))
}

fn lowest_free_pt(entries: &[CodecAssociation], current: &AssociationTable) -> Option<Pt> {
    (Pt::DYNAMIC_MIN..=Pt::MAX)
        .map(Pt::from)
        .find(|pt| !uses_pt(entries, *pt) && !current.uses_pt(*pt))
}

fn set_pt(a: &mut CodecAssociation, pt: Pt) {
    a.codec.id = CodecId::Pt(pt);
    a.send_codec.id = CodecId::Pt(pt);
}

/// Sendable codecs go before the first one that isn't, which keeps
/// telephone-event and comfort noise at the tail.
fn insert_ordered(entries: &mut Vec<CodecAssociation>, a: CodecAssociation) {
    if a.is_valid_for_sending() {
        let idx = entries
            .iter()
            .position(|x| !x.is_valid_for_sending())
            .unwrap_or(entries.len());
        entries.insert(idx, a);
    } else {
        entries.push(a);
    }
}

/// Payload type the current table used for an equivalent codec.
fn inherited_pt(
    codec: &Codec,
    bp: Option<&Arc<Blueprint>>,
    current: &AssociationTable,
    entries: &[CodecAssociation],
) -> Option<Pt> {
    current
        .iter()
        .filter(|a| a.is_live())
        .filter(|a| match (bp, &a.blueprint) {
            (Some(x), Some(y)) if Arc::ptr_eq(x, y) => true,
            _ => same_base_codec(codec, &a.codec),
        })
        .filter_map(|a| a.pt())
        .find(|pt| !uses_pt(entries, *pt))
}

/// Build the local association table.
///
/// `current` is the table in use, consulted to keep payload types stable.
/// `input_caps` and `output_caps` restrict the raw media the send and
/// receive paths may handle.
pub fn create_local_codec_associations(
    blueprints: &[Arc<Blueprint>],
    prefs: &[CodecPreference],
    current: &AssociationTable,
    input_caps: &Caps,
    output_caps: &Caps,
) -> Result<AssociationTable, ConfError> {
    let mut entries: Vec<CodecAssociation> = vec![];
    let mut disable_filter: Vec<&Codec> = vec![];

    for pref in prefs {
        let codec = &pref.codec;

        if codec.id == CodecId::Disable {
            disable_filter.push(codec);
            continue;
        }

        if codec.is_named(RESERVE_PT) {
            if let Some(pt) = codec.pt() {
                if !uses_pt(&entries, pt) {
                    entries.push(CodecAssociation::new_reserved(codec.clone()));
                }
            }
            continue;
        }

        let bp = find_matching_blueprint(codec, blueprints);
        let send_profile = codec.param(SEND_PROFILE).map(str::to_string);
        let recv_profile = codec.param(RECV_PROFILE).map(str::to_string);

        if bp.is_none() && recv_profile.is_none() {
            debug!("No blueprint for preference {}", codec);
            continue;
        }

        let input = pref.input_caps.as_ref().or(bp.as_ref().map(|b| &b.input_caps));
        let output = pref.output_caps.as_ref().or(bp.as_ref().map(|b| &b.output_caps));
        if !allowed(input, input_caps) || !allowed(output, output_caps) {
            debug!("Preference {} outside of allowed caps", codec);
            continue;
        }

        let mut nc = codec.clone();
        nc.remove_param(SEND_PROFILE);
        nc.remove_param(RECV_PROFILE);
        if let Some(bp) = &bp {
            absorb_blueprint(&mut nc, &bp.codec);
        }

        if nc.id == CodecId::Any {
            if let Some(pt) = inherited_pt(&nc, bp.as_ref(), current, &entries) {
                nc.id = CodecId::Pt(pt);
            } else if let Some(pt) = bp.as_ref().and_then(|b| b.codec.pt()) {
                nc.id = CodecId::Pt(pt);
            }
        }

        if let Some(pt) = nc.pt() {
            if uses_pt(&entries, pt) {
                debug!("Preference {} collides on pt {}", nc, pt);
                if codec.pt().is_some() {
                    continue;
                }
                nc.id = CodecId::Any;
            }
        }

        adjust_for_caps(&mut nc, input_caps, output_caps);

        let mut a = CodecAssociation::new(nc, bp);
        a.send_profile = send_profile;
        a.recv_profile = recv_profile;

        insert_ordered(&mut entries, a);
    }

    for i in 0..entries.len() {
        if entries[i].reserved || entries[i].pt().is_some() {
            continue;
        }
        let Some(pt) = lowest_free_pt(&entries, current) else {
            return Err(ConfError::new(
                ErrorKind::NoCodecsLeft,
                "no free dynamic payload type left",
            ));
        };
        set_pt(&mut entries[i], pt);
    }

    for bp in blueprints {
        let covered = entries
            .iter()
            .any(|a| a.blueprint.as_ref().map(|b| Arc::ptr_eq(b, bp)).unwrap_or(false));
        if covered {
            continue;
        }

        if disable_filter
            .iter()
            .any(|d| d.is_named(&bp.codec.encoding_name) && d.to_rtp_caps().can_intersect(&bp.rtp_caps))
        {
            debug!("Blueprint {} disabled by preference", bp.codec);
            continue;
        }

        // Templates without a fixed clock rate are only used through
        // preferences.
        if bp.codec.clock_rate == 0 {
            continue;
        }

        if !allowed(Some(&bp.input_caps), input_caps) || !allowed(Some(&bp.output_caps), output_caps) {
            continue;
        }

        let mut nc = bp.codec.clone();

        match nc.pt() {
            Some(pt) if uses_pt(&entries, pt) => {
                debug!("Static pt {} of {} already in use", pt, nc);
                continue;
            }
            Some(_) => {}
            None => {
                let pt = inherited_pt(&nc, Some(bp), current, &entries)
                    .or_else(|| lowest_free_pt(&entries, current));
                let Some(pt) = pt else {
                    debug!("No free pt for {}", nc);
                    continue;
                };
                nc.id = CodecId::Pt(pt);
            }
        }

        adjust_for_caps(&mut nc, input_caps, output_caps);
        insert_ordered(&mut entries, CodecAssociation::new(nc, Some(bp.clone())));
    }

    for a in entries.iter_mut() {
        a.needs_config = a.is_valid_for_sending() && codec_needs_config(&a.codec);
    }

    if !entries.iter().any(|a| a.is_valid_for_sending()) {
        return Err(ConfError::new(ErrorKind::NoCodecsLeft, "no codec left to send"));
    }

    trace!("Local associations: {:?}", entries);

    Ok(AssociationTable::from_entries(entries))
}

fn negotiate_one(old: &CodecAssociation, remote: &Codec, multi_stream: bool) -> Option<CodecAssociation> {
    let remote_types = ParamType::SEND | ParamType::SEND_AVOID_NEGO;

    let recv = sdp_negotiate_codec(&old.codec, ParamType::ALL, remote, remote_types)?;
    let send = sdp_negotiate_codec(&old.send_codec, ParamType::BOTH, remote, remote_types)?;

    let mut a = old.clone();
    a.codec = recv;
    a.send_codec = send;
    a.recv_only = false;

    if multi_stream {
        // Streams share one table, so the local pt and interval are kept.
        a.codec.id = old.codec.id;
        a.send_codec.id = old.codec.id;
        a.codec.minimum_reporting_interval = old.codec.minimum_reporting_interval;
        a.send_codec.minimum_reporting_interval = old.codec.minimum_reporting_interval;
    }

    Some(a)
}

/// Intersect the current table with the codecs one remote offered.
pub fn negotiate_stream_codecs(
    remote: &[Codec],
    current: &AssociationTable,
    multi_stream: bool,
) -> Result<AssociationTable, ConfError> {
    let mut entries: Vec<CodecAssociation> = vec![];

    for r in remote {
        let Some(rpt) = r.pt() else {
            debug!("Ignoring remote codec without pt: {}", r);
            continue;
        };

        if uses_pt(&entries, rpt) {
            debug!("Ignoring remote codec with duplicate pt: {}", r);
            continue;
        }

        if current.iter().any(|a| a.reserved && a.pt() == Some(rpt)) {
            debug!("Remote codec {} uses reserved pt", r);
            entries.push(CodecAssociation::new_disabled(r.clone()));
            continue;
        }

        let free = |a: &CodecAssociation| a.pt().map(|pt| !uses_pt(&entries, pt)).unwrap_or(false);

        let mut found = current
            .lookup_by_pt(rpt, false)
            .and_then(|old| negotiate_one(old, r, multi_stream))
            .filter(free);

        if found.is_none() {
            found = current
                .iter()
                .filter(|a| a.is_live())
                .filter_map(|old| negotiate_one(old, r, multi_stream))
                .find(free);
        }

        match found {
            Some(a) => {
                trace!("Negotiated {} with {}", a.codec, r);
                entries.push(a);
            }
            None => {
                debug!("Remote codec {} has no local match", r);
                entries.push(CodecAssociation::new_disabled(r.clone()));
            }
        }
    }

    for a in current.iter().filter(|a| a.reserved) {
        if a.pt().map(|pt| !uses_pt(&entries, pt)).unwrap_or(false) {
            entries.push(a.clone());
        }
    }

    if !entries.iter().any(|a| a.is_valid_for_sending()) {
        return Err(ConfError::negotiation_failed(
            "no codec in common with the remote",
        ));
    }

    Ok(AssociationTable::from_entries(entries))
}

/// Carry state from the previous table into a freshly negotiated one.
///
/// Payload types the old table used but the new one lacks are kept as
/// receive-only, configuration data already discovered is kept.
pub fn finish_codec_negotiation(old: &AssociationTable, new: AssociationTable) -> AssociationTable {
    let mut entries = new.into_entries();

    for a in entries.iter_mut().filter(|a| a.is_live()) {
        let Some(pt) = a.pt() else {
            continue;
        };
        if let Some(o) = old.lookup_by_pt(pt, false) {
            if o.codec.is_named(&a.codec.encoding_name) {
                for p in o.codec.params() {
                    if codec_has_config_data_named(&a.codec, &p.name) && a.codec.param(&p.name).is_none() {
                        a.codec.set_param(&p.name, &p.value);
                    }
                }
            }
        }
        a.needs_config = a.is_valid_for_sending() && codec_needs_config(&a.codec);
    }

    for o in old.iter() {
        if o.disabled || o.reserved {
            continue;
        }
        let Some(pt) = o.pt() else {
            continue;
        };
        if uses_pt(&entries, pt) {
            continue;
        }
        let mut kept = o.clone();
        kept.recv_only = true;
        kept.needs_config = false;
        entries.push(kept);
    }

    AssociationTable::from_entries(entries)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::ProfileShape;

    fn caps(s: &str) -> Caps {
        s.parse().unwrap()
    }

    fn bp(codec: Codec, send: bool, recv: bool) -> Arc<Blueprint> {
        let chain = |s: &str| vec![vec![s.to_string()]];
        Arc::new(Blueprint {
            rtp_caps: codec.to_rtp_caps(),
            input_caps: if send { caps("audio/x-raw") } else { Caps::new_empty() },
            output_caps: if recv { caps("audio/x-raw") } else { Caps::new_empty() },
            send_factories: if send { chain("enc") } else { vec![] },
            recv_factories: if recv { chain("dec") } else { vec![] },
            codec,
        })
    }

    fn audio(id: impl Into<CodecId>, name: &str, clock: u32) -> Codec {
        Codec::new(id, name, MediaType::Audio, clock)
    }

    fn blueprints() -> Vec<Arc<Blueprint>> {
        vec![
            bp(audio(0, "PCMU", 8000), true, true),
            bp(audio(8, "PCMA", 8000), true, true),
            bp(audio(CodecId::Any, "SPEEX", 16000), true, true),
            bp(audio(CodecId::Any, "OPUS", 48000).with_channels(2), true, true),
            bp(audio(CodecId::Any, "TELEPHONE-EVENT", 0), false, true),
        ]
    }

    fn prefs(codecs: &[Codec]) -> Vec<CodecPreference> {
        codecs.iter().cloned().map(CodecPreference::new).collect()
    }

    fn local(prefs: &[CodecPreference], current: &AssociationTable) -> Result<AssociationTable, ConfError> {
        create_local_codec_associations(&blueprints(), prefs, current, &Caps::new_any(), &Caps::new_any())
    }

    fn pts(t: &AssociationTable) -> Vec<(String, u8)> {
        t.iter()
            .filter(|a| a.is_live())
            .map(|a| (a.codec.encoding_name.clone(), *a.pt().unwrap()))
            .collect()
    }

    struct Inspector;

    impl ProfileInspector for Inspector {
        fn inspect_profile(&self, description: &str) -> Result<ProfileShape, ProfileError> {
            match description {
                "enc ! pay" => Ok(ProfileShape {
                    sink_pads: vec![caps("audio/x-raw, rate=8000")],
                    src_pads: vec![caps("application/x-rtp, encoding-name=G723")],
                }),
                "depay ! dec" => Ok(ProfileShape {
                    sink_pads: vec![caps("application/x-rtp, encoding-name=G723")],
                    src_pads: vec![caps("audio/x-raw, rate=8000")],
                }),
                "depay ! tee" => Ok(ProfileShape {
                    sink_pads: vec![caps("application/x-rtp")],
                    src_pads: vec![caps("audio/x-raw"), caps("audio/x-raw")],
                }),
                _ => Err(ProfileError::Parse(description.to_string())),
            }
        }
    }

    #[test]
    fn blueprints_only() {
        let t = local(&[], &AssociationTable::new()).unwrap();
        assert_eq!(
            pts(&t),
            vec![
                ("PCMU".to_string(), 0),
                ("PCMA".to_string(), 8),
                ("SPEEX".to_string(), 96),
                ("OPUS".to_string(), 97),
            ]
        );
        assert!(!t.needs_config());
    }

    #[test]
    fn preferences_order_and_sink_telephone_event() {
        let p = prefs(&[
            audio(CodecId::Any, "TELEPHONE-EVENT", 8000),
            audio(CodecId::Any, "PCMA", 8000),
            audio(CodecId::Any, "PCMU", 8000),
        ]);
        let t = local(&p, &AssociationTable::new()).unwrap();
        let names: Vec<_> = pts(&t).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["PCMA", "PCMU", "SPEEX", "OPUS", "TELEPHONE-EVENT"]);
        assert_eq!(t.lookup_by_pt(8.into(), false).unwrap().codec.encoding_name, "PCMA");
        assert_eq!(t.first_sendable().unwrap().codec.encoding_name, "PCMA");
    }

    #[test]
    fn reserved_and_disabled() {
        let p = prefs(&[
            audio(96, RESERVE_PT, 0),
            audio(CodecId::Disable, "PCMA", 8000),
        ]);
        let t = local(&p, &AssociationTable::new()).unwrap();
        assert_eq!(
            pts(&t),
            vec![
                ("PCMU".to_string(), 0),
                ("SPEEX".to_string(), 97),
                ("OPUS".to_string(), 98),
            ]
        );
        assert!(t.lookup_by_pt(96.into(), true).is_none());
    }

    #[test]
    fn dynamic_pt_exhaustion() {
        let mut codecs: Vec<Codec> = (96u8..=126).map(|pt| audio(pt, RESERVE_PT, 0)).collect();
        codecs.push(audio(CodecId::Any, "SPEEX", 16000));
        codecs.push(audio(CodecId::Any, "OPUS", 48000));
        let err = local(&prefs(&codecs), &AssociationTable::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoCodecsLeft);
    }

    #[test]
    fn no_sendable_codec() {
        let bps = vec![bp(audio(CodecId::Any, "TELEPHONE-EVENT", 8000), false, true)];
        let err = create_local_codec_associations(
            &bps,
            &[],
            &AssociationTable::new(),
            &Caps::new_any(),
            &Caps::new_any(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoCodecsLeft);
    }

    #[test]
    fn keeps_payload_types_stable() {
        let first = local(&prefs(&[audio(CodecId::Any, "OPUS", 48000)]), &AssociationTable::new()).unwrap();
        assert_eq!(*first.iter().next().unwrap().pt().unwrap(), 96);

        // Without the preference OPUS would come after SPEEX, but keeps 96.
        let second = local(&[], &first).unwrap();
        let opus = second.iter().find(|a| a.codec.is_named("OPUS")).unwrap();
        assert_eq!(*opus.pt().unwrap(), 96);
        let speex = second.iter().find(|a| a.codec.is_named("SPEEX")).unwrap();
        assert_eq!(*speex.pt().unwrap(), 97);
    }

    #[test]
    fn allowed_caps_filter_and_adjust_opus() {
        let input = caps("audio/x-raw, rate=16000, channels=1");
        let t = create_local_codec_associations(
            &blueprints(),
            &[],
            &AssociationTable::new(),
            &input,
            &Caps::new_any(),
        )
        .unwrap();
        let opus = t.iter().find(|a| a.codec.is_named("OPUS")).unwrap();
        assert_eq!(opus.codec.param("sprop-maxcapturerate"), Some("16000"));
        assert_eq!(opus.codec.param("sprop-stereo"), Some("0"));

        let remote = vec![audio(111, "OPUS", 48000)
            .with_channels(2)
            .with_param("sprop-stereo", "1")
            .with_param("sprop-maxcapturerate", "24000")];
        let n = negotiate_stream_codecs(&remote, &t, false).unwrap();
        let opus = n.lookup_by_pt(111.into(), false).unwrap();
        assert_eq!(opus.codec.param("sprop-maxcapturerate"), Some("16000"));
        assert_eq!(opus.codec.param("sprop-stereo"), Some("0"));
    }

    #[test]
    fn remote_pt_wins_and_unknown_disabled() {
        let t = local(&[], &AssociationTable::new()).unwrap();
        let remote = vec![
            audio(100, "SPEEX", 16000),
            audio(0, "PCMU", 8000),
            audio(101, "G722", 8000),
        ];
        let n = negotiate_stream_codecs(&remote, &t, false).unwrap();
        assert_eq!(n.lookup_by_pt(100.into(), false).unwrap().codec.encoding_name, "SPEEX");
        assert!(n.lookup_by_pt(101.into(), false).is_none());
        assert!(n.lookup_by_pt(101.into(), true).unwrap().disabled);
        assert_eq!(n.to_codec_list(true).len(), 2);
    }

    #[test]
    fn multi_stream_pins_local_pt() {
        let t = local(&[], &AssociationTable::new()).unwrap();
        let remote = vec![audio(100, "SPEEX", 16000)];
        let n = negotiate_stream_codecs(&remote, &t, true).unwrap();
        let speex = n.iter().next().unwrap();
        assert_eq!(*speex.pt().unwrap(), 96);
    }

    #[test]
    fn reserved_pt_gives_placeholder() {
        let p = prefs(&[audio(96, RESERVE_PT, 0)]);
        let t = local(&p, &AssociationTable::new()).unwrap();
        let remote = vec![audio(96, "SPEEX", 16000), audio(0, "PCMU", 8000)];
        let n = negotiate_stream_codecs(&remote, &t, false).unwrap();
        let placeholder = n.lookup_by_pt(96.into(), true).unwrap();
        assert!(placeholder.disabled);
        assert!(n.lookup_by_pt(96.into(), false).is_none());
    }

    #[test]
    fn nothing_in_common() {
        let t = local(&[], &AssociationTable::new()).unwrap();
        let err = negotiate_stream_codecs(&[audio(101, "G722", 8000)], &t, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NegotiationFailed);
    }

    #[test]
    fn self_negotiation_is_stable() {
        let t = local(&[], &AssociationTable::new()).unwrap();
        let n = negotiate_stream_codecs(&t.to_codec_list(true), &t, false).unwrap();
        let f = finish_codec_negotiation(&t, n);
        assert!(f.equal(&t));
    }

    #[test]
    fn finish_keeps_old_pts_recv_only() {
        let t = local(&[], &AssociationTable::new()).unwrap();
        let n = negotiate_stream_codecs(&[audio(0, "PCMU", 8000)], &t, false).unwrap();
        let f = finish_codec_negotiation(&t, n);

        let pcma = f.lookup_by_pt(8.into(), false).unwrap();
        assert!(pcma.recv_only);
        assert!(!pcma.is_valid_for_sending());
        assert_eq!(f.to_codec_list(true).len(), 1);
    }

    #[test]
    fn finish_keeps_config() {
        let vorbis = bp(audio(CodecId::Any, "VORBIS", 44100), true, true);
        let mut old = create_local_codec_associations(
            &[vorbis.clone()],
            &[],
            &AssociationTable::new(),
            &Caps::new_any(),
            &Caps::new_any(),
        )
        .unwrap();
        assert!(old.needs_config());

        for a in old.iter_mut() {
            a.codec.set_param("configuration", "xyz");
            a.needs_config = false;
        }

        let fresh = create_local_codec_associations(&[vorbis], &[], &old, &Caps::new_any(), &Caps::new_any())
            .unwrap();
        let f = finish_codec_negotiation(&old, fresh);
        assert!(!f.needs_config());
        assert_eq!(f.iter().next().unwrap().codec.param("configuration"), Some("xyz"));
    }

    #[test]
    fn validate_preferences() {
        let bps = blueprints();
        let g723 = audio(CodecId::Any, "G723", 8000);
        let list = vec![
            Codec::new(CodecId::Any, "H264", MediaType::Video, 90000),
            audio(96, RESERVE_PT, 0),
            audio(CodecId::Disable, "", 0),
            audio(CodecId::Any, "PCMU", 8000),
            audio(CodecId::Any, "G722", 8000),
            g723.clone()
                .with_param(SEND_PROFILE, "enc ! pay")
                .with_param(RECV_PROFILE, "depay ! dec"),
            g723.clone().with_param(RECV_PROFILE, "depay ! tee"),
            g723.with_param(SEND_PROFILE, "garbage"),
        ];
        let v = validate_codecs_configuration(MediaType::Audio, &bps, &list, &Inspector);
        assert_eq!(v.len(), 3);
        assert!(v[0].codec.is_named(RESERVE_PT));
        assert!(v[1].codec.is_named("PCMU"));
        assert!(v[2].codec.is_named("G723"));
        assert!(v[2].input_caps.as_ref().unwrap().can_intersect(&caps("audio/x-raw")));
        assert!(v[2].output_caps.is_some());
    }

    #[test]
    fn profile_only_codec() {
        let g723 = audio(CodecId::Any, "G723", 8000)
            .with_param(SEND_PROFILE, "enc ! pay")
            .with_param(RECV_PROFILE, "depay ! dec");
        let v = validate_codecs_configuration(MediaType::Audio, &blueprints(), &[g723], &Inspector);
        let t = create_local_codec_associations(
            &blueprints(),
            &v,
            &AssociationTable::new(),
            &Caps::new_any(),
            &Caps::new_any(),
        )
        .unwrap();
        let first = t.iter().next().unwrap();
        assert!(first.codec.is_named("G723"));
        assert_eq!(first.send_profile.as_deref(), Some("enc ! pay"));
        assert!(first.codec.param(SEND_PROFILE).is_none());
        assert!(first.is_valid_for_sending());
    }
}
