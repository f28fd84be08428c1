use std::time::Instant;

use rtpconf::{Codec, CodecId, ConfError, Direction, ErrorKind, Event, HeaderExtension};
use rtpconf::{IceConfig, MediaType, Participant, SessionConfig, Ssrc};

mod common;
use common::{count, init_log, TestAgentFactory, TestSession};

fn audio(id: impl Into<CodecId>, name: &str, clock: u32) -> Codec {
    Codec::new(id, name, MediaType::Audio, clock)
}

fn assert_unique_pts(s: &TestSession) {
    let table = s.codec_associations();
    let live: Vec<_> = table.iter().filter(|a| a.is_live()).filter_map(|a| a.pt()).collect();
    for (i, pt) in live.iter().enumerate() {
        assert!(!live[i + 1..].contains(pt), "pt {} used twice", pt);
    }
}

#[test]
pub fn two_way_pcmu_pcma() -> Result<(), ConfError> {
    init_log();

    let prefs = || vec![audio(0, "PCMU", 8000), audio(8, "PCMA", 8000)];

    let mut a = TestSession::new("a", SessionConfig::new(MediaType::Audio));
    let mut b = TestSession::new("b", SessionConfig::new(MediaType::Audio).set_id(2));
    a.set_codec_preferences(prefs())?;
    b.set_codec_preferences(prefs())?;

    let factory = TestAgentFactory::new();
    let to_b = a.new_stream(&Participant::new("b@test", factory.clone()), Direction::SendRecv)?;
    let to_a = b.new_stream(&Participant::new("a@test", factory.clone()), Direction::SendRecv)?;

    let offer = a.codecs().expect("no configuration to discover");
    to_a.set_remote_codecs(offer)?;
    b.drive();

    let answer = b.codecs().expect("no configuration to discover");
    to_b.set_remote_codecs(answer)?;
    a.drive();

    for s in [&a, &b] {
        let table = s.codec_associations();

        let pcmu = table.lookup_by_pt(0.into(), false).expect("PCMU at 0");
        assert!(pcmu.codec.is_named("PCMU"));
        let pcma = table.lookup_by_pt(8.into(), false).expect("PCMA at 8");
        assert!(pcma.codec.is_named("PCMA"));

        let sending = s.current_send_codec().expect("send codec");
        assert!(sending.is_named("PCMU"));
        assert!(table.lookup_by_codec_for_sending(&sending).is_some());

        let changed = count(&s.events, |e| matches!(e, Event::SendCodecChanged { .. }));
        assert_eq!(changed, 1);

        assert!(s.errors().is_empty(), "{:?}", s.errors());
        assert_unique_pts(s);
    }

    // Nothing to send to before a transmitter exists.
    assert_eq!(a.graph.valve(), None);
    to_b.set_transmitter(IceConfig::default())?;
    assert_eq!(a.graph.valve(), Some(true));
    to_b.set_direction(Direction::RecvOnly)?;
    assert_eq!(a.graph.valve(), Some(false));
    to_b.set_direction(Direction::SendRecv)?;
    assert_eq!(a.graph.valve(), Some(true));

    // b starts sending PCMA.
    let ssrc: Ssrc = 0x1234_5678.into();
    a.handle_new_recv_pad(ssrc, 8.into(), Instant::now());
    a.handle_ssrc_cname(ssrc, "b@test");
    let events = a.drive();

    let added = events
        .iter()
        .find_map(|e| match e {
            Event::SrcPadAdded { stream, codec, .. } => Some((*stream, codec.clone())),
            _ => None,
        })
        .expect("src pad added");
    assert_eq!(added.0, to_b.id());
    assert!(added.1.is_named("PCMA"));
    assert_eq!(a.stream_by_ssrc(ssrc), Some(to_b.clone()));

    let recv = events.iter().find_map(|e| match e {
        Event::RecvCodecsChanged { stream, codecs } => Some((*stream, codecs.clone())),
        _ => None,
    });
    let (stream, codecs) = recv.expect("recv codecs changed");
    assert_eq!(stream, to_b.id());
    assert_eq!(codecs.len(), 1);

    assert!(a.errors().is_empty(), "{:?}", a.errors());

    Ok(())
}

#[test]
pub fn reserved_pt_is_never_assigned() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    s.set_codec_preferences(vec![audio(96, "reserve-pt", 0)])?;
    s.drive();

    let table = s.codec_associations();
    assert!(table.lookup_by_pt(96.into(), true).is_none());
    assert!(s.codecs_without_config().iter().all(|c| c.pt() != Some(96.into())));
    assert!(table.iter().any(|a| a.reserved && a.pt() == Some(96.into())));
    assert_unique_pts(&s);

    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(vec![audio(96, "OPUS", 48000).with_channels(2), audio(0, "PCMU", 8000)])?;
    s.drive();

    let table = s.codec_associations();
    let placeholder = table.lookup_by_pt(96.into(), true).expect("placeholder at 96");
    assert!(placeholder.disabled);
    assert!(table.lookup_by_pt(96.into(), false).is_none());
    assert!(s.current_send_codec().expect("send codec").is_named("PCMU"));

    Ok(())
}

#[test]
pub fn dynamic_pt_exhaustion() -> Result<(), ConfError> {
    init_log();

    let s = TestSession::new("s", SessionConfig::new(MediaType::Audio));

    let mut prefs: Vec<Codec> = (96..=127).map(|pt: u8| audio(pt, "reserve-pt", 0)).collect();
    prefs.push(audio(CodecId::Any, "OPUS", 48000));

    let err = s.set_codec_preferences(prefs).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoCodecsLeft);

    // Rejected preferences are not kept.
    assert!(s.codec_preferences().is_empty());

    Ok(())
}

#[test]
pub fn preferences_round_trip_is_silent() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    s.set_codec_preferences(vec![audio(CodecId::Any, "OPUS", 48000), audio(0, "PCMU", 8000)])?;
    s.drive();

    let before = s.codec_associations();

    let prefs = s.codec_preferences();
    assert_eq!(prefs.len(), 2);
    s.set_codec_preferences(prefs)?;
    let events = s.drive();

    assert_eq!(count(&events, |e| matches!(e, Event::CodecsChanged)), 0);
    assert!(before.equal(&s.codec_associations()));

    Ok(())
}

#[test]
pub fn renegotiating_own_codecs_keeps_pts() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    let before = s.codecs_without_config();

    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("me@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(before.clone())?;
    s.drive();

    let after = s.codecs_without_config();
    for c in &after {
        let old = before.iter().find(|o| o.pt() == c.pt()).expect("same pt");
        assert!(old.is_named(&c.encoding_name));
    }
    assert!(s.errors().is_empty(), "{:?}", s.errors());

    Ok(())
}

#[test]
pub fn send_codec_selection() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(vec![audio(0, "PCMU", 8000), audio(8, "PCMA", 8000)])?;
    s.drive();

    assert!(s.current_send_codec().expect("send codec").is_named("PCMU"));

    let pcma = s
        .codecs_without_config()
        .into_iter()
        .find(|c| c.is_named("PCMA"))
        .expect("PCMA");
    s.set_send_codec(&pcma)?;
    let events = s.drive();

    let sent: Vec<Codec> = events
        .iter()
        .filter_map(|e| match e {
            Event::SendCodecChanged { codec, .. } => Some(codec.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_named("PCMA"));
    assert!(s.codec_associations().lookup_by_codec_for_sending(&sent[0]).is_some());

    // Two send bins over the session lifetime, the first one removed.
    let bins = s.graph.send_bins();
    assert_eq!(bins.len(), 2);

    let err = s.set_send_codec(&audio(9, "G722", 8000)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArguments);

    Ok(())
}

#[test]
pub fn no_common_codec_keeps_table() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    let before = s.codec_associations();

    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;

    let err = stream.set_remote_codecs(vec![audio(18, "G729", 8000)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NegotiationFailed);
    assert!(stream.remote_codecs().is_empty());
    assert!(before.equal(&s.codec_associations()));

    let err = stream.set_remote_codecs(vec![]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArguments);

    let err = stream
        .set_remote_codecs(vec![Codec::new(0, "PCMU", MediaType::Video, 8000)])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArguments);

    s.drive();
    assert!(s.current_send_codec().is_none());

    Ok(())
}

#[test]
pub fn streams_share_one_agent() -> Result<(), ConfError> {
    init_log();

    let a = TestSession::new("audio", SessionConfig::new(MediaType::Audio));
    let b = TestSession::new("audio2", SessionConfig::new(MediaType::Audio).set_id(2));

    let factory = TestAgentFactory::new();
    let bob = Participant::new("bob@test", factory.clone());

    let s1 = a.new_stream(&bob, Direction::SendRecv)?;
    let s2 = b.new_stream(&bob, Direction::SendRecv)?;
    s1.set_transmitter(IceConfig::default())?;
    s2.set_transmitter(IceConfig::default())?;

    assert_eq!(factory.created(), 1);
    assert_eq!(bob.agent_count(), 1);

    let (agent, _) = factory.agent(0);
    let ids = agent.streams();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let err = s1.set_transmitter(IceConfig::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);

    s1.destroy()?;
    assert_eq!(agent.streams().len(), 1);

    Ok(())
}

#[test]
pub fn telephone_event_first_in_remote_offer() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(vec![
        audio(100, "telephone-event", 8000).with_param("events", "0-15"),
        audio(0, "PCMU", 8000),
    ])?;
    let events = s.drive();

    assert!(s.current_send_codec().expect("send codec").is_named("PCMU"));

    let table = s.codec_associations();
    let te = table.lookup_by_pt(100.into(), false).expect("telephone-event negotiated");
    assert!(!te.is_valid_for_sending());

    let secondary = events
        .iter()
        .find_map(|e| match e {
            Event::SendCodecChanged { secondary_codecs, .. } => Some(secondary_codecs.clone()),
            _ => None,
        })
        .expect("send codec changed");
    assert!(secondary.iter().any(|c| c.is_named("telephone-event")));
    assert!(s.errors().is_empty(), "{:?}", s.errors());

    Ok(())
}

#[test]
pub fn telephone_event_first_in_preferences() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("s", SessionConfig::new(MediaType::Audio));
    s.set_codec_preferences(vec![
        audio(CodecId::Any, "telephone-event", 8000),
        audio(0, "PCMU", 8000),
    ])?;
    s.drive();

    let table = s.codec_associations();
    let first = table.first_sendable().expect("sendable codec");
    assert!(first.codec.is_named("PCMU"));
    assert!(table
        .iter()
        .filter(|a| a.codec.is_named("telephone-event"))
        .all(|a| !a.is_valid_for_sending()));

    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(s.codecs_without_config())?;
    s.drive();

    assert!(s.current_send_codec().expect("send codec").is_named("PCMU"));
    assert!(s.errors().is_empty(), "{:?}", s.errors());

    Ok(())
}

#[test]
pub fn failed_header_extension_update_keeps_previous() -> Result<(), ConfError> {
    init_log();

    let config = SessionConfig::new(MediaType::Audio).set_auto_telephone_event(false);
    let mut s = TestSession::new("s", config);

    // OPUS lands at 126 and VORBIS at 127.
    let mut prefs: Vec<Codec> = (96..=125).map(|pt: u8| audio(pt, "reserve-pt", 0)).collect();
    prefs.push(audio(CodecId::Any, "OPUS", 48000));
    prefs.push(audio(CodecId::Any, "VORBIS", 44100));
    s.set_codec_preferences(prefs)?;
    s.drive();

    // The remote moves OPUS to 127. 126 stays behind for receiving only.
    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(vec![audio(127, "OPUS", 48000).with_channels(2), audio(0, "PCMU", 8000)])?;
    s.drive();

    let sending = s.current_send_codec().expect("send codec");
    assert!(sending.is_named("OPUS"));
    assert_eq!(sending.pt(), Some(127.into()));

    // VORBIS no longer has a free payload type.
    let ext = HeaderExtension::new(1, Direction::SendRecv, "urn:ietf:params:rtp-hdrext:ssrc-audio-level");
    let err = stream.set_rtp_header_extensions(vec![ext]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoCodecsLeft);
    s.drive();

    assert!(stream.rtp_header_extensions().is_empty());
    assert_eq!(s.current_send_codec(), Some(sending));

    Ok(())
}
