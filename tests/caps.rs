use std::time::Instant;

use rtpconf::{BinId, Caps, CapsValue, Codec, CodecId, ConfError, Direction, Event};
use rtpconf::{MediaType, Participant, SessionConfig, Ssrc, Structure};

mod common;
use common::{caps, count, init_log, TestAgentFactory, TestSession};

#[test]
pub fn opus_follows_allowed_caps() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("opus", SessionConfig::new(MediaType::Audio));
    s.set_allowed_caps(Some(caps("audio/x-raw, rate=16000, channels=1")), None)?;
    s.drive();

    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(vec![Codec::new(96, "OPUS", MediaType::Audio, 48000)
        .with_channels(2)
        .with_param("sprop-stereo", "1")
        .with_param("sprop-maxcapturerate", "24000")])?;
    s.drive();

    let opus = s
        .codecs()
        .expect("opus needs no configuration")
        .into_iter()
        .find(|c| c.is_named("OPUS"))
        .expect("OPUS published");
    assert_eq!(opus.pt(), Some(96.into()));
    assert_eq!(opus.param("sprop-maxcapturerate"), Some("16000"));
    assert_eq!(opus.param("sprop-stereo"), Some("0"));

    assert!(s.current_send_codec().expect("send codec").is_named("OPUS"));
    let (input, _) = s.allowed_caps();
    assert!(input.can_intersect(&caps("audio/x-raw, rate=16000, channels=1")));

    // The remote sends stereo at 24 kHz.
    let ssrc: Ssrc = 42.into();
    stream.add_id(ssrc)?;
    s.handle_new_recv_pad(ssrc, 96.into(), Instant::now());
    let events = s.drive();

    let pad_caps = events
        .iter()
        .find_map(|e| match e {
            Event::SrcPadAdded { caps, .. } => Some(caps.clone()),
            _ => None,
        })
        .expect("src pad added");
    assert!(pad_caps.can_intersect(&caps("audio/x-raw, rate=24000, channels=2")));
    assert!(s.errors().is_empty(), "{:?}", s.errors());

    Ok(())
}

#[test]
pub fn vorbis_configuration_is_discovered() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("vorbis", SessionConfig::new(MediaType::Audio));
    s.set_codec_preferences(vec![Codec::new(CodecId::Any, "VORBIS", MediaType::Audio, 44100)])?;
    s.drive();

    // Withheld until the encoder told its headers.
    assert!(s.codecs().is_none());
    assert!(s.codecs_without_config().iter().any(|c| c.is_named("VORBIS")));

    let factory = TestAgentFactory::new();
    let stream = s.new_stream(&Participant::new("r@test", factory), Direction::SendRecv)?;
    stream.set_remote_codecs(vec![Codec::new(96, "VORBIS", MediaType::Audio, 44100)])?;
    s.drive();

    assert!(s.codecs().is_none());
    assert!(s.current_send_codec().expect("send codec").is_named("VORBIS"));

    let (bin, codec) = s.graph.discoveries().pop().expect("discovery running");
    assert_eq!(codec.pt(), Some(96.into()));
    assert_eq!(codec.param("configuration"), None);

    let found = Caps::from_structure(
        Structure::new("application/x-rtp")
            .with("media", CapsValue::Str("audio".into()))
            .with("encoding-name", CapsValue::Str("VORBIS".into()))
            .with("configuration", CapsValue::Str("AAAAAZ".into())),
    );
    s.handle_discovery_caps(bin, found);
    let events = s.drive();

    assert_eq!(count(&events, |e| matches!(e, Event::CodecsChanged)), 1);

    let vorbis = s
        .codecs()
        .expect("configuration known")
        .into_iter()
        .find(|c| c.is_named("VORBIS"))
        .expect("VORBIS");
    assert_eq!(vorbis.param("configuration"), Some("AAAAAZ"));

    // The remote gave none, so the stream decodes with what was found.
    let negotiated = stream
        .negotiated_codecs()
        .into_iter()
        .find(|c| c.is_named("VORBIS"))
        .expect("negotiated VORBIS");
    assert_eq!(negotiated.param("configuration"), Some("AAAAAZ"));

    assert!(s.errors().is_empty(), "{:?}", s.errors());

    Ok(())
}

#[test]
pub fn stale_discovery_caps_are_ignored() -> Result<(), ConfError> {
    init_log();

    let mut s = TestSession::new("vorbis", SessionConfig::new(MediaType::Audio));
    s.set_codec_preferences(vec![Codec::new(CodecId::Any, "VORBIS", MediaType::Audio, 44100)])?;
    s.drive();

    let (bin, _) = s.graph.discoveries().pop().expect("discovery running");
    s.handle_discovery_caps(
        BinId::next(),
        Caps::from_structure(Structure::new("application/x-rtp").with("configuration", CapsValue::Str("X".into()))),
    );
    s.drive();
    assert!(s.codecs().is_none());

    s.handle_discovery_caps(
        bin,
        Caps::from_structure(Structure::new("application/x-rtp").with("configuration", CapsValue::Str("Y".into()))),
    );
    s.drive();
    assert!(s.codecs().is_some());

    Ok(())
}
