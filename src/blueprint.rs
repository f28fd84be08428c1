//! Discovery of buildable codec pipelines.
//!
//! A blueprint ties one RTP encoding to the element factories that can
//! produce it (encoder and payloader) and consume it (depayloader and
//! decoder).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{Caps, CapsValue, Codec, MediaType, Structure};

/// What an element factory does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactoryKind {
    Encoder,
    Decoder,
    Payloader,
    Depayloader,
}

/// An installed element factory, as reported by the media framework.
#[derive(Debug, Clone)]
pub struct ElementFactory {
    pub name: String,
    pub kind: FactoryKind,
    /// Higher is preferred.
    pub rank: u32,
    pub sink_caps: Caps,
    pub src_caps: Caps,
}

impl ElementFactory {
    pub fn new(name: &str, kind: FactoryKind, rank: u32, sink_caps: Caps, src_caps: Caps) -> Self {
        ElementFactory {
            name: name.to_string(),
            kind,
            rank,
            sink_caps,
            src_caps,
        }
    }
}

/// Source of installed element factories.
pub trait ElementRegistry: Send + Sync {
    /// All factories, in registry order.
    fn factories(&self) -> Vec<ElementFactory>;
}

/// A buildable codec.
#[derive(Clone)]
pub struct Blueprint {
    /// Codec compiled from the RTP caps.
    pub codec: Codec,
    /// RTP caps template.
    pub rtp_caps: Caps,
    /// Raw media the send chain accepts.
    pub input_caps: Caps,
    /// Raw media the receive chain produces.
    pub output_caps: Caps,
    /// Candidate send chains, best first. Each is a list of factory names
    /// from the encoder to the payloader.
    pub send_factories: Vec<Vec<String>>,
    /// Candidate receive chains, best first, depayloader to decoder.
    pub recv_factories: Vec<Vec<String>>,
}

impl Blueprint {
    /// Whether a send chain could be built.
    pub fn can_send(&self) -> bool {
        !self.send_factories.is_empty()
    }

    /// Whether a receive chain could be built.
    pub fn can_recv(&self) -> bool {
        !self.recv_factories.is_empty()
    }
}

impl fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blueprint({} send={:?} recv={:?})",
            self.codec, self.send_factories, self.recv_factories
        )
    }
}

/// Memoizing front of an [`ElementRegistry`].
pub struct BlueprintRegistry {
    registry: Arc<dyn ElementRegistry>,
    cache: Mutex<HashMap<MediaType, Arc<[Arc<Blueprint>]>>>,
}

impl BlueprintRegistry {
    pub fn new(registry: Arc<dyn ElementRegistry>) -> Self {
        BlueprintRegistry {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Blueprints for the media type. Discovery runs once per type.
    pub fn discover(&self, media_type: MediaType) -> Arc<[Arc<Blueprint>]> {
        let mut cache = self.cache.lock();

        if let Some(v) = cache.get(&media_type) {
            return v.clone();
        }

        let factories = self.registry.factories();
        let found: Arc<[Arc<Blueprint>]> = discover(&factories, media_type)
            .into_iter()
            .map(Arc::new)
            .collect();

        debug!("Discovered {} {} blueprints", found.len(), media_type);
        cache.insert(media_type, found.clone());

        found
    }
}

fn is_rtp_of(s: &Structure, media_type: MediaType) -> bool {
    s.name() == "application/x-rtp"
        && match s.get("media") {
            Some(CapsValue::Str(m)) => MediaType::from(m.as_str()) == media_type,
            Some(v) => v
                .intersect(&CapsValue::Str(media_type.to_string()))
                .is_some(),
            None => false,
        }
}

/// Split a structure with a list of encoding names into one per name.
fn expand_encoding_names(s: &Structure) -> Vec<Structure> {
    match s.get("encoding-name") {
        Some(CapsValue::List(names)) => names
            .iter()
            .filter_map(|n| match n {
                CapsValue::Str(_) => Some(s.clone().with("encoding-name", n.clone())),
                _ => None,
            })
            .collect(),
        Some(CapsValue::Str(_)) => vec![s.clone()],
        _ => vec![],
    }
}

fn discover(factories: &[ElementFactory], media_type: MediaType) -> Vec<Blueprint> {
    let raw = Caps::from_structure(Structure::new(media_type.raw_caps_name()));

    let of_kind = |k: FactoryKind| -> Vec<&ElementFactory> {
        let mut v: Vec<_> = factories.iter().filter(|f| f.kind == k).collect();
        // Stable, so registry order is kept for equal ranks.
        v.sort_by(|a, b| b.rank.cmp(&a.rank));
        v
    };

    let payloaders = of_kind(FactoryKind::Payloader);
    let depayloaders = of_kind(FactoryKind::Depayloader);
    let encoders = of_kind(FactoryKind::Encoder);
    let decoders = of_kind(FactoryKind::Decoder);

    let mut templates: Vec<Structure> = vec![];
    let rtp_sides = payloaders
        .iter()
        .flat_map(|p| p.src_caps.structures())
        .chain(depayloaders.iter().flat_map(|d| d.sink_caps.structures()));

    for s in rtp_sides {
        if !is_rtp_of(s, media_type) {
            continue;
        }
        for e in expand_encoding_names(s) {
            if !templates.contains(&e) {
                templates.push(e);
            }
        }
    }

    let mut out = vec![];

    for template in templates {
        let rtp_caps = Caps::from_structure(template.clone());

        let Some(mut codec) = Codec::from_rtp_structure(&template) else {
            continue;
        };
        codec.media_type = media_type;

        for (name, _) in template.fields() {
            if let Some(fb) = name.strip_prefix("rtcp-fb-") {
                let (kind, subtype) = fb.split_once('-').unwrap_or((fb, ""));
                codec.add_feedback(kind, subtype, "");
            }
        }

        let mut input_caps = Caps::new_empty();
        let mut send_factories = vec![];

        for pay in payloaders.iter().filter(|p| p.src_caps.can_intersect(&rtp_caps)) {
            if pay.sink_caps.can_intersect(&raw) {
                send_factories.push(vec![pay.name.clone()]);
                input_caps.append(pay.sink_caps.intersect(&raw));
                continue;
            }
            for enc in encoders.iter().filter(|e| e.src_caps.can_intersect(&pay.sink_caps)) {
                send_factories.push(vec![enc.name.clone(), pay.name.clone()]);
                input_caps.append(enc.sink_caps.clone());
            }
        }

        let mut output_caps = Caps::new_empty();
        let mut recv_factories = vec![];

        for depay in depayloaders.iter().filter(|d| d.sink_caps.can_intersect(&rtp_caps)) {
            if depay.src_caps.can_intersect(&raw) {
                recv_factories.push(vec![depay.name.clone()]);
                output_caps.append(depay.src_caps.intersect(&raw));
                continue;
            }
            for dec in decoders.iter().filter(|d| d.sink_caps.can_intersect(&depay.src_caps)) {
                recv_factories.push(vec![depay.name.clone(), dec.name.clone()]);
                output_caps.append(dec.src_caps.clone());
            }
        }

        if send_factories.is_empty() && recv_factories.is_empty() {
            trace!("No usable chain for {}", codec);
            continue;
        }

        let bp = Blueprint {
            codec,
            rtp_caps,
            input_caps,
            output_caps,
            send_factories,
            recv_factories,
        };

        trace!("Blueprint {:?}", bp);
        out.push(bp);
    }

    // Codecs we can decode first.
    out.sort_by_key(|b| std::cmp::Reverse((b.can_recv() as u8) * 2 + b.can_send() as u8));

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::CodecId;

    fn caps(s: &str) -> Caps {
        s.parse().unwrap()
    }

    struct Reg(Vec<ElementFactory>);

    impl ElementRegistry for Reg {
        fn factories(&self) -> Vec<ElementFactory> {
            self.0.clone()
        }
    }

    fn audio_registry() -> Reg {
        use FactoryKind::*;
        let pcmu = "application/x-rtp, media=audio, payload=0, clock-rate=8000, encoding-name=PCMU";
        let dtmf = "application/x-rtp, media=audio, payload=[ 96, 127 ], clock-rate=[ 1, 2147483647 ], \
                    encoding-name=TELEPHONE-EVENT";
        Reg(vec![
            ElementFactory::new("mulawenc", Encoder, 256, caps("audio/x-raw"), caps("audio/x-mulaw")),
            ElementFactory::new("mulawdec", Decoder, 256, caps("audio/x-mulaw"), caps("audio/x-raw")),
            ElementFactory::new("rtppcmupay", Payloader, 256, caps("audio/x-mulaw"), caps(pcmu)),
            ElementFactory::new("rtppcmudepay", Depayloader, 256, caps(pcmu), caps("audio/x-mulaw")),
            ElementFactory::new("rtpdtmfdepay", Depayloader, 256, caps(dtmf), caps("audio/x-raw")),
            ElementFactory::new("theoraenc", Encoder, 256, caps("video/x-raw"), caps("video/x-theora")),
        ])
    }

    #[test]
    fn discovers_chains() {
        let reg = BlueprintRegistry::new(Arc::new(audio_registry()));
        let bps = reg.discover(MediaType::Audio);
        assert_eq!(bps.len(), 2);

        let pcmu = &bps[0];
        assert!(pcmu.codec.is_named("PCMU"));
        assert_eq!(pcmu.codec.id, CodecId::Pt(0.into()));
        assert_eq!(pcmu.send_factories, vec![vec!["mulawenc", "rtppcmupay"]]);
        assert_eq!(pcmu.recv_factories, vec![vec!["rtppcmudepay", "mulawdec"]]);
        assert!(pcmu.input_caps.can_intersect(&caps("audio/x-raw, rate=8000")));

        let te = &bps[1];
        assert!(te.codec.is_named("telephone-event"));
        assert_eq!(te.codec.id, CodecId::Any);
        assert_eq!(te.codec.clock_rate, 0);
        assert!(!te.can_send());
        assert!(te.can_recv());
    }

    #[test]
    fn memoized_per_media_type() {
        let reg = BlueprintRegistry::new(Arc::new(audio_registry()));
        let a = reg.discover(MediaType::Audio);
        let b = reg.discover(MediaType::Audio);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(reg.discover(MediaType::Video).is_empty());
    }
}
