//! Auxiliary send sources spliced next to the main codec.
//!
//! Telephony events and comfort noise are produced by their own sources
//! feeding the RTP muxer. Which of them exist follows the active send codec.

use std::sync::Arc;
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::assoc::{AssociationTable, CodecAssociation};
use crate::blueprint::Blueprint;
use crate::codec::{Caps, Codec, CodecId, MediaType};
use crate::graph::MediaGraph;
use crate::id::BinId;

/// Encoding name of RFC 4733 named events.
pub const TELEPHONE_EVENT: &str = "telephone-event";

/// Encoding name of RFC 3389 comfort noise.
pub const COMFORT_NOISE: &str = "CN";

/// Factory consuming RFC 4733 packets.
const DTMF_EVENT_DEPAY: &str = "rtpdtmfdepay";

/// Kinds of special sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialSourceKind {
    /// RFC 4733 telephone events.
    DtmfEvent,
    /// In-band DTMF tones encoded with the main codec.
    DtmfSound,
    /// RFC 3389 comfort noise.
    ComfortNoise,
}

impl SpecialSourceKind {
    /// Every kind, in default precedence.
    pub fn all() -> &'static [SpecialSourceKind] {
        &[
            SpecialSourceKind::DtmfEvent,
            SpecialSourceKind::DtmfSound,
            SpecialSourceKind::ComfortNoise,
        ]
    }

    /// Name handed to the graph when building one.
    pub fn name(&self) -> &'static str {
        match self {
            SpecialSourceKind::DtmfEvent => "dtmf-event",
            SpecialSourceKind::DtmfSound => "dtmf-sound",
            SpecialSourceKind::ComfortNoise => "comfort-noise",
        }
    }

    fn class(&self) -> Option<&'static dyn SpecialSourceClass> {
        CLASSES.iter().find(|c| c.kind() == *self).map(|c| &**c)
    }
}

/// Behavior shared by every source of one kind.
pub(crate) trait SpecialSourceClass: Send + Sync {
    fn kind(&self) -> SpecialSourceKind;

    /// The codec a source of this kind should produce while `send_codec` is
    /// the main codec, if any.
    fn matching_codec(&self, table: &AssociationTable, send_codec: &Codec) -> Option<Codec>;

    /// Adjust a freshly negotiated table.
    fn negotiation_filter(&self, table: AssociationTable) -> AssociationTable {
        table
    }

    /// Add blueprints this kind can always build.
    fn add_blueprints(&self, blueprints: &mut Vec<Arc<Blueprint>>) {
        let _ = blueprints;
    }
}

static CLASSES: Lazy<Vec<Box<dyn SpecialSourceClass>>> = Lazy::new(|| {
    vec![
        Box::new(DtmfEventClass),
        Box::new(DtmfSoundClass),
        Box::new(ComfortNoiseClass),
    ]
});

fn sendable(a: &&CodecAssociation) -> bool {
    a.is_valid_for_sending()
}

// Special codecs have no encoder of their own, so they are never valid for
// sending as a main codec.
fn negotiated(a: &&CodecAssociation) -> bool {
    a.is_live() && !a.recv_only
}

struct DtmfEventClass;

impl SpecialSourceClass for DtmfEventClass {
    fn kind(&self) -> SpecialSourceKind {
        SpecialSourceKind::DtmfEvent
    }

    fn matching_codec(&self, table: &AssociationTable, send_codec: &Codec) -> Option<Codec> {
        if send_codec.media_type != MediaType::Audio {
            return None;
        }
        table
            .iter()
            .filter(negotiated)
            .find(|a| a.codec.is_named(TELEPHONE_EVENT) && a.codec.clock_rate == send_codec.clock_rate)
            .map(|a| a.codec.clone())
    }

    // Events are timed against the main codec, so an event codec without a
    // main codec at its clock rate can not be used.
    fn negotiation_filter(&self, table: AssociationTable) -> AssociationTable {
        let main_rates: Vec<u32> = table
            .iter()
            .filter(sendable)
            .filter(|a| !a.codec.is_named(TELEPHONE_EVENT) && !a.codec.is_named(COMFORT_NOISE))
            .map(|a| a.codec.clock_rate)
            .collect();

        let entries = table
            .into_entries()
            .into_iter()
            .map(|mut a| {
                if a.is_live()
                    && !a.recv_only
                    && a.codec.is_named(TELEPHONE_EVENT)
                    && !main_rates.contains(&a.codec.clock_rate)
                {
                    debug!("Disabling {} without main codec at its rate", a.codec);
                    a.disabled = true;
                }
                a
            })
            .collect();

        AssociationTable::from_entries(entries)
    }

    fn add_blueprints(&self, blueprints: &mut Vec<Arc<Blueprint>>) {
        let mut rates: Vec<u32> = blueprints
            .iter()
            .filter(|b| b.can_send() && b.codec.media_type == MediaType::Audio)
            .filter(|b| !b.codec.is_named(TELEPHONE_EVENT) && b.codec.clock_rate != 0)
            .map(|b| b.codec.clock_rate)
            .collect();
        rates.sort_unstable();
        rates.dedup();

        for rate in rates {
            let exists = blueprints
                .iter()
                .any(|b| b.codec.is_named(TELEPHONE_EVENT) && b.codec.clock_rate == rate);
            if exists {
                continue;
            }

            let codec = Codec::new(CodecId::Any, TELEPHONE_EVENT, MediaType::Audio, rate)
                .with_param("events", "0-15");

            let recv_factories = blueprints
                .iter()
                .find(|b| b.codec.is_named(TELEPHONE_EVENT) && b.can_recv())
                .map(|b| b.recv_factories.clone())
                .unwrap_or_else(|| vec![vec![DTMF_EVENT_DEPAY.to_string()]]);

            trace!("Adding telephone-event blueprint at {}", rate);

            blueprints.push(Arc::new(Blueprint {
                rtp_caps: codec.to_rtp_caps(),
                codec,
                input_caps: Caps::new_any(),
                output_caps: Caps::new_any(),
                send_factories: vec![],
                recv_factories,
            }));
        }
    }
}

struct DtmfSoundClass;

impl SpecialSourceClass for DtmfSoundClass {
    fn kind(&self) -> SpecialSourceKind {
        SpecialSourceKind::DtmfSound
    }

    // Tones are generated as raw audio and encoded with the main codec, which
    // only works for narrowband codecs built from a blueprint.
    fn matching_codec(&self, table: &AssociationTable, send_codec: &Codec) -> Option<Codec> {
        if send_codec.media_type != MediaType::Audio || send_codec.clock_rate != 8000 {
            return None;
        }
        let a = table.lookup_by_codec_for_sending(send_codec)?;
        a.blueprint.as_ref().filter(|b| b.can_send())?;
        Some(a.codec.clone())
    }
}

struct ComfortNoiseClass;

impl SpecialSourceClass for ComfortNoiseClass {
    fn kind(&self) -> SpecialSourceKind {
        SpecialSourceKind::ComfortNoise
    }

    fn matching_codec(&self, table: &AssociationTable, send_codec: &Codec) -> Option<Codec> {
        if send_codec.media_type != MediaType::Audio || send_codec.is_named(COMFORT_NOISE) {
            return None;
        }
        table
            .iter()
            .filter(negotiated)
            .find(|a| a.codec.is_named(COMFORT_NOISE) && a.codec.clock_rate == send_codec.clock_rate)
            .map(|a| a.codec.clone())
    }
}

/// A live source in the graph.
#[derive(Debug)]
struct SpecialSource {
    kind: SpecialSourceKind,
    id: BinId,
    codec: Codec,
}

/// Special sources of one session.
pub(crate) struct SpecialSources {
    kinds: Vec<SpecialSourceKind>,
    live: Vec<SpecialSource>,
    stopping: Vec<JoinHandle<()>>,
}

impl SpecialSources {
    pub fn new(kinds: &[SpecialSourceKind]) -> Self {
        SpecialSources {
            kinds: kinds.to_vec(),
            live: vec![],
            stopping: vec![],
        }
    }

    fn classes(&self) -> impl Iterator<Item = &'static dyn SpecialSourceClass> + '_ {
        self.kinds.iter().filter_map(|k| k.class())
    }

    /// Blueprints extended with what the enabled kinds can build.
    pub fn add_blueprints(&self, blueprints: &[Arc<Blueprint>]) -> Vec<Arc<Blueprint>> {
        let mut out = blueprints.to_vec();
        for class in self.classes() {
            class.add_blueprints(&mut out);
        }
        out
    }

    pub fn negotiation_filter(&self, mut table: AssociationTable) -> AssociationTable {
        for class in self.classes() {
            table = class.negotiation_filter(table);
        }
        table
    }

    /// Stop sources whose codec no longer matches `send_codec`. Stopping
    /// happens on a worker thread. Returns whether anything was stopped.
    pub fn remove(
        &mut self,
        table: &AssociationTable,
        send_codec: Option<&Codec>,
        graph: &Arc<dyn MediaGraph>,
    ) -> bool {
        let mut changed = false;
        let mut keep = vec![];

        for s in std::mem::take(&mut self.live) {
            let wanted = match (send_codec, s.kind.class()) {
                (Some(c), Some(class)) if self.kinds.contains(&s.kind) => class.matching_codec(table, c),
                _ => None,
            };

            if wanted.as_ref() == Some(&s.codec) {
                keep.push(s);
                continue;
            }

            debug!("Stopping {} source for {}", s.kind.name(), s.codec);
            self.stop_in_background(s.id, graph);
            changed = true;
        }

        self.live = keep;
        changed
    }

    fn stop_in_background(&mut self, id: BinId, graph: &Arc<dyn MediaGraph>) {
        self.stopping.retain(|h| !h.is_finished());

        let g = graph.clone();
        let spawned = std::thread::Builder::new()
            .name("special-source-stop".into())
            .spawn(move || g.stop_special_source(id));

        match spawned {
            Ok(handle) => self.stopping.push(handle),
            Err(e) => {
                warn!("Could not start stop thread, stopping inline: {}", e);
                graph.stop_special_source(id);
            }
        }
    }

    /// Create sources for kinds that have none and a matching codec.
    /// Returns whether anything was created.
    pub fn create(&mut self, table: &AssociationTable, send_codec: &Codec, graph: &dyn MediaGraph) -> bool {
        let mut changed = false;

        for class in self.kinds.iter().filter_map(|k| k.class()) {
            let kind = class.kind();
            if self.live.iter().any(|s| s.kind == kind) {
                continue;
            }
            let Some(codec) = class.matching_codec(table, send_codec) else {
                continue;
            };

            let id = BinId::next();
            if let Err(e) = graph.add_special_source(id, kind.name(), &codec) {
                warn!("Failed to make new {} source: {}", kind.name(), e);
                continue;
            }

            debug!("Created {} source for {}", kind.name(), codec);
            self.live.push(SpecialSource { kind, id, codec });
            changed = true;
        }

        changed
    }

    /// Codecs served by sources next to `main`, as published in the table.
    pub fn codecs(&self, table: &AssociationTable, main: &Codec) -> Vec<Codec> {
        self.live
            .iter()
            .filter(|s| s.codec.pt() != main.pt())
            .filter_map(|s| s.codec.pt().and_then(|pt| table.lookup_by_pt(pt, false)))
            .map(|a| a.codec.clone())
            .collect()
    }

    /// Whether a graph message from `src` belongs to one of our sources.
    pub fn claims(&self, src: BinId) -> bool {
        self.live.iter().any(|s| s.id == src)
    }

    /// Stop everything and wait for all stops to finish.
    pub fn destroy(&mut self, graph: &Arc<dyn MediaGraph>) {
        for s in std::mem::take(&mut self.live) {
            self.stop_in_background(s.id, graph);
        }
        self.join();
    }

    /// Wait for pending stops.
    pub fn join(&mut self) {
        for h in self.stopping.drain(..) {
            if h.join().is_err() {
                warn!("Special source stop thread panicked");
            }
        }
    }
}
