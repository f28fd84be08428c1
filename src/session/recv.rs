use std::time::Instant;

use crate::assoc::CodecAssociation;
use crate::bus::{ErrorSource, Event};
use crate::codec::{codec_copy_filtered, Codec, ParamType};
use crate::error::{ConfError, ErrorKind};
use crate::graph::BinSource;
use crate::id::{BinId, Pt, Ssrc, StreamId};
use crate::substream::Placement;
use crate::util::Pii;

use super::{SessionShared, State};

/// Ways to build the receive side of `ca`, in order of preference.
fn recv_sources(ca: &CodecAssociation) -> Vec<BinSource> {
    if let Some(profile) = &ca.recv_profile {
        return vec![BinSource::Profile(profile.clone())];
    }

    ca.blueprint
        .iter()
        .flat_map(|b| b.recv_factories.iter())
        .map(|chain| BinSource::Factories(chain.clone()))
        .collect()
}

impl SessionShared {
    /// The codec to decode `pt` with, for a substream of `stream`.
    fn recv_codec(&self, st: &State, pt: Pt, stream: Option<StreamId>) -> Result<(Codec, Vec<BinSource>), ConfError> {
        if st.table.is_empty() {
            return Err(ConfError::internal("No codecs yet"));
        }

        let Some(ca) = st.table.lookup_by_pt(pt, false) else {
            return Err(ConfError::new(
                ErrorKind::UnknownCodec,
                format!("There is no negotiated codec with pt {}", pt),
            ));
        };

        let negotiated = stream
            .and_then(|id| st.stream(id))
            .and_then(|s| s.0.negotiated_codec(pt));

        let codec = negotiated.unwrap_or_else(|| codec_copy_filtered(&ca.codec, ParamType::CONFIG));

        Ok((codec, recv_sources(ca)))
    }

    pub(super) fn handle_new_recv_pad(&self, st: &mut State, ssrc: Ssrc, pt: Pt, now: Instant) {
        if let Some(sub) = st.dispatcher.get_mut(ssrc) {
            if sub.pt == pt {
                trace!("Pad for SSRC {} pt {} already handled", ssrc, pt);
                return;
            }
            debug!("SSRC {} switches from pt {} to {}", ssrc, sub.pt, pt);
            sub.pt = pt;
        } else {
            let streams = st.stream_ids();
            match st.dispatcher.add(ssrc, pt, now, &streams) {
                Placement::Stream(id) => debug!("New substream {} pt {} for stream {}", ssrc, pt, id),
                Placement::Parked => debug!("New substream {} pt {} waits for a stream", ssrc, pt),
            }
        }

        self.refresh_substream(st, ssrc);
    }

    pub(super) fn handle_ssrc_cname(&self, st: &mut State, ssrc: Ssrc, cname: &str) {
        if !st.dispatcher.has_free() {
            return;
        }

        let stream = st
            .streams
            .iter()
            .find(|s| s.participant().cname() == cname)
            .map(|s| s.id());

        let Some(stream) = stream else {
            debug!("No stream for CNAME {:?} of SSRC {}", Pii(cname), ssrc);
            return;
        };

        for moved in st.dispatcher.add_ssrc_stream(ssrc, stream, false) {
            debug!("SSRC {} joins stream {} by CNAME", moved, stream);
            self.refresh_substream(st, moved);
        }
    }

    /// Rebuild the decoder of every substream whose codec changed.
    pub(super) fn verify_recv_codecs(&self, st: &mut State) {
        let ssrcs: Vec<Ssrc> = st.dispatcher.iter().map(|s| s.ssrc).collect();
        for ssrc in ssrcs {
            self.refresh_substream(st, ssrc);
        }
    }

    /// Make the decoder of a substream match its codec. When the substream
    /// belongs to a stream, tell the application about it.
    pub(super) fn refresh_substream(&self, st: &mut State, ssrc: Ssrc) {
        let changed = self.verify_substream_codec(st, ssrc);

        let Some(sub) = st.dispatcher.get_mut(ssrc) else {
            return;
        };
        let Some(stream) = sub.stream else {
            return;
        };

        if !sub.announced {
            if let (Some(codec), Some(caps)) = (&sub.codec, &sub.caps) {
                sub.announced = true;
                let event = Event::SrcPadAdded {
                    stream,
                    ssrc,
                    codec: codec.clone(),
                    caps: caps.clone(),
                };
                info!("Stream {} receives SSRC {} as {}", stream, ssrc, codec);
                self.bus.push(event);
            }
        }

        self.update_recv_codecs(st, stream);

        if changed {
            self.update_rtcp_interval(st);
        }
    }

    /// Returns whether the codec of the substream changed.
    fn verify_substream_codec(&self, st: &mut State, ssrc: Ssrc) -> bool {
        let Some(sub) = st.dispatcher.get(ssrc) else {
            return false;
        };
        let (pt, stream, old_bin) = (sub.pt, sub.stream, sub.bin);
        let had_codec = sub.codec.is_some();

        let source = stream.map(ErrorSource::Stream).unwrap_or(ErrorSource::Session);

        let (codec, sources) = match self.recv_codec(st, pt, stream) {
            Ok(v) => v,
            Err(e) => {
                self.drop_substream_bin(st, ssrc, old_bin);
                self.error(source, e.kind, e.message);
                return had_codec;
            }
        };

        if old_bin.is_some() && st.dispatcher.get(ssrc).and_then(|s| s.codec.as_ref()) == Some(&codec) {
            return false;
        }

        if let Some(bin) = old_bin {
            debug!("Rebuilding decoder of SSRC {} for {}", ssrc, codec);
            self.graph.remove_recv_bin(bin);
        }

        let id = BinId::next();
        let built = sources.iter().find_map(|s| match self.graph.build_recv_bin(id, ssrc, pt, s, &codec) {
            Ok(caps) => Some(caps),
            Err(e) => {
                debug!("Could not build {:?} for {}: {}", s, codec, e);
                None
            }
        });

        let Some(caps) = built else {
            self.drop_substream_bin(st, ssrc, None);
            self.error(
                source,
                ErrorKind::Internal,
                format!("Could not build a codec bin for {}", codec),
            );
            return had_codec;
        };

        if let Some(sub) = st.dispatcher.get_mut(ssrc) {
            sub.bin = Some(id);
            sub.codec = Some(codec);
            sub.caps = Some(caps);
        }

        true
    }

    fn drop_substream_bin(&self, st: &mut State, ssrc: Ssrc, bin: Option<BinId>) {
        if let Some(bin) = bin {
            self.graph.remove_recv_bin(bin);
        }
        if let Some(sub) = st.dispatcher.get_mut(ssrc) {
            sub.bin = None;
            sub.codec = None;
            sub.caps = None;
        }
    }

    /// Report the codecs the substreams of `stream` decode with, if they
    /// changed.
    fn update_recv_codecs(&self, st: &mut State, stream: StreamId) {
        let mut codecs: Vec<Codec> = vec![];
        for c in st.dispatcher.of_stream(stream).filter_map(|s| s.codec.as_ref()) {
            if !codecs.contains(c) {
                codecs.push(c.clone());
            }
        }

        let prev = st.recv_codecs.entry(stream).or_default();
        if *prev == codecs {
            return;
        }
        *prev = codecs.clone();

        debug!("Stream {} receives {:?}", stream, codecs);
        self.bus.push(Event::RecvCodecsChanged { stream, codecs });
    }
}
