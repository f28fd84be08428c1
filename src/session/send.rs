use std::time::Instant;

use crate::assoc::CodecAssociation;
use crate::bitrate::restrict_caps;
use crate::bus::{ErrorSource, Event};
use crate::codec::{codec_copy_filtered, Codec, ParamType};
use crate::error::{ConfError, ErrorKind};
use crate::graph::BinSource;
use crate::id::BinId;

use super::{SessionShared, State, Work, DEFAULT_RTCP_INTERVAL};

/// The active send codec bin.
#[derive(Debug)]
pub(super) struct SendBin {
    pub id: BinId,
    /// Capsfilters on the extra source pads.
    pub capsfilters: Vec<BinId>,
    /// Codecs served by the extra source pads.
    pub other_codecs: Vec<Codec>,
}

#[derive(Debug)]
pub(super) struct SendState {
    pub bin: Option<SendBin>,
    /// Codec of the active bin.
    pub current: Option<Codec>,
    /// What the application asked for.
    pub requested: Option<Codec>,
    /// A block is placed and [`Work::SendBlocked`] is queued.
    pub block_pending: bool,
    pub bitrate: Option<u32>,
}

impl SendState {
    pub fn new(bitrate: Option<u32>) -> Self {
        SendState {
            bin: None,
            current: None,
            requested: None,
            block_pending: false,
            bitrate,
        }
    }
}

/// Ways to build the send side of `ca`, in order of preference.
pub(super) fn send_sources(ca: &CodecAssociation) -> Vec<BinSource> {
    if let Some(profile) = &ca.send_profile {
        return vec![BinSource::Profile(profile.clone())];
    }

    ca.blueprint
        .iter()
        .flat_map(|b| b.send_factories.iter())
        .map(|chain| BinSource::Factories(chain.clone()))
        .collect()
}

impl SessionShared {
    /// Block the send path so the codec bin can be checked.
    pub(super) fn verify_send_codec_bin(&self, st: &mut State) {
        if st.send.block_pending {
            return;
        }

        if let Err(e) = self.graph.block_send() {
            self.error(
                ErrorSource::Session,
                ErrorKind::Internal,
                format!("Could not block the send path: {}", e),
            );
            return;
        }

        st.send.block_pending = true;
        self.queue(Work::SendBlocked);
    }

    pub(super) fn handle_send_blocked(&self, st: &mut State) {
        st.send.block_pending = false;

        match self.reconfigure_send(st) {
            Ok(true) => self.announce_send_codec(st),
            Ok(false) => {}
            Err(e) => self.error(ErrorSource::Session, e.kind, e.message),
        }

        self.graph.unblock_send();
        self.update_valve(st);
        self.update_rtcp_interval(st);
    }

    fn select_send_codec(&self, st: &mut State) -> Result<CodecAssociation, ConfError> {
        if let Some(requested) = &st.send.requested {
            if let Some(ca) = st.table.lookup_by_codec_for_sending(requested) {
                return Ok(ca.clone());
            }
            warn!("Requested send codec {} can no longer be sent, dropping it", requested);
            st.send.requested = None;
        }

        st.table
            .first_sendable()
            .cloned()
            .ok_or_else(|| ConfError::negotiation_failed("Could not get a valid send codec"))
    }

    /// Returns whether what is sent changed.
    fn reconfigure_send(&self, st: &mut State) -> Result<bool, ConfError> {
        let ca = self
            .select_send_codec(st)
            .map_err(|e| ConfError::internal(format!("Could not select a new send codec: {}", e.message)))?;

        let mut changed = false;

        let same = st
            .send
            .current
            .as_ref()
            .map(|c| codec_copy_filtered(c, ParamType::CONFIG) == codec_copy_filtered(&ca.codec, ParamType::CONFIG))
            .unwrap_or(false);

        if same && st.send.bin.is_some() {
            changed |= st.special.remove(&st.table, Some(&ca.codec), &self.graph);
        } else {
            if st.valve_open {
                self.graph.set_send_valve(false);
                st.valve_open = false;
            }

            self.remove_send_codec_bin(st);
            st.special.remove(&st.table, Some(&ca.codec), &self.graph);

            if let Some(t) = st.tfrc.as_ref().filter(|t| ca.pt().map(|pt| t.is_enabled(pt)).unwrap_or(false)) {
                st.send.bitrate = Some(t.bitrate());
            }

            let bin = self.add_send_codec_bin(st, &ca).map_err(|e| {
                ConfError::internal(format!("Could not build a new send codec bin: {}", e.message))
            })?;

            info!("Session {} sending {}", self.id, ca.codec);

            st.send.bin = Some(bin);
            st.send.current = Some(ca.codec.clone());
            changed = true;
        }

        changed |= st.special.create(&st.table, &ca.codec, &*self.graph);

        Ok(changed)
    }

    fn add_send_codec_bin(&self, st: &State, ca: &CodecAssociation) -> Result<SendBin, ConfError> {
        let sources = send_sources(ca);
        let id = BinId::next();

        let mut pads = None;
        let mut last_err = None;

        for source in &sources {
            match self.graph.build_send_bin(id, source, &ca.send_codec) {
                Ok(p) => {
                    pads = Some(p);
                    break;
                }
                Err(e) => {
                    debug!("Could not build {:?} for {}: {}", source, ca.codec, e);
                    last_err = Some(e);
                }
            }
        }

        let Some(pads) = pads else {
            return Err(match last_err {
                Some(e) => e.into(),
                None => ConfError::construction(format!("Nothing builds {}", ca.codec)),
            });
        };

        let main = ca.send_codec.to_rtp_caps();
        if !pads.first().map(|c| c.can_intersect(&main)).unwrap_or(false) {
            self.graph.remove_send_bin(id);
            return Err(ConfError::construction(format!(
                "Could not link codec bin's main pads for : {}",
                ca.codec
            )));
        }

        let mut bin = SendBin {
            id,
            capsfilters: vec![],
            other_codecs: vec![],
        };

        let send_codecs = st.table.to_send_codec_list();

        for (pad, caps) in pads.iter().enumerate().skip(1) {
            let other = send_codecs
                .iter()
                .filter(|c| c.pt() != ca.codec.pt())
                .filter(|c| !bin.other_codecs.iter().any(|o| o.pt() == c.pt()))
                .find(|c| caps.can_intersect(&c.to_rtp_caps()));

            let linked = other.and_then(|c| match self.graph.add_capsfilter(id, pad, &c.to_rtp_caps()) {
                Ok(filter) => Some((filter, c.clone())),
                Err(e) => {
                    debug!("Capsfilter for {}: {}", c, e);
                    None
                }
            });

            let Some((filter, codec)) = linked else {
                self.release_send_bin(&bin);
                return Err(ConfError::construction(format!(
                    "Could not link codec bin's other pads for : {}",
                    ca.codec
                )));
            };

            trace!("Pad {} of send bin {} serves {}", pad, id, codec);
            bin.capsfilters.push(filter);
            bin.other_codecs.push(codec);
        }

        if let Some(bps) = st.send.bitrate {
            self.graph.set_send_bitrate(bps);
        }
        self.keyunit.codec_bin_changed(id, &ca.send_codec);

        Ok(bin)
    }

    fn release_send_bin(&self, bin: &SendBin) {
        for filter in &bin.capsfilters {
            self.graph.remove_capsfilter(*filter);
        }
        self.graph.remove_send_bin(bin.id);
    }

    pub(super) fn remove_send_codec_bin(&self, st: &mut State) {
        if let Some(bin) = st.send.bin.take() {
            debug!("Removing send bin {}", bin.id);
            self.release_send_bin(&bin);
            self.keyunit.codec_bin_removed();
        }
        st.send.current = None;
    }

    fn announce_send_codec(&self, st: &mut State) {
        let (Some(codec), Some(bin)) = (&st.send.current, &st.send.bin) else {
            return;
        };

        let mut secondary_codecs = st.special.codecs(&st.table, codec);
        secondary_codecs.extend(bin.other_codecs.iter().cloned());

        self.bus.push(Event::SendCodecChanged {
            codec: codec.clone(),
            secondary_codecs,
        });

        self.deliver_dtmf(st);
    }

    /// Open the send valve when someone can receive what we send.
    pub(super) fn update_valve(&self, st: &mut State) {
        let sending = st.streams.iter().any(|s| s.0.is_sending());
        if let Some(t) = st.tfrc.as_mut() {
            t.set_sending(sending);
        }

        let open = st.send.bin.is_some() && sending;

        if open != st.valve_open {
            debug!("Session {} send valve {}", self.id, if open { "open" } else { "closed" });
            self.graph.set_send_valve(open);
            st.valve_open = open;
        }
    }

    /// Store the encoder bitrate and hand it to the bitrate adapter.
    pub(super) fn apply_bitrate(&self, st: &mut State, bps: u32, now: Instant) {
        st.send.bitrate = Some(bps);
        if st.send.bin.is_some() {
            self.graph.set_send_bitrate(bps);
        }

        if let Some(adapted) = st.adapter.as_mut().and_then(|a| a.add(now, bps)) {
            self.restrict_send(st, adapted);
        }
    }

    pub(super) fn restrict_send(&self, st: &State, bps: u32) {
        debug!("Session {} adapting video to {} bps", self.id, bps);
        self.graph.restrict_send_caps(&restrict_caps(&st.input_caps, bps));
    }

    /// The RTCP interval follows the smallest minimum reporting interval of
    /// the codecs in use.
    pub(super) fn update_rtcp_interval(&self, st: &mut State) {
        let interval = st
            .send
            .current
            .iter()
            .chain(st.dispatcher.iter().filter_map(|s| s.codec.as_ref()))
            .filter_map(|c| c.minimum_reporting_interval)
            .fold(DEFAULT_RTCP_INTERVAL, u32::min);

        if st.rtcp_interval != Some(interval) {
            trace!("Session {} RTCP interval {}ms", self.id, interval);
            self.graph.set_rtcp_interval(interval);
            st.rtcp_interval = Some(interval);
        }
    }
}
