//! Configuration data discovery.
//!
//! Some encoders only tell their configuration (Vorbis and Theora headers,
//! H.264 parameter sets) in the caps they produce. Until those are known the
//! codec can not be offered in full, so each such codec gets encoded in a
//! side pipeline whose output caps are read back.

use crate::assoc::{AssociationTable, CodecAssociation};
use crate::bus::{ErrorSource, Event};
use crate::codec::{codec_copy_filtered, codec_has_config_data_named, Caps, Codec, ParamType};
use crate::error::ErrorKind;
use crate::id::BinId;

use super::send::send_sources;
use super::{SessionShared, State, Work};

#[derive(Debug, Default)]
pub(super) struct Discovery {
    /// Discovery bin and the send codec it encodes.
    active: Option<(BinId, Codec)>,
    /// [`Work::DiscoveryBlocked`] is queued.
    block_pending: bool,
}

/// Sendable association whose send codec is `codec`, ignoring configuration.
fn sendable_mut<'a>(table: &'a mut AssociationTable, codec: &Codec) -> Option<&'a mut CodecAssociation> {
    let wanted = codec_copy_filtered(codec, ParamType::CONFIG);
    table
        .iter_mut()
        .filter(|a| a.is_valid_for_sending())
        .find(|a| codec_copy_filtered(&a.send_codec, ParamType::CONFIG) == wanted)
}

/// Copy configuration fields of `caps` into the codec. Returns whether any
/// parameter changed.
fn gather_caps_parameters(ca: &mut CodecAssociation, caps: &Caps) -> bool {
    let mut changed = false;

    if let Some(s) = caps.structures().first() {
        for (name, value) in s.fields() {
            let Some(value) = value.as_string() else {
                continue;
            };
            if !codec_has_config_data_named(&ca.codec, name) {
                continue;
            }
            if ca.codec.param(name) != Some(value.as_str()) {
                trace!("Discovered {}={} for {}", name, value, ca.codec);
                ca.codec.set_param(name, &value);
                changed = true;
            }
        }
    }

    ca.needs_config = false;
    changed
}

impl SessionShared {
    /// Start discovering if a codec needs configuration, stop otherwise.
    pub(super) fn start_discovery(&self, st: &mut State) {
        if !st.table.needs_config() {
            self.stop_discovery(st);
            return;
        }

        self.block_discovery(st);
    }

    fn block_discovery(&self, st: &mut State) {
        if st.discovery.block_pending {
            return;
        }
        st.discovery.block_pending = true;
        self.queue(Work::DiscoveryBlocked);
    }

    pub(super) fn stop_discovery(&self, st: &mut State) {
        if let Some((id, codec)) = st.discovery.active.take() {
            debug!("Stopping discovery of {}", codec);
            self.graph.stop_discovery(id);
        }
    }

    pub(super) fn handle_discovery_blocked(&self, st: &mut State) {
        st.discovery.block_pending = false;

        let Some(ca) = st.table.iter().find(|a| a.is_valid_for_sending() && a.needs_config).cloned() else {
            self.stop_discovery(st);
            info!("Session {} knows the configuration of every codec", self.id);
            self.bus.push(Event::CodecsChanged);
            return;
        };

        if let Some((_, codec)) = &st.discovery.active {
            if *codec == ca.send_codec {
                return;
            }
        }

        self.stop_discovery(st);

        let id = BinId::next();
        let mut last_err = None;

        for source in send_sources(&ca) {
            match self.graph.start_discovery(id, &source, &ca.send_codec) {
                Ok(()) => {
                    debug!("Discovering configuration of {}", ca.send_codec);
                    st.discovery.active = Some((id, ca.send_codec.clone()));
                    return;
                }
                Err(e) => {
                    debug!("Could not discover with {:?}: {}", source, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        let reason = last_err.unwrap_or_else(|| format!("nothing builds {}", ca.codec));
        self.error(
            ErrorSource::Session,
            ErrorKind::Internal,
            format!("Error while discovering codec data, discovery cancelled: {}", reason),
        );
    }

    pub(super) fn handle_discovery_caps(&self, st: &mut State, bin: BinId, caps: &Caps) {
        let Some((id, codec)) = st.discovery.active.clone() else {
            debug!("Got caps while discovery is stopping");
            return;
        };
        if id != bin {
            trace!("Caps from stale discovery bin {}", bin);
            return;
        }

        let mut block = true;

        if let Some(ca) = sendable_mut(&mut st.table, &codec) {
            if ca.needs_config {
                gather_caps_parameters(ca, caps);
                block = !ca.needs_config;
                st.discovery.active = Some((id, ca.send_codec.clone()));
            }
        }

        if block {
            self.distribute_recv_codecs(st);
            self.block_discovery(st);
        }
    }

    /// Caps from the real encoder can carry configuration too.
    pub(super) fn handle_send_caps(&self, st: &mut State, caps: &Caps) {
        let Some(current) = st.send.current.clone() else {
            return;
        };
        let Some(ca) = sendable_mut(&mut st.table, &current) else {
            return;
        };

        if !gather_caps_parameters(ca, caps) {
            return;
        }
        st.send.current = Some(ca.codec.clone());

        if !st.table.needs_config() {
            self.distribute_recv_codecs(st);
            self.bus.push(Event::CodecsChanged);
        }
    }
}
