//! The codec association table.

use std::fmt;
use std::sync::Arc;

use crate::blueprint::Blueprint;
use crate::codec::{codec_copy_filtered, Codec, ParamType};
use crate::id::Pt;

/// One row of the negotiation table.
#[derive(Clone)]
pub struct CodecAssociation {
    /// Blueprint building this codec. Absent for profile-only codecs and
    /// for disabled placeholders.
    pub blueprint: Option<Arc<Blueprint>>,
    /// Full codec, including configuration parameters.
    pub codec: Codec,
    /// The codec as sent, without configuration parameters.
    pub send_codec: Codec,
    pub send_profile: Option<String>,
    pub recv_profile: Option<String>,
    /// The payload type must not be used.
    pub reserved: bool,
    /// The remote refused the codec.
    pub disabled: bool,
    /// Configuration data must be discovered before publishing.
    pub needs_config: bool,
    /// Previously offered, kept so the payload type is not reused.
    pub recv_only: bool,
}

impl CodecAssociation {
    pub(crate) fn new(codec: Codec, blueprint: Option<Arc<Blueprint>>) -> Self {
        CodecAssociation {
            blueprint,
            send_codec: codec_copy_filtered(&codec, ParamType::CONFIG),
            codec,
            send_profile: None,
            recv_profile: None,
            reserved: false,
            disabled: false,
            needs_config: false,
            recv_only: false,
        }
    }

    pub(crate) fn new_reserved(codec: Codec) -> Self {
        let mut a = Self::new(codec, None);
        a.reserved = true;
        a
    }

    pub(crate) fn new_disabled(codec: Codec) -> Self {
        let mut a = Self::new(codec.clone(), None);
        a.send_codec = codec;
        a.disabled = true;
        a
    }

    pub fn pt(&self) -> Option<Pt> {
        self.codec.pt()
    }

    /// Neither disabled nor reserved.
    pub fn is_live(&self) -> bool {
        !self.disabled && !self.reserved
    }

    /// Whether this association could become the main send codec.
    pub fn is_valid_for_sending(&self) -> bool {
        self.is_live()
            && !self.recv_only
            && (self.send_profile.is_some()
                || self.blueprint.as_ref().map(|b| b.can_send()).unwrap_or(false))
    }

    fn same_as(&self, other: &CodecAssociation) -> bool {
        self.codec == other.codec
            && self.send_codec == other.send_codec
            && self.recv_only == other.recv_only
            && self.send_profile == other.send_profile
            && self.recv_profile == other.recv_profile
    }
}

impl fmt::Debug for CodecAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecAssociation({}", self.codec)?;
        for (set, flag) in [
            (self.reserved, "reserved"),
            (self.disabled, "disabled"),
            (self.needs_config, "needs-config"),
            (self.recv_only, "recv-only"),
        ] {
            if set {
                write!(f, " {}", flag)?;
            }
        }
        write!(f, ")")
    }
}

/// Ordered list of associations.
///
/// Order is the preference order presented to peers. Live entries never
/// share a payload type.
#[derive(Debug, Clone, Default)]
pub struct AssociationTable {
    entries: Vec<CodecAssociation>,
}

impl AssociationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodecAssociation> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut CodecAssociation> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn from_entries(entries: Vec<CodecAssociation>) -> Self {
        AssociationTable { entries }
    }

    pub(crate) fn into_entries(self) -> Vec<CodecAssociation> {
        self.entries
    }

    #[cfg(test)]
    pub(crate) fn push(&mut self, a: CodecAssociation) {
        if let (true, Some(pt)) = (a.is_live(), a.pt()) {
            debug_assert!(self.lookup_by_pt(pt, false).is_none(), "duplicate pt {}", pt);
        }
        self.entries.push(a);
    }

    /// Whether any entry, in any state, uses the payload type.
    pub(crate) fn uses_pt(&self, pt: Pt) -> bool {
        self.entries.iter().any(|a| a.pt() == Some(pt))
    }

    /// Association at the payload type. Reserved entries are never returned,
    /// disabled ones only when asked for.
    pub fn lookup_by_pt(&self, pt: Pt, want_disabled: bool) -> Option<&CodecAssociation> {
        self.entries
            .iter()
            .filter(|a| !a.reserved)
            .filter(|a| want_disabled || !a.disabled)
            .find(|a| a.pt() == Some(pt))
    }

    /// Live association whose codec equals `codec`.
    pub fn lookup_by_codec(&self, codec: &Codec) -> Option<&CodecAssociation> {
        self.entries
            .iter()
            .filter(|a| a.is_live())
            .find(|a| a.codec == *codec)
    }

    /// Association that can send `codec`. Configuration parameters are
    /// ignored on both sides.
    pub fn lookup_by_codec_for_sending(&self, codec: &Codec) -> Option<&CodecAssociation> {
        let wanted = codec_copy_filtered(codec, ParamType::CONFIG);

        self.entries
            .iter()
            .filter(|a| a.is_valid_for_sending())
            .find(|a| codec_copy_filtered(&a.send_codec, ParamType::CONFIG) == wanted)
    }

    /// Codecs to present to peers. Skips disabled, reserved and receive-only
    /// entries.
    pub fn to_codec_list(&self, include_config: bool) -> Vec<Codec> {
        self.entries
            .iter()
            .filter(|a| a.is_live() && !a.recv_only)
            .map(|a| {
                if include_config {
                    a.codec.clone()
                } else {
                    codec_copy_filtered(&a.codec, ParamType::CONFIG)
                }
            })
            .collect()
    }

    /// Codecs in their sent form.
    pub fn to_send_codec_list(&self) -> Vec<Codec> {
        self.entries
            .iter()
            .filter(|a| a.is_live() && !a.recv_only)
            .map(|a| a.send_codec.clone())
            .collect()
    }

    /// First association that can be sent.
    pub fn first_sendable(&self) -> Option<&CodecAssociation> {
        self.entries.iter().find(|a| a.is_valid_for_sending())
    }

    /// Whether any association still waits for configuration data.
    pub fn needs_config(&self) -> bool {
        self.entries.iter().any(|a| a.is_live() && a.needs_config)
    }

    /// Structural equality over live entries.
    pub fn equal(&self, other: &AssociationTable) -> bool {
        let a: Vec<_> = self.entries.iter().filter(|a| !a.disabled).collect();
        let b: Vec<_> = other.entries.iter().filter(|a| !a.disabled).collect();

        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_as(y))
    }
}
