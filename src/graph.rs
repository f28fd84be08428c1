//! The media graph the core drives.
//!
//! Element construction, pad linking and pad blocking belong to the
//! streaming framework. The core only tells the graph what to build and
//! where to splice it.

use thiserror::Error;

use crate::codec::{Caps, Codec};
use crate::dtmf::DtmfEvent;
use crate::id::{BinId, Pt, Ssrc};
use crate::srtp::SrtpParams;

/// Errors from building or inspecting graph parts.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An element factory could not be instantiated.
    #[error("could not create element: {0}")]
    Element(String),

    /// Two elements could not be linked.
    #[error("could not link: {0}")]
    Link(String),

    /// A builder description was rejected.
    #[error("{0}")]
    Profile(#[from] ProfileError),

    /// The graph refused the operation.
    #[error("{0}")]
    Other(String),
}

/// Errors from parsing a textual builder description.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("could not parse profile: {0}")]
    Parse(String),

    #[error("profile has {0}")]
    Shape(String),
}

/// Unconnected pads of a parsed builder description.
#[derive(Debug, Clone, Default)]
pub struct ProfileShape {
    /// Caps of each unconnected sink pad.
    pub sink_pads: Vec<Caps>,
    /// Caps of each unconnected source pad.
    pub src_pads: Vec<Caps>,
}

/// Parses builder descriptions without instantiating them.
pub trait ProfileInspector: Send + Sync {
    fn inspect_profile(&self, description: &str) -> Result<ProfileShape, ProfileError>;
}

/// What a codec bin is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinSource {
    /// A textual description supplied with the codec preferences.
    Profile(String),
    /// A chain of element factories, in link order.
    Factories(Vec<String>),
}

/// Decision for a packet from an SSRC the decrypter has no keys for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptKeys {
    /// Decrypt with these parameters.
    Keys(SrtpParams),
    /// Let packets through unencrypted.
    PassThrough,
    /// Drop packets.
    Drop,
}

/// Pipeline operations used by a session.
///
/// Implementations are called with the session lock held and must not call
/// back into the session.
pub trait MediaGraph: ProfileInspector {
    /// Block data on the send tee source pad.
    fn block_send(&self) -> Result<(), GraphError>;

    /// Release the block placed by [`MediaGraph::block_send`].
    fn unblock_send(&self);

    /// Build a send codec bin between the send tee and the RTP muxer.
    /// Returns the caps of each source pad, the first being the main one.
    fn build_send_bin(&self, id: BinId, source: &BinSource, codec: &Codec) -> Result<Vec<Caps>, GraphError>;

    /// Quiesce and free a send codec bin.
    fn remove_send_bin(&self, id: BinId);

    /// Filter an additional source pad of a send bin to `caps` and link it to
    /// the muxer.
    fn add_capsfilter(&self, bin: BinId, pad: usize, caps: &Caps) -> Result<BinId, GraphError>;

    fn remove_capsfilter(&self, id: BinId);

    /// Build a receive bin for one substream. Returns the caps it produces.
    fn build_recv_bin(
        &self,
        id: BinId,
        ssrc: Ssrc,
        pt: Pt,
        source: &BinSource,
        codec: &Codec,
    ) -> Result<Caps, GraphError>;

    fn remove_recv_bin(&self, id: BinId);

    /// Open or close the valve in front of the send path.
    fn set_send_valve(&self, open: bool);

    /// Push a DTMF event upstream from the muxer sink. Returns false if no
    /// element took it.
    fn send_dtmf_event(&self, event: &DtmfEvent) -> bool;

    /// Build a special source of the named kind and link it to the muxer.
    fn add_special_source(&self, id: BinId, kind: &str, codec: &Codec) -> Result<(), GraphError>;

    /// Unlink and free a special source. May block.
    fn stop_special_source(&self, id: BinId);

    /// Start the side pipeline discovering configuration for `codec`.
    fn start_discovery(&self, id: BinId, source: &BinSource, codec: &Codec) -> Result<(), GraphError>;

    fn stop_discovery(&self, id: BinId);

    /// Tell the RTP session its PT to caps map is stale.
    fn clear_pt_map(&self);

    /// Send a key unit request upstream of the encoder.
    fn request_keyunit(&self, all_headers: bool);

    /// Stop the encoders of a send bin from producing key frames on their
    /// own schedule.
    fn disable_periodic_keyframes(&self, bin: BinId);

    fn set_send_bitrate(&self, bps: u32);

    /// Limit the raw media entering the send path, ahead of the encoder.
    fn restrict_send_caps(&self, caps: &Caps);

    fn set_rtcp_interval(&self, ms: u32);

    /// Configure the encrypter. `None` disables encryption.
    fn set_encryption(&self, params: Option<&SrtpParams>);

    /// Drop cached decryption keys so the decrypter asks again.
    fn clear_decryption_keys(&self, ssrcs: &[Ssrc]);

    /// Whether the calling thread is one of the framework's streaming
    /// threads.
    fn is_streaming_thread(&self) -> bool {
        false
    }
}
