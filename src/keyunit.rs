//! Key unit requests towards the send encoder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec::Codec;
use crate::graph::MediaGraph;
use crate::id::{BinId, Ssrc};

/// Requests closer together than this are folded into one.
pub const KEYUNIT_INTERVAL: Duration = Duration::from_millis(500);

/// Payload specific feedback asking for a key unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyUnitFeedback {
    /// Picture loss indication for one media SSRC.
    Pli { media_ssrc: Ssrc },
    /// Full intra request, one entry per requested SSRC.
    Fir { ssrcs: Vec<Ssrc> },
}

impl KeyUnitFeedback {
    fn is_for(&self, local: Ssrc) -> bool {
        match self {
            KeyUnitFeedback::Pli { media_ssrc } => *media_ssrc == local,
            KeyUnitFeedback::Fir { ssrcs } => ssrcs.contains(&local),
        }
    }
}

/// Whether the peer asks for key units itself.
pub(crate) fn has_key_request_feedback(send_codec: &Codec) -> bool {
    send_codec
        .feedback()
        .iter()
        .any(|f| f.kind.eq_ignore_ascii_case("nack") && f.subtype.eq_ignore_ascii_case("pli"))
}

/// Coalesces key unit requests and switches off periodic key frames once the
/// peer shows it asks for them.
pub(crate) struct KeyUnitManager {
    graph: Arc<dyn MediaGraph>,
    inner: Mutex<Inner>,
}

struct Inner {
    last_request: Option<Instant>,
    /// Send bin whose periodic key frames go away on the first request.
    armed: Option<BinId>,
}

impl KeyUnitManager {
    pub fn new(graph: Arc<dyn MediaGraph>) -> Self {
        KeyUnitManager {
            graph,
            inner: Mutex::new(Inner {
                last_request: None,
                armed: None,
            }),
        }
    }

    /// Ask the encoder for a key unit. Returns false if a request went out
    /// less than [`KEYUNIT_INTERVAL`] ago.
    pub fn request(&self, now: Instant, all_headers: bool) -> bool {
        {
            let mut inner = self.inner.lock();
            if let Some(last) = inner.last_request {
                if now.saturating_duration_since(last) < KEYUNIT_INTERVAL {
                    trace!("Key unit request folded");
                    return false;
                }
            }
            inner.last_request = Some(now);
        }

        debug!("Requesting key unit (all_headers: {})", all_headers);
        self.graph.request_keyunit(all_headers);
        true
    }

    /// The send bin changed.
    pub fn codec_bin_changed(&self, bin: BinId, send_codec: &Codec) {
        let mut inner = self.inner.lock();
        inner.armed = has_key_request_feedback(send_codec).then_some(bin);
    }

    pub fn codec_bin_removed(&self) {
        self.inner.lock().armed = None;
    }

    /// RTCP feedback received. The first request addressed to `local_ssrc`
    /// disables periodic key frames.
    pub fn handle_feedback(&self, local_ssrc: Ssrc, feedback: &KeyUnitFeedback) {
        if !feedback.is_for(local_ssrc) {
            return;
        }

        let bin = self.inner.lock().armed.take();

        if let Some(bin) = bin {
            debug!("Peer requests key units, disabling periodic key frames");
            self.graph.disable_periodic_keyframes(bin);
        }
    }
}
