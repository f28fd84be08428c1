//! One remote peer of a session.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::codec::{Codec, CodecId, MediaType};
use crate::config::IceConfig;
use crate::dir::Direction;
use crate::error::{ConfError, ErrorKind};
use crate::graph::DecryptKeys;
use crate::hdrext::HeaderExtension;
use crate::ice::{Candidate, IceBinding, IceCreds};
use crate::id::{ComponentId, Pt, Ssrc, StreamId};
use crate::participant::Participant;
use crate::session::SessionShared;
use crate::srtp::{EncryptionParameters, SrtpParams};

/// Handle to a stream. Cloning gives another handle to the same stream.
///
/// The session holds its streams. A stream only refers back to its session
/// weakly, so every call on a stream whose session is gone fails with
/// [`ErrorKind::Disposed`].
#[derive(Clone)]
pub struct Stream(pub(crate) Arc<StreamShared>);

pub(crate) struct StreamShared {
    pub id: StreamId,
    pub media_type: MediaType,
    pub session: Weak<SessionShared>,
    pub participant: Participant,
    pub state: Mutex<StreamState>,
}

pub(crate) struct StreamState {
    pub direction: Direction,
    /// What the remote offered, as last accepted.
    pub remote_codecs: Vec<Codec>,
    /// Receive codecs with the configuration the remote gave.
    pub negotiated_codecs: Vec<Codec>,
    pub remote_hdrext: Vec<HeaderExtension>,
    pub decryption: Option<SrtpParams>,
    pub require_encryption: bool,
    pub transmitter: Option<Arc<IceBinding>>,
    pub destroyed: bool,
}

impl StreamShared {
    pub fn new(id: StreamId, media_type: MediaType, session: Weak<SessionShared>, participant: Participant, direction: Direction) -> Self {
        StreamShared {
            id,
            media_type,
            session,
            participant,
            state: Mutex::new(StreamState {
                direction,
                remote_codecs: vec![],
                negotiated_codecs: vec![],
                remote_hdrext: vec![],
                decryption: None,
                require_encryption: false,
                transmitter: None,
                destroyed: false,
            }),
        }
    }

    fn session(&self) -> Result<Arc<SessionShared>, ConfError> {
        if self.state.lock().destroyed {
            return Err(ConfError::disposed());
        }
        self.session.upgrade().ok_or_else(ConfError::disposed)
    }

    /// Whether the stream sends and has somewhere to send to.
    pub fn is_sending(&self) -> bool {
        let state = self.state.lock();
        state.direction.is_sending() && state.transmitter.is_some()
    }

    /// Negotiated receive codec at `pt`, if the remote gave one.
    pub fn negotiated_codec(&self, pt: Pt) -> Option<Codec> {
        self.state
            .lock()
            .negotiated_codecs
            .iter()
            .find(|c| c.pt() == Some(pt))
            .cloned()
    }

    /// Keys for an SSRC of this stream the decrypter asks about.
    pub fn decrypt_keys(&self) -> DecryptKeys {
        let state = self.state.lock();
        match (&state.decryption, state.require_encryption) {
            (Some(p), _) => DecryptKeys::Keys(p.clone()),
            (None, true) => DecryptKeys::Drop,
            (None, false) => DecryptKeys::PassThrough,
        }
    }
}

fn validate_remote_codecs(codecs: &[Codec], media_type: MediaType) -> Result<(), ConfError> {
    if codecs.is_empty() {
        return Err(ConfError::invalid("You can not set NULL remote codecs"));
    }

    for c in codecs {
        if c.encoding_name.is_empty() {
            return Err(ConfError::invalid("The codec must have an encoding name"));
        }
        let valid_pt = match c.id {
            CodecId::Pt(pt) => pt.is_valid(),
            _ => false,
        };
        if !valid_pt {
            return Err(ConfError::invalid(format!(
                "The codec id must be between 0 and 127 for {}",
                c.encoding_name
            )));
        }
        if c.media_type != media_type {
            return Err(ConfError::invalid(format!(
                "The media type for codec {} is not {}",
                c.encoding_name, media_type
            )));
        }
    }

    Ok(())
}

impl Stream {
    pub fn id(&self) -> StreamId {
        self.0.id
    }

    pub fn participant(&self) -> &Participant {
        &self.0.participant
    }

    pub fn direction(&self) -> Direction {
        self.0.state.lock().direction
    }

    /// Change the direction. The session opens or closes its send path to
    /// match.
    pub fn set_direction(&self, direction: Direction) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        let changed = {
            let mut state = self.0.state.lock();
            let was = state.direction;
            state.direction = direction;
            was.is_sending() != direction.is_sending()
        };

        debug!("Stream {} direction {}", self.0.id, direction);

        if changed {
            session.sending_changed();
        }
        Ok(())
    }

    pub fn remote_codecs(&self) -> Vec<Codec> {
        self.0.state.lock().remote_codecs.clone()
    }

    /// Receive codecs as negotiated with this remote. Configuration
    /// parameters are the remote's.
    pub fn negotiated_codecs(&self) -> Vec<Codec> {
        self.0.state.lock().negotiated_codecs.clone()
    }

    /// Give the codecs the remote offered.
    ///
    /// The session renegotiates. On failure nothing changes.
    pub fn set_remote_codecs(&self, codecs: Vec<Codec>) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        validate_remote_codecs(&codecs, self.0.media_type)?;

        session.update_remote_codecs(self.0.id, Some(codecs))
    }

    pub fn rtp_header_extensions(&self) -> Vec<HeaderExtension> {
        self.0.state.lock().remote_hdrext.clone()
    }

    /// RTP header extensions the remote announced. Renegotiates, and keeps
    /// the previous extensions if that fails.
    pub fn set_rtp_header_extensions(&self, hdrext: Vec<HeaderExtension>) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        let old = std::mem::replace(&mut self.0.state.lock().remote_hdrext, hdrext);

        if let Err(e) = session.update_remote_codecs(self.0.id, None) {
            debug!("Renegotiation after header extension change failed: {}", e);
            self.0.state.lock().remote_hdrext = old;
            return Err(e);
        }
        Ok(())
    }

    /// Bind an SSRC to this stream without waiting for an SDES.
    pub fn add_id(&self, ssrc: Ssrc) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        session.add_ssrc_stream(ssrc, self.0.id, true);
        Ok(())
    }

    /// Attach an ICE transmitter and start gathering.
    pub fn set_transmitter(&self, config: IceConfig) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        if self.0.state.lock().transmitter.is_some() {
            return Err(ConfError::new(
                ErrorKind::AlreadyExists,
                "Stream transmitter already set",
            ));
        }

        let binding = IceBinding::new(
            self.0.id,
            &config,
            self.0.participant.agents(),
            self.0.participant.agent_factory(),
            session.bus.clone(),
            session.keyunit.clone(),
            session.tos(),
        )?;

        {
            let mut state = self.0.state.lock();
            if state.transmitter.is_some() {
                return Err(ConfError::new(
                    ErrorKind::AlreadyExists,
                    "Stream transmitter already set",
                ));
            }
            state.transmitter = Some(binding.clone());
        }

        info!("Stream {} has transmitter on agent stream {}", self.0.id, binding.agent_stream_id());

        binding.gather()?;
        session.sending_changed();

        Ok(())
    }

    fn transmitter(&self) -> Result<Arc<IceBinding>, ConfError> {
        self.0
            .state
            .lock()
            .transmitter
            .clone()
            .ok_or_else(|| ConfError::invalid("Stream has no transmitter"))
    }

    /// Add remote candidates. `None` restarts ICE.
    pub fn set_remote_candidates(&self, candidates: Option<Vec<Candidate>>) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        self.transmitter()?.set_remote_candidates(candidates)?;
        Ok(())
    }

    /// Skip connectivity checks and use one remote candidate per component.
    pub fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        self.transmitter()?.force_remote_candidates(candidates)?;
        Ok(())
    }

    pub fn local_credentials(&self) -> Option<IceCreds> {
        self.transmitter().ok()?.local_credentials()
    }

    /// Local and remote candidate of the pair in use for `component`.
    pub fn selected_pair(&self, component: ComponentId) -> Option<(Candidate, Candidate)> {
        self.transmitter().ok()?.selected_pair(component)
    }

    /// Parameters for decrypting what this remote sends. `None` turns
    /// decryption off.
    pub fn set_decryption_parameters(&self, params: Option<&EncryptionParameters>) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        let params = params.map(SrtpParams::validate).transpose()?;

        let changed = {
            let mut state = self.0.state.lock();
            let changed = state.decryption != params;
            state.decryption = params;
            changed
        };

        // Keys are stored first, the framework asks again right away.
        if changed {
            session.decrypt_clear(self.0.id);
        }
        Ok(())
    }

    pub fn require_encryption(&self) -> bool {
        self.0.state.lock().require_encryption
    }

    /// Drop packets from SSRCs that have no keys instead of letting them
    /// through.
    pub fn set_require_encryption(&self, require: bool) -> Result<(), ConfError> {
        let session = self.0.session()?;
        let _gate = session.enter()?;

        let changed = {
            let mut state = self.0.state.lock();
            let changed = state.require_encryption != require;
            state.require_encryption = require;
            changed
        };

        if changed {
            session.decrypt_clear(self.0.id);
        }
        Ok(())
    }

    /// Remove the stream from its session.
    ///
    /// Must not be called from a streaming thread of the media framework.
    pub fn destroy(&self) -> Result<(), ConfError> {
        let Some(session) = self.0.session.upgrade() else {
            self.0.state.lock().destroyed = true;
            return Ok(());
        };

        if session.graph.is_streaming_thread() {
            warn!("Stream {} destroyed from a streaming thread, ignoring", self.0.id);
            return Err(ConfError::invalid("Can not destroy a stream from a streaming thread"));
        }

        let transmitter = {
            let mut state = self.0.state.lock();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            state.transmitter.take()
        };

        // Removes the agent stream.
        drop(transmitter);

        session.remove_stream(self.0.id);
        debug!("Stream {} destroyed", self.0.id);
        Ok(())
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("Stream")
            .field("id", &self.0.id)
            .field("cname", &self.0.participant.cname())
            .field("direction", &state.direction)
            .field("remote_codecs", &state.remote_codecs.len())
            .finish()
    }
}
