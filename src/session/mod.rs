//! The session controller.
//!
//! A session owns the codec association table, the send path and the
//! substreams of one media type. Streams attach to it, one per remote.
//!
//! Calls from the application take effect under the session lock. Anything
//! the media framework reports from its own threads, and every
//! reconfiguration done under a pad block, is queued and handled by
//! [`Session::process_pending`], in order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::assoc::AssociationTable;
use crate::bitrate::BitrateAdapter;
use crate::blueprint::{Blueprint, BlueprintRegistry};
use crate::bus::{Bus, ErrorSource, Event};
use crate::codec::{codecs_list_has_codec_config_changed, sdp_negotiate_codec};
use crate::codec::{codec_has_config_data_named, Caps, Codec, MediaType, ParamType};
use crate::config::SessionConfig;
use crate::dir::Direction;
use crate::dtmf::{DtmfEvent, DtmfQueue};
use crate::error::{ConfError, ErrorKind};
use crate::graph::{DecryptKeys, MediaGraph};
use crate::hdrext::{create_local_header_extensions, finish_header_extensions};
use crate::hdrext::{negotiate_stream_header_extensions, HeaderExtension};
use crate::id::{BinId, Pt, Ssrc, StreamId};
use crate::keyunit::{KeyUnitFeedback, KeyUnitManager};
use crate::nego::{create_local_codec_associations, finish_codec_negotiation};
use crate::nego::{negotiate_stream_codecs, validate_codecs_configuration, CodecPreference};
use crate::participant::Participant;
use crate::special::SpecialSources;
use crate::srtp::{EncryptionParameters, SrtpParams};
use crate::stream::{Stream, StreamShared};
use crate::substream::Dispatcher;
use crate::tfrc::{self, TfrcController, TfrcReport};
use crate::util::Pii;

mod discovery;
use discovery::Discovery;

mod recv;

mod send;
use send::SendState;

/// RTCP interval when no codec asks for a shorter one, in milliseconds.
const DEFAULT_RTCP_INTERVAL: u32 = 5000;

/// Messages posted by elements the session spliced into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementMessage {
    /// A telephony event was played.
    DtmfProcessed(DtmfEvent),
    /// A telephony event could not be played.
    DtmfDropped(DtmfEvent),
}

/// Work handed over from framework threads.
#[derive(Debug)]
enum Work {
    /// The send path is blocked and may be rebuilt.
    SendBlocked,
    /// The discovery path is blocked and may be rebuilt.
    DiscoveryBlocked,
    DiscoveryCaps { bin: BinId, caps: Caps },
    SendCaps(Caps),
    NewRecvPad { ssrc: Ssrc, pt: Pt, now: Instant },
    SsrcCname { ssrc: Ssrc, cname: String },
    Bye(Ssrc),
    ElementMessage { src: BinId, msg: ElementMessage },
}

/// Handle to a session. Cloning gives another handle to the same session.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use rtpconf::*;
/// # fn run(registry: &BlueprintRegistry, graph: Arc<dyn MediaGraph>, factory: Arc<dyn AgentFactory>) -> Result<(), ConfError> {
/// let session = Session::new(SessionConfig::new(MediaType::Audio), registry, graph)?;
/// let alice = Participant::new("alice@example.com", factory);
/// let stream = session.new_stream(&alice, Direction::SendRecv)?;
///
/// // Codecs from the remote's offer.
/// stream.set_remote_codecs(vec![Codec::new(0, "PCMU", MediaType::Audio, 8000)])?;
///
/// // Rebuild the send path and drain notifications.
/// session.process_pending();
/// while let Some(event) = session.poll_event() {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session(Arc<SessionShared>);

pub(crate) struct SessionShared {
    id: u32,
    media_type: MediaType,
    blueprints: Arc<[Arc<Blueprint>]>,
    pub bus: Bus,
    pub keyunit: Arc<KeyUnitManager>,
    pub graph: Arc<dyn MediaGraph>,
    /// Flipped once by dispose. Every entry point holds a read guard.
    disposed: RwLock<bool>,
    state: Mutex<State>,
    work: Mutex<VecDeque<Work>>,
}

struct State {
    prefs: Vec<CodecPreference>,
    prefs_generation: u64,
    hdrext_prefs: Vec<HeaderExtension>,
    input_caps: Caps,
    output_caps: Caps,
    caps_generation: u64,

    table: AssociationTable,
    hdrext: Vec<HeaderExtension>,

    streams: Vec<Stream>,
    next_stream_id: u32,
    dispatcher: Dispatcher,
    /// Last codecs reported per stream with recv-codecs-changed.
    recv_codecs: HashMap<StreamId, Vec<Codec>>,

    send: SendState,
    /// Video only.
    adapter: Option<BitrateAdapter>,
    /// Video only.
    tfrc: Option<TfrcController>,
    special: SpecialSources,
    dtmf: DtmfQueue,
    discovery: Discovery,

    tos: u8,
    encryption: Option<SrtpParams>,
    rtcp_interval: Option<u32>,
    valve_open: bool,
}

impl State {
    fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id() == id)
    }

    fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.id()).collect()
    }
}

impl Session {
    /// Create a session.
    ///
    /// Blueprints for the media type are discovered through `registry` and
    /// a first codec table is negotiated from them.
    pub fn new(
        config: SessionConfig,
        registry: &BlueprintRegistry,
        graph: Arc<dyn MediaGraph>,
    ) -> Result<Session, ConfError> {
        let media_type = config.media_type();
        let special = SpecialSources::new(config.special_sources());

        let discovered = registry.discover(media_type);
        let blueprints: Arc<[Arc<Blueprint>]> = if config.auto_telephone_event() {
            special.add_blueprints(&discovered).into()
        } else {
            discovered
        };

        if blueprints.is_empty() {
            return Err(ConfError::construction(format!(
                "No codecs for media type {}",
                media_type
            )));
        }

        let state = State {
            prefs: vec![],
            prefs_generation: 0,
            hdrext_prefs: config.hdrext_preferences().to_vec(),
            input_caps: Caps::new_any(),
            output_caps: Caps::new_any(),
            caps_generation: 0,
            table: AssociationTable::new(),
            hdrext: vec![],
            streams: vec![],
            next_stream_id: 1,
            dispatcher: Dispatcher::new(config.no_rtcp_timeout()),
            recv_codecs: HashMap::new(),
            send: SendState::new(None),
            adapter: (media_type == MediaType::Video).then(BitrateAdapter::new),
            tfrc: (media_type == MediaType::Video).then(TfrcController::new),
            special,
            dtmf: DtmfQueue::new(),
            discovery: Discovery::default(),
            tos: config.tos(),
            encryption: None,
            rtcp_interval: None,
            valve_open: false,
        };

        let shared = Arc::new(SessionShared {
            id: config.id(),
            media_type,
            blueprints,
            bus: Bus::new(),
            keyunit: Arc::new(KeyUnitManager::new(graph.clone())),
            graph,
            disposed: RwLock::new(false),
            state: Mutex::new(state),
            work: Mutex::new(VecDeque::new()),
        });

        {
            let mut st = shared.state.lock();
            shared
                .update_codecs(&mut st, None)
                .map_err(|e| ConfError::construction(format!("Could not negotiate codecs: {}", e.message)))?;

            if let Some(bps) = config.send_bitrate() {
                shared.apply_bitrate(&mut st, bps, Instant::now());
            }
        }

        info!("Session {} created for {}", shared.id, media_type);

        Ok(Session(shared))
    }

    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub fn media_type(&self) -> MediaType {
        self.0.media_type
    }

    /// Set the codecs the application prefers, in order.
    ///
    /// Preferences that can not be used are dropped. If the remaining ones
    /// leave no usable codec, nothing changes.
    pub fn set_codec_preferences(&self, prefs: Vec<Codec>) -> Result<(), ConfError> {
        let _gate = self.0.enter()?;
        let mut st = self.0.state.lock();

        let validated = validate_codecs_configuration(
            self.0.media_type,
            &self.0.blueprints,
            &prefs,
            &*self.0.graph,
        );

        let old = std::mem::replace(&mut st.prefs, validated);
        st.prefs_generation += 1;
        let generation = st.prefs_generation;

        if let Err(e) = self.0.update_codecs(&mut st, None) {
            debug!("Codec preferences rejected: {}", e);
            if st.prefs_generation == generation {
                st.prefs = old;
            }
            return Err(e);
        }

        Ok(())
    }

    /// The preferences in effect, as validated.
    pub fn codec_preferences(&self) -> Vec<Codec> {
        self.0.state.lock().prefs.iter().map(|p| p.codec.clone()).collect()
    }

    /// Codecs to offer, with configuration data. `None` until the
    /// configuration of every codec that needs one is known.
    pub fn codecs(&self) -> Option<Vec<Codec>> {
        let st = self.0.state.lock();
        if st.table.needs_config() {
            return None;
        }
        Some(st.table.to_codec_list(true))
    }

    /// Codecs to offer, without configuration data.
    pub fn codecs_without_config(&self) -> Vec<Codec> {
        self.0.state.lock().table.to_codec_list(false)
    }

    /// A copy of the current association table.
    pub fn codec_associations(&self) -> AssociationTable {
        self.0.state.lock().table.clone()
    }

    /// Negotiated RTP header extensions.
    pub fn rtp_header_extensions(&self) -> Vec<HeaderExtension> {
        self.0.state.lock().hdrext.clone()
    }

    /// Codecs of `new` that have to be sent to the remote again because
    /// their configuration changed since `old`.
    pub fn codecs_need_resend(old: &[Codec], new: &[Codec]) -> Vec<Codec> {
        codecs_list_has_codec_config_changed(old, new)
    }

    pub fn current_send_codec(&self) -> Option<Codec> {
        self.0.state.lock().send.current.clone()
    }

    /// Ask for a specific send codec. It must be in the codec list.
    pub fn set_send_codec(&self, codec: &Codec) -> Result<(), ConfError> {
        let _gate = self.0.enter()?;
        let mut st = self.0.state.lock();

        if st.table.lookup_by_codec_for_sending(codec).is_none() {
            return Err(ConfError::invalid(
                "The passed codec is not part of the list of codecs",
            ));
        }

        debug!("Requested send codec {}", codec);
        st.send.requested = Some(codec.clone());
        self.0.verify_send_codec_bin(&mut st);

        Ok(())
    }

    /// Restrict the raw media the send path consumes and the receive path
    /// produces. `None` keeps the current value.
    pub fn set_allowed_caps(&self, input: Option<Caps>, output: Option<Caps>) -> Result<(), ConfError> {
        let _gate = self.0.enter()?;
        let mut st = self.0.state.lock();

        let old_input = st.input_caps.clone();
        let old_output = st.output_caps.clone();

        if let Some(c) = input {
            st.input_caps = c;
        }
        if let Some(c) = output {
            st.output_caps = c;
        }
        st.caps_generation += 1;
        let generation = st.caps_generation;

        if let Err(e) = self.0.update_codecs(&mut st, None) {
            debug!("Allowed caps rejected: {}", e);
            if st.caps_generation == generation {
                st.input_caps = old_input;
                st.output_caps = old_output;
            }
            return Err(e);
        }

        if let Some(bps) = st.adapter.as_ref().and_then(|a| a.applied()) {
            self.0.restrict_send(&st, bps);
        }

        Ok(())
    }

    /// Raw caps the send path consumes and the receive path produces.
    pub fn allowed_caps(&self) -> (Caps, Caps) {
        let st = self.0.state.lock();
        (st.input_caps.clone(), st.output_caps.clone())
    }

    /// Encrypt what is sent. `None` sends in the clear.
    pub fn set_encryption_parameters(&self, params: Option<&EncryptionParameters>) -> Result<(), ConfError> {
        let _gate = self.0.enter()?;

        let params = params.map(SrtpParams::validate).transpose()?;

        let mut st = self.0.state.lock();
        self.0.graph.set_encryption(params.as_ref());
        debug!("Encryption {:?}", params);
        st.encryption = params;

        Ok(())
    }

    pub fn encryption(&self) -> Option<SrtpParams> {
        self.0.state.lock().encryption.clone()
    }

    /// Queue the start of telephony event `event`. Returns false if the
    /// previous event was not stopped.
    pub fn start_telephony_event(&self, event: u8, volume: u8) -> bool {
        let Ok(_gate) = self.0.enter() else {
            return false;
        };
        let mut st = self.0.state.lock();

        if !st.dtmf.start(event, volume) {
            return false;
        }
        self.0.deliver_dtmf(&mut st);
        true
    }

    /// Queue the stop of the running telephony event.
    pub fn stop_telephony_event(&self) -> bool {
        let Ok(_gate) = self.0.enter() else {
            return false;
        };
        let mut st = self.0.state.lock();

        if !st.dtmf.stop() {
            return false;
        }
        self.0.deliver_dtmf(&mut st);
        true
    }

    pub fn send_bitrate(&self) -> Option<u32> {
        self.0.state.lock().send.bitrate
    }

    /// Target bitrate of the encoder, in bits per second.
    ///
    /// Video sessions also limit the resolution and frame rate of what they
    /// send to what the bitrate carries.
    pub fn set_send_bitrate(&self, bps: u32) -> Result<(), ConfError> {
        let _gate = self.0.enter()?;
        let mut st = self.0.state.lock();

        self.0.apply_bitrate(&mut st, bps, Instant::now());
        Ok(())
    }

    /// RTCP TFRC feedback for the SSRC we send with. The encoder bitrate
    /// follows the allowed sending rate.
    pub fn handle_tfrc_report(&self, local_ssrc: Ssrc, report: &TfrcReport, now: Instant) {
        let Ok(_gate) = self.0.enter() else {
            return;
        };
        let mut st = self.0.state.lock();

        let bitrate = st
            .tfrc
            .as_mut()
            .and_then(|t| t.handle_report(local_ssrc, report, now));

        if let Some(bps) = bitrate {
            self.0.apply_bitrate(&mut st, bps, now);
        }
    }

    /// An RTP packet of `size` bytes is about to be sent. Returns the id
    /// and payload of the rtt-sendts header extension to add to it, when
    /// rate control is in use.
    pub fn tfrc_outgoing_packet(&self, size: usize, now: Instant) -> Option<(u16, [u8; 7])> {
        let _gate = self.0.enter().ok()?;
        let mut st = self.0.state.lock();
        st.tfrc.as_mut()?.outgoing_packet(size, now)
    }

    pub fn tos(&self) -> u8 {
        self.0.tos()
    }

    /// IP type of service of everything sent. Applied to every transmitter.
    pub fn set_tos(&self, tos: u8) -> Result<(), ConfError> {
        let _gate = self.0.enter()?;

        let transmitters: Vec<_> = {
            let mut st = self.0.state.lock();
            st.tos = tos;
            st.streams
                .iter()
                .filter_map(|s| s.0.state.lock().transmitter.clone())
                .collect()
        };

        for t in transmitters {
            t.set_tos(tos);
        }
        Ok(())
    }

    /// Ask the encoder for a key unit. Requests closer together than
    /// [`crate::KEYUNIT_INTERVAL`] are folded into one.
    pub fn request_keyunit(&self, now: Instant) -> bool {
        if self.0.enter().is_err() {
            return false;
        }
        self.0.keyunit.request(now, true)
    }

    /// RTCP key unit feedback for the SSRC we send with.
    pub fn handle_key_unit_feedback(&self, local_ssrc: Ssrc, feedback: &KeyUnitFeedback) {
        if self.0.enter().is_err() {
            return;
        }
        self.0.keyunit.handle_feedback(local_ssrc, feedback);
    }

    /// Add a stream for `participant`.
    pub fn new_stream(&self, participant: &Participant, direction: Direction) -> Result<Stream, ConfError> {
        let _gate = self.0.enter()?;
        let mut st = self.0.state.lock();

        let id = StreamId::from(st.next_stream_id);
        st.next_stream_id += 1;

        let stream = Stream(Arc::new(StreamShared::new(
            id,
            self.0.media_type,
            Arc::downgrade(&self.0),
            participant.clone(),
            direction,
        )));

        st.streams.push(stream.clone());

        info!(
            "Session {} new stream {} for {:?} ({})",
            self.0.id,
            id,
            Pii(participant.cname()),
            direction
        );

        Ok(stream)
    }

    pub fn streams(&self) -> Vec<Stream> {
        self.0.state.lock().streams.clone()
    }

    /// The stream an SSRC belongs to.
    pub fn stream_by_ssrc(&self, ssrc: Ssrc) -> Option<Stream> {
        let st = self.0.state.lock();
        let id = st
            .dispatcher
            .stream_of(ssrc)
            .or_else(|| st.dispatcher.get(ssrc).and_then(|s| s.stream))?;
        st.stream(id).cloned()
    }

    /// Tear down the session. Every later call fails with
    /// [`ErrorKind::Disposed`].
    ///
    /// Must not be called from a streaming thread of the media framework.
    pub fn dispose(&self) -> Result<(), ConfError> {
        if self.0.graph.is_streaming_thread() {
            warn!("Session {} disposed from a streaming thread, ignoring", self.0.id);
            return Err(ConfError::invalid(
                "Can not dispose a session from a streaming thread",
            ));
        }

        {
            let mut disposed = self.0.disposed.write();
            if *disposed {
                return Ok(());
            }
            *disposed = true;
        }

        self.0.work.lock().clear();

        let streams = {
            let mut st = self.0.state.lock();

            self.0.stop_discovery(&mut st);

            if st.valve_open {
                self.0.graph.set_send_valve(false);
                st.valve_open = false;
            }
            self.0.remove_send_codec_bin(&mut st);

            let graph = self.0.graph.clone();
            st.special.destroy(&graph);

            for sub in st.dispatcher.clear() {
                if let Some(bin) = sub.bin {
                    self.0.graph.remove_recv_bin(bin);
                }
            }
            st.recv_codecs.clear();

            std::mem::take(&mut st.streams)
        };

        for s in streams {
            let transmitter = {
                let mut state = s.0.state.lock();
                state.destroyed = true;
                state.transmitter.take()
            };
            drop(transmitter);
        }

        info!("Session {} disposed", self.0.id);
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        *self.0.disposed.read()
    }

    /// Handle everything the framework queued. Returns the number of items
    /// handled.
    pub fn process_pending(&self) -> usize {
        let mut count = 0;

        loop {
            let Ok(_gate) = self.0.enter() else {
                self.0.work.lock().clear();
                break;
            };

            let Some(work) = self.0.work.lock().pop_front() else {
                break;
            };

            trace!("Handling {:?}", work);
            let mut st = self.0.state.lock();
            self.0.handle_work(&mut st, work);
            count += 1;
        }

        count
    }

    /// Next notification, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.0.bus.poll()
    }

    /// When [`Session::handle_timeout`] should be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let st = self.0.state.lock();
        [
            st.dispatcher.poll_timeout(),
            st.adapter.as_ref().and_then(|a| a.poll_timeout()),
            st.tfrc.as_ref().and_then(|t| t.poll_timeout()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Give substreams whose SDES wait expired to the only stream, and run
    /// the rate control timers.
    pub fn handle_timeout(&self, now: Instant) {
        let Ok(_gate) = self.0.enter() else {
            return;
        };
        let mut st = self.0.state.lock();

        let streams = st.stream_ids();
        for (ssrc, _) in st.dispatcher.handle_timeout(now, &streams) {
            self.0.refresh_substream(&mut st, ssrc);
        }

        if let Some(bps) = st.tfrc.as_mut().and_then(|t| t.handle_timeout(now)) {
            self.0.apply_bitrate(&mut st, bps, now);
        }

        if let Some(bps) = st.adapter.as_mut().and_then(|a| a.handle_timeout(now)) {
            self.0.restrict_send(&st, bps);
        }
    }

    /// The demultiplexer found a new SSRC or a new payload type for one.
    pub fn handle_new_recv_pad(&self, ssrc: Ssrc, pt: Pt, now: Instant) {
        self.0.queue(Work::NewRecvPad { ssrc, pt, now });
    }

    /// RTCP SDES bound `ssrc` to `cname`.
    pub fn handle_ssrc_cname(&self, ssrc: Ssrc, cname: &str) {
        self.0.queue(Work::SsrcCname {
            ssrc,
            cname: cname.to_string(),
        });
    }

    /// RTCP BYE from `ssrc`.
    pub fn handle_bye(&self, ssrc: Ssrc) {
        self.0.queue(Work::Bye(ssrc));
    }

    /// Caps produced by the encoder of the discovery path.
    pub fn handle_discovery_caps(&self, bin: BinId, caps: Caps) {
        self.0.queue(Work::DiscoveryCaps { bin, caps });
    }

    /// Caps produced by the encoder of the send path.
    pub fn handle_send_caps(&self, caps: Caps) {
        self.0.queue(Work::SendCaps(caps));
    }

    /// A message posted by element `src`.
    pub fn handle_element_message(&self, src: BinId, msg: ElementMessage) {
        self.0.queue(Work::ElementMessage { src, msg });
    }

    /// The decrypter has no keys for `ssrc`. Called from a streaming thread,
    /// answered right away.
    pub fn handle_request_key(&self, ssrc: Ssrc) -> DecryptKeys {
        let Ok(_gate) = self.0.enter() else {
            return DecryptKeys::Drop;
        };

        let stream = {
            let st = self.0.state.lock();
            st.dispatcher
                .stream_of(ssrc)
                .or_else(|| st.dispatcher.get(ssrc).and_then(|s| s.stream))
                .and_then(|id| st.stream(id).cloned())
        };

        match stream {
            Some(s) => s.0.decrypt_keys(),
            None => {
                debug!("Keys requested for unknown SSRC {}", ssrc);
                DecryptKeys::Drop
            }
        }
    }
}

impl SessionShared {
    /// Guard against dispose for the duration of a call.
    pub fn enter(&self) -> Result<RwLockReadGuard<'_, bool>, ConfError> {
        let guard = self.disposed.read_recursive();
        if *guard {
            return Err(ConfError::disposed());
        }
        Ok(guard)
    }

    pub fn tos(&self) -> u8 {
        self.state.lock().tos
    }

    fn queue(&self, work: Work) {
        if *self.disposed.read_recursive() {
            trace!("Dropping {:?} after dispose", work);
            return;
        }
        self.work.lock().push_back(work);
    }

    fn error(&self, source: ErrorSource, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!("Session {} error {}: {}", self.id, kind, message);
        self.bus.push(Event::error(source, kind, message));
    }

    fn handle_work(&self, st: &mut State, work: Work) {
        match work {
            Work::SendBlocked => self.handle_send_blocked(st),
            Work::DiscoveryBlocked => self.handle_discovery_blocked(st),
            Work::DiscoveryCaps { bin, caps } => self.handle_discovery_caps(st, bin, &caps),
            Work::SendCaps(caps) => self.handle_send_caps(st, &caps),
            Work::NewRecvPad { ssrc, pt, now } => self.handle_new_recv_pad(st, ssrc, pt, now),
            Work::SsrcCname { ssrc, cname } => self.handle_ssrc_cname(st, ssrc, &cname),
            Work::Bye(ssrc) => {
                if st.dispatcher.bye(ssrc) {
                    debug!("SSRC {} left", ssrc);
                }
            }
            Work::ElementMessage { src, msg } => self.handle_element_message(st, src, msg),
        }
    }

    fn handle_element_message(&self, st: &mut State, src: BinId, msg: ElementMessage) {
        let ours = st.special.claims(src) || st.send.bin.as_ref().map(|b| b.id) == Some(src);
        if !ours {
            warn!("Ignoring {:?} from a foreign source {}", msg, src);
            return;
        }

        let graph = &self.graph;
        let send = |ev: &DtmfEvent| graph.send_dtmf_event(ev);
        let mut events = vec![];

        match msg {
            ElementMessage::DtmfProcessed(ev) => st.dtmf.handle_processed(&ev, &send, &mut events),
            ElementMessage::DtmfDropped(ev) => st.dtmf.handle_dropped(&ev, &send, &mut events),
        }

        self.bus.extend(events);
    }

    fn deliver_dtmf(&self, st: &mut State) {
        if st.send.bin.is_none() {
            trace!("No send codec yet, telephony event stays queued");
            return;
        }

        let graph = &self.graph;
        let mut events = vec![];
        st.dtmf.deliver(&|ev| graph.send_dtmf_event(ev), &mut events);
        self.bus.extend(events);
    }

    /// Run a negotiation with `remote` replacing what `stream` offered, or
    /// with what every stream offered so far.
    pub fn update_remote_codecs(&self, stream: StreamId, remote: Option<Vec<Codec>>) -> Result<(), ConfError> {
        let mut st = self.state.lock();
        self.update_codecs(&mut st, remote.map(|r| (stream, r)))
    }

    fn negotiate(
        &self,
        st: &State,
        change: Option<(StreamId, &[Codec])>,
    ) -> Result<(AssociationTable, Vec<HeaderExtension>), ConfError> {
        let remotes: Vec<(Vec<Codec>, Vec<HeaderExtension>)> = st
            .streams
            .iter()
            .map(|s| {
                let state = s.0.state.lock();
                let codecs = match change {
                    Some((id, codecs)) if id == s.id() => codecs.to_vec(),
                    _ => state.remote_codecs.clone(),
                };
                (codecs, state.remote_hdrext.clone())
            })
            .filter(|(codecs, _)| !codecs.is_empty())
            .collect();

        let multi_stream = remotes.len() > 1;

        let mut table = create_local_codec_associations(
            &self.blueprints,
            &st.prefs,
            &st.table,
            &st.input_caps,
            &st.output_caps,
        )
        .map_err(|e| {
            debug!("Local codecs: {}", e);
            ConfError::new(e.kind, "Codec config would leave no valid local codecs")
        })?;

        let mut hdrext = create_local_header_extensions(&st.hdrext_prefs, &st.hdrext);

        for (codecs, exts) in &remotes {
            table = negotiate_stream_codecs(codecs, &table, multi_stream).map_err(|e| {
                debug!("Remote codecs: {}", e);
                ConfError::negotiation_failed(
                    "There was no intersection between the remote codecs and the local ones",
                )
            })?;
            hdrext = negotiate_stream_header_extensions(hdrext, exts, !multi_stream);
        }

        let table = finish_codec_negotiation(&st.table, table);
        let table = st.special.negotiation_filter(table);

        Ok(tfrc::filter_codecs(table, finish_header_extensions(hdrext)))
    }

    fn update_codecs(&self, st: &mut State, change: Option<(StreamId, Vec<Codec>)>) -> Result<(), ConfError> {
        let (table, hdrext) = self.negotiate(st, change.as_ref().map(|(id, c)| (*id, c.as_slice())))?;

        let is_new = !st.table.is_empty() && !st.table.equal(&table);

        if is_new {
            debug!("Session {} codecs now {:?}", self.id, table.to_codec_list(false));
        }

        st.table = table;
        st.hdrext = hdrext;

        if let Some(t) = st.tfrc.as_mut() {
            t.codecs_updated(&st.table, &st.hdrext);
        }

        if let Some((id, codecs)) = change {
            if let Some(s) = st.stream(id) {
                s.0.state.lock().remote_codecs = codecs;
            }
        }

        self.distribute_recv_codecs(st);
        self.verify_recv_codecs(st);

        if is_new {
            self.graph.clear_pt_map();
        }

        self.start_discovery(st);

        let has_remotes = st
            .streams
            .iter()
            .any(|s| !s.0.state.lock().remote_codecs.is_empty());
        if has_remotes {
            self.verify_send_codec_bin(st);
        }

        if is_new {
            self.bus.push(Event::CodecsChanged);
        }

        Ok(())
    }

    /// Give every stream its receive codecs, with configuration data taken
    /// from what its remote sent when it sent any.
    fn distribute_recv_codecs(&self, st: &State) {
        let local = st.table.to_codec_list(true);

        for s in &st.streams {
            let mut state = s.0.state.lock();

            let negotiated: Vec<Codec> = if state.remote_codecs.is_empty() {
                vec![]
            } else {
                local
                    .iter()
                    .map(|codec| {
                        let mut codec = codec.clone();
                        let remote = state.remote_codecs.iter().find(|r| {
                            r.pt() == codec.pt()
                                && sdp_negotiate_codec(
                                    &codec,
                                    ParamType::RECV,
                                    r,
                                    ParamType::RECV | ParamType::CONFIG,
                                )
                                .is_some()
                        });
                        if let Some(r) = remote {
                            for p in r.params() {
                                if codec_has_config_data_named(&codec, &p.name) {
                                    codec.set_param(&p.name, &p.value);
                                }
                            }
                        }
                        codec
                    })
                    .collect()
            };

            if state.negotiated_codecs != negotiated {
                trace!("Stream {} negotiated codecs {:?}", s.id(), negotiated);
                state.negotiated_codecs = negotiated;
            }
        }
    }

    /// A stream started or stopped sending.
    pub fn sending_changed(&self) {
        let mut st = self.state.lock();
        self.update_valve(&mut st);
    }

    /// Bind `ssrc` to `stream` and give it any waiting substream.
    pub fn add_ssrc_stream(&self, ssrc: Ssrc, stream: StreamId, manual: bool) {
        let mut st = self.state.lock();
        for moved in st.dispatcher.add_ssrc_stream(ssrc, stream, manual) {
            self.refresh_substream(&mut st, moved);
        }
    }

    /// Make the decrypter ask again for every SSRC of `stream`.
    pub fn decrypt_clear(&self, stream: StreamId) {
        let ssrcs = self.state.lock().dispatcher.ssrcs_of(stream);
        if !ssrcs.is_empty() {
            self.graph.clear_decryption_keys(&ssrcs);
        }
    }

    /// A stream was destroyed.
    pub fn remove_stream(&self, id: StreamId) {
        let Ok(_gate) = self.enter() else {
            return;
        };
        let mut st = self.state.lock();

        st.streams.retain(|s| s.id() != id);
        for sub in st.dispatcher.remove_stream(id) {
            if let Some(bin) = sub.bin {
                self.graph.remove_recv_bin(bin);
            }
        }
        st.recv_codecs.remove(&id);

        self.update_valve(&mut st);
        self.update_rtcp_interval(&mut st);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("media_type", &self.0.media_type)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
