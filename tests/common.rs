#![allow(unused)]
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Instant;

use parking_lot::Mutex;
use rtpconf::codec::CapsError;
use rtpconf::ice::{AgentCandidate, AgentEvent, CandidateKind, ComponentState};
use rtpconf::ice::{IceCreds, IceError, RelayInfo, Transport};
use rtpconf::*;
use tracing::info_span;
use tracing::Span;

pub fn caps(s: &str) -> Caps {
    s.parse().unwrap()
}

/// Installed element factories of a test "framework".
pub struct TestRegistry(pub Vec<ElementFactory>);

impl ElementRegistry for TestRegistry {
    fn factories(&self) -> Vec<ElementFactory> {
        self.0.clone()
    }
}

impl TestRegistry {
    fn factory(&self, name: &str) -> Option<&ElementFactory> {
        self.0.iter().find(|f| f.name == name)
    }
}

pub fn audio_registry() -> Arc<TestRegistry> {
    use FactoryKind::*;

    let pcmu = "application/x-rtp, media=audio, payload=0, clock-rate=8000, encoding-name=PCMU";
    let pcma = "application/x-rtp, media=audio, payload=8, clock-rate=8000, encoding-name=PCMA";
    let opus = "application/x-rtp, media=audio, clock-rate=48000, encoding-name=OPUS";
    let vorbis = "application/x-rtp, media=audio, clock-rate=[ 1, 2147483647 ], encoding-name=VORBIS";
    let dtmf = "application/x-rtp, media=audio, payload=[ 96, 127 ], clock-rate=[ 1, 2147483647 ], \
                encoding-name=TELEPHONE-EVENT";

    let raw = "audio/x-raw";
    let opus_raw = "audio/x-raw, rate=[ 8000, 48000 ], channels=[ 1, 2 ]";

    Arc::new(TestRegistry(vec![
        ElementFactory::new("mulawenc", Encoder, 256, caps(raw), caps("audio/x-mulaw")),
        ElementFactory::new("mulawdec", Decoder, 256, caps("audio/x-mulaw"), caps(raw)),
        ElementFactory::new("rtppcmupay", Payloader, 256, caps("audio/x-mulaw"), caps(pcmu)),
        ElementFactory::new("rtppcmudepay", Depayloader, 256, caps(pcmu), caps("audio/x-mulaw")),
        ElementFactory::new("alawenc", Encoder, 256, caps(raw), caps("audio/x-alaw")),
        ElementFactory::new("alawdec", Decoder, 256, caps("audio/x-alaw"), caps(raw)),
        ElementFactory::new("rtppcmapay", Payloader, 256, caps("audio/x-alaw"), caps(pcma)),
        ElementFactory::new("rtppcmadepay", Depayloader, 256, caps(pcma), caps("audio/x-alaw")),
        ElementFactory::new("opusenc", Encoder, 256, caps(opus_raw), caps("audio/x-opus")),
        ElementFactory::new("opusdec", Decoder, 256, caps("audio/x-opus"), caps(opus_raw)),
        ElementFactory::new("rtpopuspay", Payloader, 256, caps("audio/x-opus"), caps(opus)),
        ElementFactory::new("rtpopusdepay", Depayloader, 256, caps(opus), caps("audio/x-opus")),
        ElementFactory::new("vorbisenc", Encoder, 256, caps(raw), caps("audio/x-vorbis")),
        ElementFactory::new("vorbisdec", Decoder, 256, caps("audio/x-vorbis"), caps(raw)),
        ElementFactory::new("rtpvorbispay", Payloader, 256, caps("audio/x-vorbis"), caps(vorbis)),
        ElementFactory::new("rtpvorbisdepay", Depayloader, 256, caps(vorbis), caps("audio/x-vorbis")),
        ElementFactory::new("rtpdtmfdepay", Depayloader, 256, caps(dtmf), caps(raw)),
    ]))
}

pub fn video_registry() -> Arc<TestRegistry> {
    use FactoryKind::*;

    let vp8 = "application/x-rtp, media=video, clock-rate=90000, encoding-name=VP8";
    let raw = "video/x-raw";

    Arc::new(TestRegistry(vec![
        ElementFactory::new("vp8enc", Encoder, 256, caps(raw), caps("video/x-vp8")),
        ElementFactory::new("vp8dec", Decoder, 256, caps("video/x-vp8"), caps(raw)),
        ElementFactory::new("rtpvp8pay", Payloader, 256, caps("video/x-vp8"), caps(vp8)),
        ElementFactory::new("rtpvp8depay", Depayloader, 256, caps(vp8), caps("video/x-vp8")),
    ]))
}

/// What the session asked the graph to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    BlockSend,
    UnblockSend,
    BuildSend { id: BinId, source: BinSource, codec: Codec },
    RemoveSend(BinId),
    AddCapsfilter { bin: BinId, pad: usize, caps: Caps },
    RemoveCapsfilter(BinId),
    BuildRecv { id: BinId, ssrc: Ssrc, pt: Pt, codec: Codec },
    RemoveRecv(BinId),
    Valve(bool),
    Dtmf(DtmfEvent),
    AddSpecial { id: BinId, kind: String, codec: Codec },
    StopSpecial(BinId),
    StartDiscovery { id: BinId, codec: Codec },
    StopDiscovery(BinId),
    ClearPtMap,
    KeyUnit,
    DisablePeriodicKeyframes(BinId),
    Bitrate(u32),
    RestrictSend(Caps),
    RtcpInterval(u32),
    Encryption(Option<SrtpParams>),
    ClearKeys(Vec<Ssrc>),
}

/// A graph that records calls and answers with caps derived from the
/// factories it is asked to build.
pub struct TestGraph {
    registry: Arc<TestRegistry>,
    calls: Mutex<Vec<Call>>,
    /// Refuse RFC 4733 events, as if no event source was linked.
    pub refuse_rfc4733: AtomicBool,
    /// Refuse to build send bins.
    pub fail_send: AtomicBool,
}

impl TestGraph {
    pub fn new(registry: Arc<TestRegistry>) -> Self {
        TestGraph {
            registry,
            calls: Mutex::new(vec![]),
            refuse_rfc4733: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn send_bins(&self) -> Vec<(BinId, Codec)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::BuildSend { id, codec, .. } => Some((*id, codec.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn special_sources(&self) -> Vec<(BinId, String, Codec)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::AddSpecial { id, kind, codec } => Some((*id, kind.clone(), codec.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn special_source(&self, kind: &str) -> Option<BinId> {
        self.special_sources()
            .into_iter()
            .rev()
            .find(|(_, k, _)| k == kind)
            .map(|(id, _, _)| id)
    }

    pub fn discoveries(&self) -> Vec<(BinId, Codec)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::StartDiscovery { id, codec } => Some((*id, codec.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn dtmf_events(&self) -> Vec<DtmfEvent> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Dtmf(e) => Some(*e),
                _ => None,
            })
            .collect()
    }

    pub fn valve(&self) -> Option<bool> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            Call::Valve(v) => Some(*v),
            _ => None,
        })
    }

    fn chain_src_caps(&self, source: &BinSource) -> Caps {
        match source {
            BinSource::Factories(chain) => chain
                .last()
                .and_then(|name| self.registry.factory(name))
                .map(|f| f.src_caps.clone())
                .unwrap_or_else(Caps::new_any),
            BinSource::Profile(_) => Caps::new_any(),
        }
    }
}

impl ProfileInspector for TestGraph {
    fn inspect_profile(&self, description: &str) -> Result<ProfileShape, ProfileError> {
        // "<sink caps> ! <src caps>"
        let Some((sink, src)) = description.split_once('!') else {
            return Err(ProfileError::Parse(description.to_string()));
        };
        let sink: Caps = sink
            .trim()
            .parse()
            .map_err(|e: CapsError| ProfileError::Parse(e.to_string()))?;
        let src: Caps = src
            .trim()
            .parse()
            .map_err(|e: CapsError| ProfileError::Parse(e.to_string()))?;
        Ok(ProfileShape {
            sink_pads: vec![sink],
            src_pads: vec![src],
        })
    }
}

impl MediaGraph for TestGraph {
    fn block_send(&self) -> Result<(), GraphError> {
        self.record(Call::BlockSend);
        Ok(())
    }

    fn unblock_send(&self) {
        self.record(Call::UnblockSend);
    }

    fn build_send_bin(&self, id: BinId, source: &BinSource, codec: &Codec) -> Result<Vec<Caps>, GraphError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(GraphError::Element("refused".into()));
        }
        self.record(Call::BuildSend {
            id,
            source: source.clone(),
            codec: codec.clone(),
        });
        Ok(vec![codec.to_rtp_caps()])
    }

    fn remove_send_bin(&self, id: BinId) {
        self.record(Call::RemoveSend(id));
    }

    fn add_capsfilter(&self, bin: BinId, pad: usize, caps: &Caps) -> Result<BinId, GraphError> {
        self.record(Call::AddCapsfilter {
            bin,
            pad,
            caps: caps.clone(),
        });
        Ok(BinId::next())
    }

    fn remove_capsfilter(&self, id: BinId) {
        self.record(Call::RemoveCapsfilter(id));
    }

    fn build_recv_bin(
        &self,
        id: BinId,
        ssrc: Ssrc,
        pt: Pt,
        source: &BinSource,
        codec: &Codec,
    ) -> Result<Caps, GraphError> {
        self.record(Call::BuildRecv {
            id,
            ssrc,
            pt,
            codec: codec.clone(),
        });
        Ok(self.chain_src_caps(source))
    }

    fn remove_recv_bin(&self, id: BinId) {
        self.record(Call::RemoveRecv(id));
    }

    fn set_send_valve(&self, open: bool) {
        self.record(Call::Valve(open));
    }

    fn send_dtmf_event(&self, event: &DtmfEvent) -> bool {
        if event.method == DtmfMethod::Rfc4733 && self.refuse_rfc4733.load(Ordering::SeqCst) {
            return false;
        }
        self.record(Call::Dtmf(*event));
        true
    }

    fn add_special_source(&self, id: BinId, kind: &str, codec: &Codec) -> Result<(), GraphError> {
        self.record(Call::AddSpecial {
            id,
            kind: kind.to_string(),
            codec: codec.clone(),
        });
        Ok(())
    }

    fn stop_special_source(&self, id: BinId) {
        self.record(Call::StopSpecial(id));
    }

    fn start_discovery(&self, id: BinId, _source: &BinSource, codec: &Codec) -> Result<(), GraphError> {
        self.record(Call::StartDiscovery {
            id,
            codec: codec.clone(),
        });
        Ok(())
    }

    fn stop_discovery(&self, id: BinId) {
        self.record(Call::StopDiscovery(id));
    }

    fn clear_pt_map(&self) {
        self.record(Call::ClearPtMap);
    }

    fn request_keyunit(&self, _all_headers: bool) {
        self.record(Call::KeyUnit);
    }

    fn disable_periodic_keyframes(&self, bin: BinId) {
        self.record(Call::DisablePeriodicKeyframes(bin));
    }

    fn set_send_bitrate(&self, bps: u32) {
        self.record(Call::Bitrate(bps));
    }

    fn restrict_send_caps(&self, caps: &Caps) {
        self.record(Call::RestrictSend(caps.clone()));
    }

    fn set_rtcp_interval(&self, ms: u32) {
        self.record(Call::RtcpInterval(ms));
    }

    fn set_encryption(&self, params: Option<&SrtpParams>) {
        self.record(Call::Encryption(params.cloned()));
    }

    fn clear_decryption_keys(&self, ssrcs: &[Ssrc]) {
        self.record(Call::ClearKeys(ssrcs.to_vec()));
    }
}

#[derive(Default)]
struct AgentInner {
    next_stream: u32,
    streams: Vec<AgentStreamId>,
    generation: u32,
    remote: Vec<AgentCandidate>,
    remote_creds: Option<IceCreds>,
    selected: Vec<AgentCandidate>,
    restarts: u32,
    tos: u8,
}

/// An ICE agent that does nothing on its own. Tests drive it by feeding
/// [`AgentEvent`]s through the participant.
#[derive(Default)]
pub struct TestAgent {
    inner: Mutex<AgentInner>,
}

impl TestAgent {
    pub fn restarts(&self) -> u32 {
        self.inner.lock().restarts
    }

    pub fn remote_candidates(&self) -> Vec<AgentCandidate> {
        self.inner.lock().remote.clone()
    }

    pub fn remote_creds(&self) -> Option<IceCreds> {
        self.inner.lock().remote_creds.clone()
    }

    pub fn selected(&self) -> Vec<AgentCandidate> {
        self.inner.lock().selected.clone()
    }

    pub fn streams(&self) -> Vec<AgentStreamId> {
        self.inner.lock().streams.clone()
    }

    pub fn tos(&self) -> u8 {
        self.inner.lock().tos
    }
}

impl IceAgent for TestAgent {
    fn add_stream(&self, _components: u16) -> Option<AgentStreamId> {
        let mut inner = self.inner.lock();
        inner.next_stream += 1;
        let id = AgentStreamId::from(inner.next_stream);
        inner.streams.push(id);
        Some(id)
    }

    fn remove_stream(&self, stream: AgentStreamId) {
        self.inner.lock().streams.retain(|s| *s != stream);
    }

    fn set_relay_info(&self, _stream: AgentStreamId, _component: ComponentId, _relay: &RelayInfo) -> bool {
        true
    }

    fn gather_candidates(&self, _stream: AgentStreamId) -> bool {
        true
    }

    fn set_remote_candidates(
        &self,
        _stream: AgentStreamId,
        _component: ComponentId,
        candidates: &[AgentCandidate],
    ) -> usize {
        self.inner.lock().remote.extend(candidates.iter().cloned());
        candidates.len()
    }

    fn set_selected_remote_candidate(
        &self,
        _stream: AgentStreamId,
        _component: ComponentId,
        candidate: &AgentCandidate,
    ) -> bool {
        self.inner.lock().selected.push(candidate.clone());
        true
    }

    fn set_remote_credentials(&self, _stream: AgentStreamId, creds: &IceCreds) -> bool {
        self.inner.lock().remote_creds = Some(creds.clone());
        true
    }

    fn local_credentials(&self, stream: AgentStreamId) -> Option<IceCreds> {
        let inner = self.inner.lock();
        if !inner.streams.contains(&stream) {
            return None;
        }
        Some(IceCreds {
            ufrag: format!("ufrag{}g{}", stream, inner.generation),
            pass: format!("pass{}g{}", stream, inner.generation),
        })
    }

    fn set_port_range(&self, _stream: AgentStreamId, _component: ComponentId, _min: u16, _max: u16) {}

    fn set_stream_tos(&self, _stream: AgentStreamId, tos: u8) {
        self.inner.lock().tos = tos;
    }

    fn restart(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.restarts += 1;
        inner.remote.clear();
        inner.remote_creds = None;
        true
    }
}

#[derive(Default)]
pub struct TestAgentFactory {
    agents: Mutex<Vec<(Arc<TestAgent>, Arc<dyn IceAgent>)>>,
}

impl TestAgentFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The n:th created agent, as concrete type and as handed out.
    pub fn agent(&self, n: usize) -> (Arc<TestAgent>, Arc<dyn IceAgent>) {
        self.agents.lock()[n].clone()
    }

    pub fn created(&self) -> usize {
        self.agents.lock().len()
    }
}

impl AgentFactory for TestAgentFactory {
    fn create(&self, _config: &IceConfig) -> Result<Arc<dyn IceAgent>, IceError> {
        let agent = Arc::new(TestAgent::default());
        let handle: Arc<dyn IceAgent> = agent.clone();
        self.agents.lock().push((agent, handle.clone()));
        Ok(handle)
    }
}

pub fn agent_candidate(stream: AgentStreamId, component: u16, addr: &str) -> AgentCandidate {
    let addr: SocketAddr = addr.parse().unwrap();
    AgentCandidate {
        stream_id: stream,
        component_id: component.into(),
        kind: CandidateKind::Host,
        transport: Transport::Udp,
        addr,
        base_addr: None,
        priority: 2130706431,
        foundation: "1".into(),
        username: None,
        password: None,
    }
}

pub fn remote_candidate(component: u16, addr: &str, ufrag: &str, pass: &str) -> Candidate {
    Candidate::new("1", component.into(), CandidateKind::Host, addr.parse().unwrap()).with_credentials(ufrag, pass)
}

/// A session with its recording graph.
pub struct TestSession {
    pub span: Span,
    pub session: Session,
    pub graph: Arc<TestGraph>,
    pub events: Vec<Event>,
}

impl TestSession {
    pub fn new(name: &'static str, config: SessionConfig) -> Self {
        Self::with_registry(name, config, audio_registry())
    }

    pub fn with_registry(name: &'static str, config: SessionConfig, registry: Arc<TestRegistry>) -> Self {
        let graph = Arc::new(TestGraph::new(registry.clone()));
        let blueprints = BlueprintRegistry::new(registry);
        let session = Session::new(config, &blueprints, graph.clone()).expect("session");
        TestSession {
            span: info_span!("S", name),
            session,
            graph,
            events: vec![],
        }
    }

    /// Handle queued work and collect events. Returns the new events.
    pub fn drive(&mut self) -> Vec<Event> {
        let _e = self.span.enter();
        let mut new = vec![];
        loop {
            let n = self.session.process_pending();
            let mut any = false;
            while let Some(e) = self.session.poll_event() {
                new.push(e);
                any = true;
            }
            if n == 0 && !any {
                break;
            }
        }
        self.events.extend(new.iter().cloned());
        new
    }

    pub fn errors(&self) -> Vec<&Event> {
        self.events.iter().filter(|e| matches!(e, Event::Error { .. })).collect()
    }
}

impl Deref for TestSession {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

pub fn count<F: Fn(&Event) -> bool>(events: &[Event], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtpconf=debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}
