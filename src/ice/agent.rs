use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::binding::{IceBinding, RelayInfo};
use super::{AgentCandidate, CompatibilityMode, ComponentState, IceCreds, IceError};
use crate::config::IceConfig;
use crate::id::{AgentStreamId, ComponentId};

/// External ICE agent.
///
/// One agent hosts any number of streams, each with its own agent local
/// stream id. Calls must not block on the agent's own event dispatch.
pub trait IceAgent: Send + Sync {
    /// Add a stream with `components` components. `None` if the agent
    /// can not take more streams.
    fn add_stream(&self, components: u16) -> Option<AgentStreamId>;

    fn remove_stream(&self, stream: AgentStreamId);

    /// Add a TURN server for one component.
    fn set_relay_info(&self, stream: AgentStreamId, component: ComponentId, relay: &RelayInfo) -> bool;

    fn gather_candidates(&self, stream: AgentStreamId) -> bool;

    /// Returns the number of candidates the agent accepted.
    fn set_remote_candidates(
        &self,
        stream: AgentStreamId,
        component: ComponentId,
        candidates: &[AgentCandidate],
    ) -> usize;

    /// Skip connectivity checks and use this pair.
    fn set_selected_remote_candidate(
        &self,
        stream: AgentStreamId,
        component: ComponentId,
        candidate: &AgentCandidate,
    ) -> bool;

    fn set_remote_credentials(&self, stream: AgentStreamId, creds: &IceCreds) -> bool;

    fn local_credentials(&self, stream: AgentStreamId) -> Option<IceCreds>;

    fn set_port_range(&self, stream: AgentStreamId, component: ComponentId, min: u16, max: u16);

    fn set_stream_tos(&self, stream: AgentStreamId, tos: u8);

    /// Restart every stream of the agent with new local credentials.
    fn restart(&self) -> bool;
}

/// Notifications from an agent, fed back with
/// [`crate::Participant::handle_agent_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    ComponentStateChanged {
        stream: AgentStreamId,
        component: ComponentId,
        state: ComponentState,
    },
    GatheringDone {
        stream: AgentStreamId,
    },
    NewCandidate(AgentCandidate),
    NewSelectedPair {
        stream: AgentStreamId,
        component: ComponentId,
        local: AgentCandidate,
        remote: AgentCandidate,
    },
}

impl AgentEvent {
    pub fn stream_id(&self) -> AgentStreamId {
        match self {
            AgentEvent::ComponentStateChanged { stream, .. } => *stream,
            AgentEvent::GatheringDone { stream } => *stream,
            AgentEvent::NewCandidate(c) => c.stream_id,
            AgentEvent::NewSelectedPair { stream, .. } => *stream,
        }
    }
}

/// Creates agents for a participant.
///
/// The factory applies STUN server, controlling mode, ICE-UDP/ICE-TCP and
/// preferred local candidates from the config.
pub trait AgentFactory: Send + Sync {
    fn create(&self, config: &IceConfig) -> Result<Arc<dyn IceAgent>, IceError>;
}

/// What makes two streams able to share an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentKey {
    compatibility: CompatibilityMode,
    stun_server: Option<String>,
    stun_port: u16,
    preferred: Vec<Option<IpAddr>>,
}

impl AgentKey {
    pub fn new(config: &IceConfig) -> Self {
        AgentKey {
            compatibility: config.compatibility,
            stun_server: config.stun_server.clone(),
            stun_port: config.stun_port,
            preferred: config.preferred_local_candidates.iter().map(|c| c.ip).collect(),
        }
    }
}

/// An agent and the bindings that have a stream on it.
pub(crate) struct SharedAgent {
    agent: Arc<dyn IceAgent>,
    key: AgentKey,
    bindings: Mutex<Vec<(AgentStreamId, Weak<IceBinding>)>>,
}

impl SharedAgent {
    pub fn agent(&self) -> &dyn IceAgent {
        &*self.agent
    }

    fn is(&self, agent: &Arc<dyn IceAgent>) -> bool {
        Arc::as_ptr(&self.agent) as *const () == Arc::as_ptr(agent) as *const ()
    }

    pub fn attach(&self, stream: AgentStreamId, binding: &Arc<IceBinding>) {
        let mut bindings = self.bindings.lock();
        bindings.retain(|(_, b)| b.strong_count() > 0);
        if bindings.iter().any(|(id, _)| *id == stream) {
            warn!("Agent reused stream id {}", stream);
            bindings.retain(|(id, _)| *id != stream);
        }
        bindings.push((stream, Arc::downgrade(binding)));
    }

    pub fn detach(&self, stream: AgentStreamId) {
        self.bindings.lock().retain(|(id, _)| *id != stream);
    }

    /// Route an event to the binding owning its stream.
    pub fn dispatch(&self, event: AgentEvent) {
        let stream = event.stream_id();
        let binding = {
            let bindings = self.bindings.lock();
            bindings
                .iter()
                .find(|(id, _)| *id == stream)
                .and_then(|(_, b)| b.upgrade())
        };

        match binding {
            Some(b) => b.handle_agent_event(event),
            None => trace!("Agent event for unknown stream {}: {:?}", stream, event),
        }
    }
}

/// Agents of one participant. Holds them weakly: the last binding using an
/// agent drops it.
#[derive(Default)]
pub(crate) struct AgentRegistry {
    agents: Mutex<Vec<Weak<SharedAgent>>>,
}

impl AgentRegistry {
    /// An agent matching `config`, created if none is alive.
    pub fn get_or_create(
        &self,
        config: &IceConfig,
        factory: &dyn AgentFactory,
    ) -> Result<Arc<SharedAgent>, IceError> {
        let key = AgentKey::new(config);
        let mut agents = self.agents.lock();
        agents.retain(|a| a.strong_count() > 0);

        if let Some(a) = agents.iter().filter_map(|a| a.upgrade()).find(|a| a.key == key) {
            debug!("Reusing ICE agent for {:?}", key.compatibility);
            return Ok(a);
        }

        let agent = factory.create(config)?;
        let shared = Arc::new(SharedAgent {
            agent,
            key,
            bindings: Mutex::new(vec![]),
        });
        agents.push(Arc::downgrade(&shared));
        info!("New ICE agent ({:?})", config.compatibility);

        Ok(shared)
    }

    pub fn find(&self, agent: &Arc<dyn IceAgent>) -> Option<Arc<SharedAgent>> {
        self.agents
            .lock()
            .iter()
            .filter_map(|a| a.upgrade())
            .find(|a| a.is(agent))
    }

    pub fn len(&self) -> usize {
        self.agents.lock().iter().filter(|a| a.strong_count() > 0).count()
    }
}
