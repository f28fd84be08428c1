//! A remote party of a conference.

use std::fmt;
use std::sync::Arc;

use crate::ice::{AgentEvent, AgentFactory, AgentRegistry, IceAgent};

/// A remote party, identified by the CNAME it puts in its RTCP SDES.
///
/// Streams of one participant in different sessions share ICE agents when
/// their transmitter configurations allow it. The participant owns the
/// registry of those agents.
#[derive(Clone)]
pub struct Participant(Arc<Inner>);

struct Inner {
    cname: String,
    factory: Arc<dyn AgentFactory>,
    agents: AgentRegistry,
}

impl Participant {
    /// Create a participant. `factory` creates ICE agents when a stream
    /// gets a transmitter no existing agent can serve.
    pub fn new(cname: &str, factory: Arc<dyn AgentFactory>) -> Self {
        Participant(Arc::new(Inner {
            cname: cname.to_string(),
            factory,
            agents: AgentRegistry::default(),
        }))
    }

    pub fn cname(&self) -> &str {
        &self.0.cname
    }

    pub(crate) fn agents(&self) -> &AgentRegistry {
        &self.0.agents
    }

    pub(crate) fn agent_factory(&self) -> &dyn AgentFactory {
        &*self.0.factory
    }

    /// Number of live ICE agents.
    pub fn agent_count(&self) -> usize {
        self.0.agents.len()
    }

    /// Feed a notification from `agent` to the stream it concerns.
    ///
    /// Call this from the thread servicing the agent. Returns false if the
    /// agent is not one of this participant's.
    pub fn handle_agent_event(&self, agent: &Arc<dyn IceAgent>, event: AgentEvent) -> bool {
        let Some(shared) = self.0.agents.find(agent) else {
            trace!("Event from an unknown agent: {:?}", event);
            return false;
        };
        shared.dispatch(event);
        true
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("cname", &self.0.cname)
            .field("agents", &self.0.agents.len())
            .finish()
    }
}
