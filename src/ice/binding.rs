use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::agent::{AgentEvent, AgentFactory, AgentRegistry, SharedAgent};
use super::{AgentCandidate, Candidate, CandidateKind, CompatibilityMode, ComponentState};
use super::{IceCreds, IceError};
use crate::bus::{Bus, ErrorSource, Event};
use crate::config::IceConfig;
use crate::error::ErrorKind;
use crate::id::{AgentStreamId, ComponentId, StreamId};
use crate::keyunit::KeyUnitManager;
use crate::util::Pii;

/// TURN transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl From<&str> for RelayType {
    fn from(v: &str) -> Self {
        if v.eq_ignore_ascii_case("tcp") {
            RelayType::Tcp
        } else if v.eq_ignore_ascii_case("tls") {
            RelayType::Tls
        } else {
            RelayType::Udp
        }
    }
}

/// A TURN server for the agent.
///
/// A record without `component` is used for every component that has no
/// record of its own.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub ip: Option<String>,
    pub port: Option<u32>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub relay_type: Option<RelayType>,
    pub component: Option<u16>,
}

impl fmt::Debug for RelayInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayInfo")
            .field("ip", &self.ip.as_ref().map(Pii))
            .field("port", &self.port)
            .field("username", &self.username.as_ref().map(Pii))
            .field("relay_type", &self.relay_type)
            .field("component", &self.component)
            .finish()
    }
}

impl RelayInfo {
    pub fn new(ip: &str, port: u16, username: &str, password: &str) -> Self {
        RelayInfo {
            ip: Some(ip.into()),
            port: Some(port.into()),
            username: Some(username.into()),
            password: Some(password.into()),
            relay_type: None,
            component: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), IceError> {
        let complete = self.ip.is_some()
            && self.username.is_some()
            && self.password.is_some()
            && matches!(self.port, Some(p) if p <= u16::MAX as u32);

        if !complete {
            return Err(IceError::RelayInfo(
                "Need to pass an ip, port, username and password for a relay".into(),
            ));
        }

        Ok(())
    }

    fn applies_to(&self, component: u16) -> bool {
        self.component == Some(component)
    }
}

/// A stream's use of an ICE agent.
pub(crate) struct IceBinding {
    stream: StreamId,
    components: u16,
    compatibility: CompatibilityMode,
    shared: Arc<SharedAgent>,
    agent_stream: AgentStreamId,
    bus: Bus,
    keyunit: Arc<KeyUnitManager>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Local gathering finished.
    gathered: bool,
    /// Local candidates held back until gathering is done. IPv4 first.
    local_candidates: VecDeque<Candidate>,
    /// Every local candidate the agent reported.
    known_local: Vec<AgentCandidate>,
    /// Remote candidates held back until gathering is done.
    remote_candidates: Vec<Candidate>,
    forced: bool,
    username: Option<String>,
    password: Option<String>,
    has_been_ready: Vec<bool>,
    selected: Vec<Option<(Candidate, Candidate)>>,
}

impl IceBinding {
    /// Create a stream on a matching agent of the participant.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: StreamId,
        config: &IceConfig,
        registry: &AgentRegistry,
        factory: &dyn AgentFactory,
        bus: Bus,
        keyunit: Arc<KeyUnitManager>,
        tos: u8,
    ) -> Result<Arc<IceBinding>, IceError> {
        config.validate()?;

        let shared = registry.get_or_create(config, factory)?;
        let agent = shared.agent();
        let components = config.components;

        let Some(agent_stream) = agent.add_stream(components) else {
            return Err(IceError::Agent("Could not create agent stream".into()));
        };

        for c in 1..=components {
            let component = ComponentId::from(c);
            let specific: Vec<_> = config.relay_info.iter().filter(|r| r.applies_to(c)).collect();

            let records: Vec<_> = if specific.is_empty() {
                config.relay_info.iter().filter(|r| r.component.is_none()).collect()
            } else {
                specific
            };

            for r in records {
                if !agent.set_relay_info(agent_stream, component, r) {
                    agent.remove_stream(agent_stream);
                    return Err(IceError::Refused("Could not set relay info".into()));
                }
            }
        }

        if let Some((min, max)) = config.usable_port_range() {
            for c in 1..=components {
                agent.set_port_range(agent_stream, ComponentId::from(c), min, max);
            }
        }

        agent.set_stream_tos(agent_stream, tos);

        let inner = Inner {
            has_been_ready: vec![false; components as usize],
            selected: vec![None; components as usize],
            ..Default::default()
        };

        let binding = Arc::new(IceBinding {
            stream,
            components,
            compatibility: config.compatibility,
            shared: shared.clone(),
            agent_stream,
            bus,
            keyunit,
            inner: Mutex::new(inner),
        });

        shared.attach(agent_stream, &binding);
        debug!(
            "Created agent stream {} with {} components for stream {}",
            agent_stream, components, stream
        );

        Ok(binding)
    }

    pub fn agent_stream_id(&self) -> AgentStreamId {
        self.agent_stream
    }

    pub fn gather(&self) -> Result<(), IceError> {
        debug!("Stream {} started", self.agent_stream);
        if !self.shared.agent().gather_candidates(self.agent_stream) {
            return Err(IceError::Refused("Could not start gathering".into()));
        }
        Ok(())
    }

    pub fn local_credentials(&self) -> Option<IceCreds> {
        self.shared.agent().local_credentials(self.agent_stream)
    }

    pub fn selected_pair(&self, component: ComponentId) -> Option<(Candidate, Candidate)> {
        let idx = (*component as usize).checked_sub(1)?;
        self.inner.lock().selected.get(idx).cloned().flatten()
    }

    pub fn set_tos(&self, tos: u8) {
        self.shared.agent().set_stream_tos(self.agent_stream, tos);
    }

    /// Add remote candidates. `None` restarts ICE.
    pub fn set_remote_candidates(&self, candidates: Option<Vec<Candidate>>) -> Result<(), IceError> {
        match candidates {
            None => self.restart(),
            Some(c) => self.add_remote_candidates(&c),
        }
    }

    fn restart(&self) -> Result<(), IceError> {
        info!("ICE restart on stream {}", self.stream);

        {
            let mut inner = self.inner.lock();
            inner.remote_candidates.clear();
            inner.forced = false;
            inner.username = None;
            inner.password = None;
            inner.has_been_ready.iter_mut().for_each(|r| *r = false);
            inner.selected.iter_mut().for_each(|s| *s = None);
        }

        let agent = self.shared.agent();
        if !agent.restart() {
            return Err(IceError::Refused("Agent refused to restart".into()));
        }

        let creds = agent.local_credentials(self.agent_stream);

        let inner = self.inner.lock();
        if !inner.gathered {
            return Ok(());
        }
        let events: Vec<_> = inner
            .known_local
            .iter()
            .map(|c| Event::NewLocalCandidate {
                stream: self.stream,
                candidate: c.to_candidate(creds.as_ref()),
            })
            .collect();
        drop(inner);

        self.bus.extend(events);
        self.bus.push(Event::LocalCandidatesPrepared { stream: self.stream });

        Ok(())
    }

    fn validate_remote(&self, inner: &Inner, candidates: &[Candidate]) -> Result<(Option<String>, Option<String>), IceError> {
        let mut username = inner.username.clone();
        let mut password = inner.password.clone();

        for c in candidates {
            if c.ip.is_none() {
                return Err(IceError::BadCandidate("Candidate MUST have an IP address".into()));
            }
            if *c.component_id == 0 || *c.component_id > self.components {
                return Err(IceError::BadCandidate(format!(
                    "Candidate MUST have a component id between 1 and {}, {} is invalid",
                    self.components, c.component_id
                )));
            }
            if c.kind == CandidateKind::Multicast {
                return Err(IceError::BadCandidate(
                    "ICE does not accept multicast candidates".into(),
                ));
            }
            let Some(cu) = &c.username else {
                return Err(IceError::Credentials(
                    "Invalid remote candidates passed, does not have a username".into(),
                ));
            };
            if self.compatibility.requires_password() && c.password.is_none() {
                return Err(IceError::Credentials(
                    "Invalid remote candidates passed, does not have a password".into(),
                ));
            }

            if !self.compatibility.per_candidate_credentials() {
                match &username {
                    None => username = Some(cu.clone()),
                    Some(u) if u != cu => {
                        return Err(IceError::Credentials(
                            "Invalid remote candidates passed, does not have the right username"
                                .into(),
                        ));
                    }
                    _ => {}
                }
                match (&password, &c.password) {
                    (None, p) => password = p.clone(),
                    (Some(p), Some(cp)) if p != cp => {
                        return Err(IceError::Credentials(
                            "Invalid remote candidates passed, does not have the right password"
                                .into(),
                        ));
                    }
                    _ => {}
                }
            }
        }

        Ok((username, password))
    }

    fn add_remote_candidates(&self, candidates: &[Candidate]) -> Result<(), IceError> {
        if candidates.is_empty() {
            return Err(IceError::BadCandidate("No remote candidates passed".into()));
        }

        let creds = {
            let mut inner = self.inner.lock();
            let (username, password) = self.validate_remote(&inner, candidates)?;

            if inner.username.is_none() {
                inner.username = username.clone();
            }
            if inner.password.is_none() {
                inner.password = password.clone();
            }

            if inner.forced {
                return Err(IceError::Forced);
            }

            if !inner.gathered {
                trace!("Holding {} remote candidates until gathered", candidates.len());
                inner.remote_candidates.extend(candidates.iter().cloned());
                return Ok(());
            }

            IceCreds {
                ufrag: username.unwrap_or_default(),
                pass: password.unwrap_or_default(),
            }
        };

        let agent = self.shared.agent();

        if !self.compatibility.per_candidate_credentials()
            && !agent.set_remote_credentials(self.agent_stream, &creds)
        {
            return Err(IceError::Refused("Could not set the security credentials".into()));
        }

        for c in 1..=self.components {
            let component = ComponentId::from(c);
            let list = candidates
                .iter()
                .filter(|x| x.component_id == component)
                .map(|x| x.to_agent(self.agent_stream))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| IceError::BadCandidate("Invalid remote candidates passed".into()))?;

            if list.is_empty() {
                continue;
            }

            let added = agent.set_remote_candidates(self.agent_stream, component, &list);
            trace!("Agent took {}/{} candidates for component {}", added, list.len(), c);
        }

        Ok(())
    }

    /// Skip connectivity checks and use one remote candidate per component.
    pub fn force_remote_candidates(&self, candidates: Vec<Candidate>) -> Result<(), IceError> {
        let mut done = vec![false; self.components as usize];

        for c in &candidates {
            let id = *c.component_id;
            if id < 1 || id > self.components {
                return Err(IceError::BadCandidate(
                    "The component on this candidate is wrong".into(),
                ));
            }
            if done[id as usize - 1] {
                return Err(IceError::BadCandidate(
                    "You can set only one candidate per component".into(),
                ));
            }
            done[id as usize - 1] = true;
        }

        {
            let mut inner = self.inner.lock();
            inner.forced = true;
            if !inner.gathered {
                inner.remote_candidates = candidates;
                return Ok(());
            }
        }

        if !self.force_act(&candidates) {
            return Err(IceError::Refused(
                "Unknown error while selecting remote candidates".into(),
            ));
        }

        Ok(())
    }

    fn force_act(&self, candidates: &[Candidate]) -> bool {
        let agent = self.shared.agent();
        candidates.iter().all(|c| match c.to_agent(self.agent_stream) {
            Ok(ac) => agent.set_selected_remote_candidate(self.agent_stream, c.component_id, &ac),
            Err(_) => false,
        })
    }

    pub fn handle_agent_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::ComponentStateChanged {
                component, state, ..
            } => self.on_state_changed(component, state),
            AgentEvent::GatheringDone { .. } => self.on_gathering_done(),
            AgentEvent::NewCandidate(c) => self.on_new_candidate(c),
            AgentEvent::NewSelectedPair {
                component,
                local,
                remote,
                ..
            } => self.on_new_selected_pair(component, local, remote),
        }
    }

    fn on_state_changed(&self, component: ComponentId, state: ComponentState) {
        let idx = *component as usize;
        if idx == 0 || idx > self.components as usize {
            warn!("State change for invalid component {}", component);
            return;
        }

        {
            let mut inner = self.inner.lock();
            // More candidates can still arrive, so failure only counts once
            // the component has worked.
            if state == ComponentState::Failed && !inner.has_been_ready[idx - 1] {
                debug!("Ignoring failed on component {} before ready", component);
                return;
            }
            if state == ComponentState::Ready {
                inner.has_been_ready[idx - 1] = true;
            }
        }

        debug!(
            "Stream: {} Component {} has state {}",
            self.agent_stream, component, state
        );

        self.bus.push(Event::ComponentStateChanged {
            stream: self.stream,
            component,
            state,
        });

        if state == ComponentState::Failed {
            self.bus.push(Event::error(
                ErrorSource::Stream(self.stream),
                ErrorKind::ConnectionFailed,
                format!("Component {} failed", component),
            ));
        }

        if state.is_connected() {
            self.keyunit.request(Instant::now(), true);
        }
    }

    fn on_new_candidate(&self, c: AgentCandidate) {
        let creds = self.local_credentials();
        if creds.is_none() && c.username.is_none() && c.password.is_none() {
            warn!("The stream has no credentials");
        }
        let candidate = c.to_candidate(creds.as_ref());
        debug!("New local candidate {:?}", candidate);

        let mut inner = self.inner.lock();
        inner.known_local.push(c);

        if !inner.gathered {
            // Peers that try candidates in order would give up on an
            // unusable IPv6 address before reaching IPv4.
            if candidate.is_ipv6() {
                inner.local_candidates.push_back(candidate);
            } else {
                inner.local_candidates.push_front(candidate);
            }
            return;
        }
        drop(inner);

        self.bus.push(Event::NewLocalCandidate {
            stream: self.stream,
            candidate,
        });
    }

    fn on_gathering_done(&self) {
        let (local, remote, forced) = {
            let mut inner = self.inner.lock();
            if inner.gathered {
                return;
            }
            inner.gathered = true;
            (
                std::mem::take(&mut inner.local_candidates),
                std::mem::take(&mut inner.remote_candidates),
                inner.forced,
            )
        };

        debug!("Candidates gathered for stream {}", self.agent_stream);

        self.bus.extend(local.into_iter().map(|candidate| Event::NewLocalCandidate {
            stream: self.stream,
            candidate,
        }));
        self.bus.push(Event::LocalCandidatesPrepared { stream: self.stream });

        if remote.is_empty() {
            return;
        }

        let source = ErrorSource::Stream(self.stream);

        if forced {
            if !self.force_act(&remote) {
                self.bus.push(Event::error(
                    source,
                    ErrorKind::Internal,
                    "Error setting delayed forced remote candidates",
                ));
            }
        } else if let Err(e) = self.add_remote_candidates(&remote) {
            self.bus.push(Event::error(source, e.kind(), e.to_string()));
        }
    }

    fn on_new_selected_pair(&self, component: ComponentId, local: AgentCandidate, remote: AgentCandidate) {
        let creds = self.local_credentials();
        let local = local.to_candidate(creds.as_ref());
        let remote = remote.to_candidate(None);

        {
            let mut inner = self.inner.lock();
            let idx = (*component as usize).wrapping_sub(1);
            if let Some(s) = inner.selected.get_mut(idx) {
                *s = Some((local.clone(), remote.clone()));
            }
        }

        self.bus.push(Event::NewActiveCandidatePair {
            stream: self.stream,
            local,
            remote,
        });
    }
}

impl Drop for IceBinding {
    fn drop(&mut self) {
        self.shared.detach(self.agent_stream);
        self.shared.agent().remove_stream(self.agent_stream);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relay_type_parse() {
        assert_eq!(RelayType::from("TCP"), RelayType::Tcp);
        assert_eq!(RelayType::from("tls"), RelayType::Tls);
        assert_eq!(RelayType::from("foo"), RelayType::Udp);
    }

    #[test]
    fn relay_info_needs_all_fields() {
        let r = RelayInfo::new("10.0.0.1", 3478, "u", "p");
        assert!(r.validate().is_ok());

        let mut bad = r.clone();
        bad.password = None;
        assert!(bad.validate().is_err());

        let mut bad = r;
        bad.port = Some(70000);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn relay_info_debug_hides_password() {
        let r = RelayInfo::new("10.0.0.1", 3478, "u", "secret");
        assert!(!format!("{:?}", r).contains("secret"));
    }
}
