use std::sync::Arc;

use rtpconf::ice::{AgentEvent, ComponentState, IceCreds};
use rtpconf::{AgentStreamId, ComponentId, ConfError, Direction, ErrorKind, Event};
use rtpconf::{IceAgent, IceConfig, MediaType, Participant, SessionConfig, Stream};

mod common;
use common::{agent_candidate, count, init_log, remote_candidate, TestAgent, TestAgentFactory, TestSession};

struct Call {
    session: TestSession,
    participant: Participant,
    stream: Stream,
    agent: Arc<TestAgent>,
    handle: Arc<dyn IceAgent>,
    agent_stream: AgentStreamId,
}

impl Call {
    fn new() -> Result<Call, ConfError> {
        let session = TestSession::new("ice", SessionConfig::new(MediaType::Audio));
        let factory = TestAgentFactory::new();
        let participant = Participant::new("peer@test", factory.clone());

        let stream = session.new_stream(&participant, Direction::SendRecv)?;
        stream.set_transmitter(IceConfig::default())?;

        let (agent, handle) = factory.agent(0);
        let agent_stream = agent.streams()[0];

        Ok(Call {
            session,
            participant,
            stream,
            agent,
            handle,
            agent_stream,
        })
    }

    fn feed(&self, event: AgentEvent) {
        assert!(self.participant.handle_agent_event(&self.handle, event));
    }

    fn state(&self, component: u16, state: ComponentState) {
        self.feed(AgentEvent::ComponentStateChanged {
            stream: self.agent_stream,
            component: component.into(),
            state,
        });
    }

    fn gather(&self) {
        self.feed(AgentEvent::NewCandidate(agent_candidate(self.agent_stream, 1, "[2001:db8::1]:5000")));
        self.feed(AgentEvent::NewCandidate(agent_candidate(self.agent_stream, 1, "10.0.0.1:5000")));
        self.feed(AgentEvent::NewCandidate(agent_candidate(self.agent_stream, 2, "10.0.0.1:5001")));
        self.feed(AgentEvent::GatheringDone {
            stream: self.agent_stream,
        });
    }

    fn connect(&self) {
        for c in 1..=2 {
            self.state(c, ComponentState::Connecting);
            self.feed(AgentEvent::NewSelectedPair {
                stream: self.agent_stream,
                component: c.into(),
                local: agent_candidate(self.agent_stream, c, &format!("10.0.0.1:500{}", c - 1)),
                remote: agent_candidate(self.agent_stream, c, &format!("10.0.0.2:600{}", c - 1)),
            });
            self.state(c, ComponentState::Connected);
            self.state(c, ComponentState::Ready);
        }
    }

    fn remote(&self) -> Vec<rtpconf::Candidate> {
        vec![
            remote_candidate(1, "10.0.0.2:6000", "rufrag", "rpass"),
            remote_candidate(2, "10.0.0.2:6001", "rufrag", "rpass"),
        ]
    }
}

fn local_candidates(events: &[Event]) -> Vec<rtpconf::Candidate> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::NewLocalCandidate { candidate, .. } => Some(candidate.clone()),
            _ => None,
        })
        .collect()
}

fn states(events: &[Event], component: u16) -> Vec<ComponentState> {
    let component = ComponentId::from(component);
    events
        .iter()
        .filter_map(|e| match e {
            Event::ComponentStateChanged { component: c, state, .. } if *c == component => Some(*state),
            _ => None,
        })
        .collect()
}

#[test]
pub fn local_candidates_wait_for_gathering() -> Result<(), ConfError> {
    init_log();

    let mut call = Call::new()?;

    call.feed(AgentEvent::NewCandidate(agent_candidate(call.agent_stream, 1, "10.0.0.1:5000")));
    assert!(local_candidates(&call.session.drive()).is_empty());

    call.gather();
    let events = call.session.drive();

    let local = local_candidates(&events);
    assert_eq!(local.len(), 4);
    // IPv6 goes last.
    assert!(local.last().expect("candidate").is_ipv6());
    assert!(local.iter().all(|c| c.username.as_deref() == Some("ufrag1g0")));

    let prepared = count(&events, |e| matches!(e, Event::LocalCandidatesPrepared { .. }));
    assert_eq!(prepared, 1);

    let creds = call.stream.local_credentials().expect("credentials");
    assert_eq!(creds.ufrag, "ufrag1g0");

    Ok(())
}

#[test]
pub fn remote_candidates_wait_for_gathering() -> Result<(), ConfError> {
    init_log();

    let call = Call::new()?;

    call.stream.set_remote_candidates(Some(call.remote()))?;
    assert!(call.agent.remote_candidates().is_empty());

    call.gather();
    assert_eq!(call.agent.remote_candidates().len(), 2);
    assert_eq!(
        call.agent.remote_creds(),
        Some(IceCreds {
            ufrag: "rufrag".into(),
            pass: "rpass".into(),
        })
    );

    Ok(())
}

#[test]
pub fn remote_candidate_validation() -> Result<(), ConfError> {
    init_log();

    let call = Call::new()?;
    call.gather();

    let err = call.stream.set_remote_candidates(Some(vec![])).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArguments);

    let bad_component = vec![remote_candidate(3, "10.0.0.2:6000", "u", "p")];
    let err = call.stream.set_remote_candidates(Some(bad_component)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArguments);

    let mixed = vec![
        remote_candidate(1, "10.0.0.2:6000", "u1", "p"),
        remote_candidate(2, "10.0.0.2:6001", "u2", "p"),
    ];
    assert!(call.stream.set_remote_candidates(Some(mixed)).is_err());

    let mut no_creds = remote_candidate(1, "10.0.0.2:6000", "u", "p");
    no_creds.username = None;
    assert!(call.stream.set_remote_candidates(Some(vec![no_creds])).is_err());

    assert!(call.agent.remote_candidates().is_empty());

    Ok(())
}

#[test]
pub fn failure_only_counts_after_ready() -> Result<(), ConfError> {
    init_log();

    let mut call = Call::new()?;
    call.gather();

    call.state(1, ComponentState::Failed);
    let events = call.session.drive();
    assert!(states(&events, 1).is_empty());
    assert!(call.session.errors().is_empty());

    call.state(1, ComponentState::Ready);
    call.state(1, ComponentState::Failed);
    let events = call.session.drive();
    assert_eq!(states(&events, 1), vec![ComponentState::Ready, ComponentState::Failed]);

    let failed = count(&events, |e| {
        matches!(
            e,
            Event::Error {
                kind: ErrorKind::ConnectionFailed,
                ..
            }
        )
    });
    assert_eq!(failed, 1);

    Ok(())
}

#[test]
pub fn restart_renews_credentials() -> Result<(), ConfError> {
    init_log();

    let mut call = Call::new()?;
    call.gather();
    call.stream.set_remote_candidates(Some(call.remote()))?;
    call.connect();
    call.session.drive();

    let (local, remote) = call.stream.selected_pair(ComponentId::from(1)).expect("selected pair");
    assert_eq!(local.port, 5000);
    assert_eq!(remote.port, 6000);

    call.stream.set_remote_candidates(None)?;
    let events = call.session.drive();

    assert_eq!(call.agent.restarts(), 1);
    assert!(call.agent.remote_candidates().is_empty());
    assert!(call.stream.selected_pair(ComponentId::from(1)).is_none());
    assert!(call.stream.selected_pair(ComponentId::from(2)).is_none());

    let local = local_candidates(&events);
    assert_eq!(local.len(), 3);
    assert!(local.iter().all(|c| c.username.as_deref() == Some("ufrag1g1")));
    assert!(local.iter().all(|c| c.password.as_deref() == Some("pass1g1")));
    assert_eq!(count(&events, |e| matches!(e, Event::LocalCandidatesPrepared { .. })), 1);

    // The peer answers with fresh credentials and the checks run again.
    call.stream.set_remote_candidates(Some(vec![
        remote_candidate(1, "10.0.0.2:6000", "newufrag", "newpass"),
        remote_candidate(2, "10.0.0.2:6001", "newufrag", "newpass"),
    ]))?;
    assert_eq!(call.agent.remote_creds().expect("creds").ufrag, "newufrag");

    call.connect();
    let events = call.session.drive();

    assert_eq!(
        states(&events, 1),
        vec![ComponentState::Connecting, ComponentState::Connected, ComponentState::Ready]
    );
    assert!(call.stream.selected_pair(ComponentId::from(1)).is_some());
    assert!(call.session.errors().is_empty(), "{:?}", call.session.errors());

    Ok(())
}

#[test]
pub fn forced_candidates() -> Result<(), ConfError> {
    init_log();

    let call = Call::new()?;

    let two_for_one = vec![
        remote_candidate(1, "10.0.0.2:6000", "u", "p"),
        remote_candidate(1, "10.0.0.2:6002", "u", "p"),
    ];
    let err = call.stream.force_remote_candidates(two_for_one).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArguments);

    call.stream.force_remote_candidates(call.remote())?;
    assert!(call.agent.selected().is_empty());

    call.gather();
    assert_eq!(call.agent.selected().len(), 2);

    // Connectivity checks are skipped, so more candidates make no sense.
    assert!(call.stream.set_remote_candidates(Some(call.remote())).is_err());

    Ok(())
}

#[test]
pub fn tos_reaches_the_agent() -> Result<(), ConfError> {
    init_log();

    let call = Call::new()?;
    assert_eq!(call.agent.tos(), 0);

    call.session.set_tos(0xb8)?;
    assert_eq!(call.agent.tos(), 0xb8);
    assert_eq!(call.session.tos(), 0xb8);

    Ok(())
}
