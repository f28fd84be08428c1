use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::IceError;
use crate::id::{AgentStreamId, ComponentId};
use crate::util::Pii;

/// Longest foundation an agent keeps.
const MAX_FOUNDATION: usize = 32;

/// ICE credentials of one side of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCreds {
    /// From a=ice-ufrag
    pub ufrag: String,
    /// From a=ice-pwd
    pub pass: String,
}

/// Type of candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Host (local network interface)
    Host,
    /// Srflx (STUN)
    ServerReflexive,
    /// Prflx (Peer reflexive)
    PeerReflexive,
    /// Relay (TURN)
    Relayed,
    /// Multicast group. Not usable with ICE.
    Multicast,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relayed => "relay",
            CandidateKind::Multicast => "multicast",
        };
        write!(f, "{x}")
    }
}

/// Transport of a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    Udp,
    TcpActive,
    TcpPassive,
    TcpSo,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            Transport::Udp => "udp",
            Transport::TcpActive => "tcp-active",
            Transport::TcpPassive => "tcp-passive",
            Transport::TcpSo => "tcp-so",
        };
        write!(f, "{x}")
    }
}

/// Candidate as exchanged with the application.
///
/// Remote candidates arrive from signalling in this form, local candidates
/// are reported in it. The fields mirror what an SDP `a=candidate` line
/// carries plus per candidate credentials for the dialects that use them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Groups candidates of the same type, base and server.
    pub foundation: String,

    /// 1 for RTP, 2 for RTCP.
    pub component_id: ComponentId,

    /// Address to use. Required for remote candidates.
    pub ip: Option<IpAddr>,

    pub port: u16,

    /// Address the agent sends from for this candidate.
    pub base_ip: Option<IpAddr>,

    pub base_port: u16,

    pub proto: Transport,

    pub priority: u32,

    pub kind: CandidateKind,

    pub username: Option<String>,

    pub password: Option<String>,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Candidate({}/{} {}=", self.component_id, self.foundation, self.kind)?;
        match self.ip {
            Some(ip) => write!(f, "{}", Pii(SocketAddr::new(ip, self.port)))?,
            None => write!(f, "?:{}", self.port)?,
        }
        write!(f, "/{}", self.proto)?;
        if let Some(b) = self.base_ip {
            write!(f, " base={}", Pii(SocketAddr::new(b, self.base_port)))?;
        }
        write!(f, " prio={}", self.priority)?;
        if let Some(u) = &self.username {
            write!(f, " user={}", Pii(u))?;
        }
        write!(f, ")")
    }
}

impl Candidate {
    /// A candidate without base address or credentials.
    pub fn new(
        foundation: &str,
        component_id: ComponentId,
        kind: CandidateKind,
        addr: SocketAddr,
    ) -> Self {
        Candidate {
            foundation: foundation.into(),
            component_id,
            ip: Some(addr.ip()),
            port: addr.port(),
            base_ip: None,
            base_port: 0,
            proto: Transport::Udp,
            priority: 0,
            kind,
            username: None,
            password: None,
        }
    }

    /// Builder style credentials setter.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Builder style base address setter.
    pub fn with_base(mut self, base: SocketAddr) -> Self {
        self.base_ip = Some(base.ip());
        self.base_port = base.port();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_proto(mut self, proto: Transport) -> Self {
        self.proto = proto;
        self
    }

    /// The address, if there is an IP.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip, Some(IpAddr::V6(_)))
    }

    /// Translate to the agent's form for `stream_id`.
    pub(crate) fn to_agent(&self, stream_id: AgentStreamId) -> Result<AgentCandidate, IceError> {
        let Some(addr) = self.addr() else {
            return Err(IceError::BadCandidate("Candidate MUST have an IP address".into()));
        };

        let kind = match self.kind {
            CandidateKind::Multicast => {
                warn!("Invalid candidate type multicast, defaulting to type host");
                CandidateKind::Host
            }
            k => k,
        };

        let base_addr = match self.base_ip {
            Some(ip) if self.base_port != 0 => Some(SocketAddr::new(ip, self.base_port)),
            _ => None,
        };

        let mut foundation = self.foundation.clone();
        if foundation.len() > MAX_FOUNDATION {
            let mut end = MAX_FOUNDATION;
            while !foundation.is_char_boundary(end) {
                end -= 1;
            }
            foundation.truncate(end);
        }

        Ok(AgentCandidate {
            stream_id,
            component_id: self.component_id,
            kind,
            transport: self.proto,
            addr,
            base_addr,
            priority: self.priority,
            foundation,
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

/// Candidate in the form an ICE agent handles.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentCandidate {
    pub stream_id: AgentStreamId,
    pub component_id: ComponentId,
    pub kind: CandidateKind,
    pub transport: Transport,
    pub addr: SocketAddr,
    pub base_addr: Option<SocketAddr>,
    pub priority: u32,
    pub foundation: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for AgentCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AgentCandidate({}:{} {}={}/{} prio={})",
            self.stream_id,
            self.component_id,
            self.kind,
            Pii(self.addr),
            self.transport,
            self.priority
        )
    }
}

impl AgentCandidate {
    /// Translate to the application's form.
    ///
    /// Local candidates without credentials of their own get the stream's
    /// local credentials.
    pub(crate) fn to_candidate(&self, local_creds: Option<&IceCreds>) -> Candidate {
        let (base_ip, base_port) = match self.base_addr {
            Some(b) if self.kind != CandidateKind::Host => (Some(b.ip()), b.port()),
            _ => (None, 0),
        };

        let (username, password) = match (&self.username, &self.password, local_creds) {
            (None, None, Some(c)) => (Some(c.ufrag.clone()), Some(c.pass.clone())),
            (u, p, _) => (u.clone(), p.clone()),
        };

        Candidate {
            foundation: self.foundation.clone(),
            component_id: self.component_id,
            ip: Some(self.addr.ip()),
            port: self.addr.port(),
            base_ip,
            base_port,
            proto: self.transport,
            priority: self.priority,
            kind: self.kind,
            username,
            password,
        }
    }
}
