//! Session and transmitter configuration.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MediaType;
use crate::hdrext::HeaderExtension;
use crate::ice::{Candidate, CandidateKind, CompatibilityMode, IceError, RelayInfo};
use crate::special::SpecialSourceKind;

/// How long a new SSRC waits for an RTCP SDES before it is given to the only
/// stream of the session.
pub const DEFAULT_NO_RTCP_TIMEOUT: Duration = Duration::from_millis(7000);

/// Configuration of a [`crate::Session`].
///
/// ```
/// # use rtpconf::{SessionConfig, MediaType};
/// # use std::time::Duration;
/// let config = SessionConfig::new(MediaType::Audio)
///     .set_no_rtcp_timeout(Some(Duration::ZERO))
///     .set_tos(0xb8);
/// assert_eq!(config.tos(), 0xb8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    media_type: MediaType,
    id: u32,
    no_rtcp_timeout: Option<Duration>,
    tos: u8,
    send_bitrate: Option<u32>,
    hdrext_preferences: Vec<HeaderExtension>,
    special_sources: Vec<SpecialSourceKind>,
    auto_telephone_event: bool,
}

impl SessionConfig {
    /// Defaults for `media_type`.
    pub fn new(media_type: MediaType) -> Self {
        SessionConfig {
            media_type,
            id: 1,
            no_rtcp_timeout: Some(DEFAULT_NO_RTCP_TIMEOUT),
            tos: 0,
            send_bitrate: None,
            hdrext_preferences: vec![],
            special_sources: SpecialSourceKind::all().to_vec(),
            auto_telephone_event: true,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Session number within the conference.
    pub fn set_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn no_rtcp_timeout(&self) -> Option<Duration> {
        self.no_rtcp_timeout
    }

    /// Wait before giving an unclaimed SSRC to the only stream.
    ///
    /// `None` waits forever for an RTCP SDES. Zero associates right away
    /// when there is exactly one stream.
    pub fn set_no_rtcp_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.no_rtcp_timeout = timeout;
        self
    }

    pub fn tos(&self) -> u8 {
        self.tos
    }

    /// IP type of service for every transmitter of the session.
    pub fn set_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn send_bitrate(&self) -> Option<u32> {
        self.send_bitrate
    }

    /// Initial encoder bitrate in bits per second.
    pub fn set_send_bitrate(mut self, bps: Option<u32>) -> Self {
        self.send_bitrate = bps;
        self
    }

    pub fn hdrext_preferences(&self) -> &[HeaderExtension] {
        &self.hdrext_preferences
    }

    /// RTP header extensions to offer.
    pub fn set_hdrext_preferences(mut self, prefs: Vec<HeaderExtension>) -> Self {
        self.hdrext_preferences = prefs;
        self
    }

    pub fn special_sources(&self) -> &[SpecialSourceKind] {
        &self.special_sources
    }

    /// Which special sources the session may create, in order of
    /// precedence.
    pub fn set_special_sources(mut self, kinds: Vec<SpecialSourceKind>) -> Self {
        self.special_sources = kinds;
        self
    }

    pub fn auto_telephone_event(&self) -> bool {
        self.auto_telephone_event
    }

    /// Offer telephone-event for every clock rate an audio codec can send
    /// at, even if no preference names it.
    pub fn set_auto_telephone_event(mut self, enabled: bool) -> Self {
        self.auto_telephone_event = enabled;
        self
    }
}

/// Configuration of the ICE transmitter of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceConfig {
    pub compatibility: CompatibilityMode,
    pub stun_server: Option<String>,
    pub stun_port: u16,
    pub controlling: bool,
    pub ice_udp: bool,
    pub ice_tcp: bool,
    /// Local port range for every component. Ignored unless the start is
    /// non-zero and below the end.
    pub port_range: Option<RangeInclusive<u16>>,
    pub relay_info: Vec<RelayInfo>,
    /// Local interfaces to gather on, as host candidates without port.
    pub preferred_local_candidates: Vec<Candidate>,
    /// 1 for RTP only, 2 for separate RTCP.
    pub components: u16,
}

impl Default for IceConfig {
    fn default() -> Self {
        IceConfig {
            compatibility: CompatibilityMode::Draft19,
            stun_server: None,
            stun_port: 3478,
            controlling: true,
            ice_udp: true,
            ice_tcp: true,
            port_range: None,
            relay_info: vec![],
            preferred_local_candidates: vec![],
            components: 2,
        }
    }
}

impl IceConfig {
    /// Check what can be checked before an agent exists.
    pub fn validate(&self) -> Result<(), IceError> {
        if self.components == 0 {
            return Err(IceError::Agent("Stream needs at least one component".into()));
        }

        for c in &self.preferred_local_candidates {
            if c.ip.is_none() {
                return Err(IceError::PreferredCandidate(
                    "You need to set an IP address".into(),
                ));
            }
            if c.port != 0 {
                return Err(IceError::PreferredCandidate(
                    "You can not set a port, only an IP".into(),
                ));
            }
            if *c.component_id != 0 {
                return Err(IceError::PreferredCandidate(
                    "You can not set a component".into(),
                ));
            }
            if c.kind != CandidateKind::Host {
                return Err(IceError::PreferredCandidate(
                    "Preferred local candidates must be of type host".into(),
                ));
            }
        }

        for r in &self.relay_info {
            r.validate()?;
        }

        Ok(())
    }

    /// The port range if it is usable.
    pub(crate) fn usable_port_range(&self) -> Option<(u16, u16)> {
        let r = self.port_range.as_ref()?;
        (*r.start() != 0 && r.start() < r.end()).then(|| (*r.start(), *r.end()))
    }
}
