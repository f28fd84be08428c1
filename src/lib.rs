//! Codec negotiation and RTP session plumbing for audio/video conferencing.
//!
//! The crate is the decision layer of a conferencing stack. It works out
//! which codecs a local endpoint and its remotes can use, keeps one
//! association table per media session, and tells a streaming framework
//! what to build: encoder and decoder bins, capsfilters, DTMF and comfort
//! noise sources. Element construction, pad linking and the network belong
//! to the framework and to an external ICE agent.
//!
//! # Model
//!
//! * A [`Session`] handles one media type. It owns the codec table, the
//!   send path and the substreams (incoming SSRCs).
//! * A [`Participant`] is a remote identified by its CNAME.
//! * A [`Stream`] ties a participant to a session. It carries the remote
//!   codecs and an ICE transmitter.
//!
//! The framework is reached through [`MediaGraph`]. Installed element
//! factories are read through [`ElementRegistry`] and turned into
//! [`Blueprint`]s by a [`BlueprintRegistry`]. ICE agents come from an
//! [`AgentFactory`].
//!
//! # Threads
//!
//! Handles are `Send + Sync`. Calls from the application take effect right
//! away. Whatever the framework reports (pads, SDES, caps, element messages)
//! is queued and handled by [`Session::process_pending`]. The send path and
//! the discovery path are only rebuilt from there, after the framework has
//! blocked them.
//!
//! Notifications are polled with [`Session::poll_event`]. Errors after a
//! call returned are reported as [`Event::Error`]. Error kinds below 100 are
//! fatal to the object that reported them.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use rtpconf::*;
//! # fn run(registry: &BlueprintRegistry, graph: Arc<dyn MediaGraph>, factory: Arc<dyn AgentFactory>) -> Result<(), ConfError> {
//! let session = Session::new(SessionConfig::new(MediaType::Audio), registry, graph)?;
//!
//! // What to put in the offer.
//! let offer = session.codecs_without_config();
//!
//! let bob = Participant::new("bob@example.com", factory);
//! let stream = session.new_stream(&bob, Direction::SendRecv)?;
//! stream.set_transmitter(IceConfig::default())?;
//!
//! // The answer came back.
//! stream.set_remote_codecs(offer)?;
//!
//! loop {
//!     session.process_pending();
//!     match session.poll_event() {
//!         Some(Event::SendCodecChanged { codec, .. }) => println!("sending {}", codec),
//!         Some(_) => {}
//!         None => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! The crate logs through [`tracing`][tracing]. Remote addresses, CNAMEs
//! and credentials are wrapped so they can be redacted with the `pii`
//! feature.
//!
//! [tracing]: https://docs.rs/tracing
#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::bool_to_int_with_if)]
#![allow(clippy::assertions_on_constants)]
#![allow(clippy::manual_range_contains)]
#![allow(clippy::get_first)]

#[macro_use]
extern crate tracing;

mod id;
pub use id::{AgentStreamId, BinId, ComponentId, Pt, Ssrc, StreamId};

mod error;
pub use error::{ConfError, ErrorKind};

pub mod codec;
pub use codec::{Caps, CapsValue, Codec, CodecId, MediaType, Structure};

mod dir;
pub use dir::Direction;

mod util;

mod blueprint;
pub use blueprint::{Blueprint, BlueprintRegistry, ElementFactory, ElementRegistry, FactoryKind};

mod assoc;
pub use assoc::{AssociationTable, CodecAssociation};

mod graph;
pub use graph::{BinSource, DecryptKeys, GraphError, MediaGraph};
pub use graph::{ProfileError, ProfileInspector, ProfileShape};

mod nego;
pub use nego::CodecPreference;

mod hdrext;
pub use hdrext::HeaderExtension;

mod dtmf;
pub use dtmf::{DtmfEvent, DtmfMethod};

mod bus;
pub use bus::{ErrorSource, Event};

mod srtp;
pub use srtp::{EncryptionParameters, SrtpAuth, SrtpCipher, SrtpParams};

pub mod ice;
pub use ice::{AgentFactory, Candidate, IceAgent};

mod keyunit;
pub use keyunit::{KeyUnitFeedback, KEYUNIT_INTERVAL};

mod bitrate;
pub use bitrate::{caps_from_bitrate, restrict_caps, ADAPTER_INTERVAL};

mod tfrc;
pub use tfrc::{TfrcReport, RTT_SENDTS_URI};

mod config;
pub use config::{IceConfig, SessionConfig, DEFAULT_NO_RTCP_TIMEOUT};

mod special;
pub use special::SpecialSourceKind;

mod substream;

mod participant;
pub use participant::Participant;

mod stream;
pub use stream::Stream;

mod session;
pub use session::{ElementMessage, Session};
