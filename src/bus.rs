//! Notifications to the application.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{Caps, Codec};
use crate::dtmf::DtmfMethod;
use crate::error::ErrorKind;
use crate::ice::{Candidate, ComponentState};
use crate::id::{ComponentId, Ssrc, StreamId};

/// Object an error is reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Session,
    Stream(StreamId),
}

/// Events produced by a session and its streams.
///
/// Drained with [`crate::Session::poll_event`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// Something went wrong. Fatal kinds mean the source must be discarded.
    Error {
        source: ErrorSource,
        kind: ErrorKind,
        message: String,
    },

    /// The session codec list changed.
    CodecsChanged,

    /// A new send codec is active. Secondary codecs are served by extra
    /// source pads of the same codec bin.
    SendCodecChanged {
        codec: Codec,
        secondary_codecs: Vec<Codec>,
    },

    TelephonyEventStarted {
        method: DtmfMethod,
        event: u8,
        volume: u8,
    },

    TelephonyEventStopped {
        method: DtmfMethod,
    },

    /// An incoming SSRC is decoded and belongs to a stream.
    SrcPadAdded {
        stream: StreamId,
        ssrc: Ssrc,
        codec: Codec,
        caps: Caps,
    },

    NewLocalCandidate {
        stream: StreamId,
        candidate: Candidate,
    },

    NewActiveCandidatePair {
        stream: StreamId,
        local: Candidate,
        remote: Candidate,
    },

    /// All local candidates have been reported.
    LocalCandidatesPrepared {
        stream: StreamId,
    },

    ComponentStateChanged {
        stream: StreamId,
        component: ComponentId,
        state: ComponentState,
    },

    /// The codecs a stream receives changed.
    RecvCodecsChanged {
        stream: StreamId,
        codecs: Vec<Codec>,
    },
}

impl Event {
    pub(crate) fn error(source: ErrorSource, kind: ErrorKind, message: impl Into<String>) -> Self {
        Event::Error {
            source,
            kind,
            message: message.into(),
        }
    }
}

/// Ordered event queue shared by a session, its streams and their
/// transmitters.
#[derive(Debug, Clone, Default)]
pub(crate) struct Bus(Arc<Mutex<VecDeque<Event>>>);

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        trace!("Bus event: {:?}", event);
        self.0.lock().push_back(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = Event>) {
        let mut q = self.0.lock();
        for e in events {
            trace!("Bus event: {:?}", e);
            q.push_back(e);
        }
    }

    pub fn poll(&self) -> Option<Event> {
        self.0.lock().pop_front()
    }
}
