//! Error kinds reported synchronously and on the bus.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CapsError;
use crate::graph::GraphError;
use crate::ice::IceError;

/// Closed set of error kinds.
///
/// Codes below 100 are fatal: the object that reported them is corrupt and
/// should be discarded. Everything from 100 and up leaves state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The object could not be built.
    Construction,
    /// Internal state is broken.
    Internal,
    /// A caller passed something we can not use.
    InvalidArguments,
    /// Transport level failure.
    Network,
    /// The transmitter lacks the feature.
    NotImplemented,
    /// Local and remote codecs have no intersection.
    NegotiationFailed,
    /// A payload type arrived that is not negotiated.
    UnknownCodec,
    /// No codec could be found at all.
    NoCodecs,
    /// The configuration leaves no usable codec.
    NoCodecsLeft,
    /// Connectivity was lost after having been established.
    ConnectionFailed,
    /// The object was disposed.
    Disposed,
    /// The thing being added already exists.
    AlreadyExists,
}

impl ErrorKind {
    /// Numeric code for the kind.
    pub fn code(&self) -> u32 {
        use ErrorKind::*;
        match self {
            Construction => 1,
            Internal => 2,
            InvalidArguments => 100,
            Network => 101,
            NotImplemented => 102,
            NegotiationFailed => 103,
            UnknownCodec => 104,
            NoCodecs => 105,
            NoCodecsLeft => 106,
            ConnectionFailed => 107,
            Disposed => 108,
            AlreadyExists => 109,
        }
    }

    /// Fatal errors mean the reporting object must be discarded.
    pub fn is_fatal(&self) -> bool {
        self.code() < 100
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;
        let s = match self {
            Construction => "construction",
            Internal => "internal",
            InvalidArguments => "invalid-arguments",
            Network => "network",
            NotImplemented => "not-implemented",
            NegotiationFailed => "negotiation-failed",
            UnknownCodec => "unknown-codec",
            NoCodecs => "no-codecs",
            NoCodecsLeft => "no-codecs-left",
            ConnectionFailed => "connection-failed",
            Disposed => "disposed",
            AlreadyExists => "already-exists",
        };
        write!(f, "{}", s)
    }
}

/// Error value returned by sessions, streams and transmitters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ConfError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl ConfError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ConfError {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn construction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Construction, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    pub(crate) fn negotiation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NegotiationFailed, message)
    }

    pub(crate) fn disposed() -> Self {
        Self::new(ErrorKind::Disposed, "Called function after object disposed")
    }

    /// Whether the kind is fatal.
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl From<CapsError> for ConfError {
    fn from(e: CapsError) -> Self {
        ConfError::invalid(e.to_string())
    }
}

impl From<GraphError> for ConfError {
    fn from(e: GraphError) -> Self {
        ConfError::construction(e.to_string())
    }
}

impl From<IceError> for ConfError {
    fn from(e: IceError) -> Self {
        ConfError::new(e.kind(), e.to_string())
    }
}
