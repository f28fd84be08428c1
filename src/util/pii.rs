//! Wrapper for values that identify a peer.
//!
//! Candidate addresses and ICE credentials are wrapped in `Pii` when logged
//! at debug level and above. With the `pii` feature enabled they print as
//! `{REDACTED}`. Trace logs are not wrapped.

use core::fmt;
use core::ops::Deref;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pii<T>(pub T);

impl<T: fmt::Display> fmt::Display for Pii<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "pii")]
        {
            write!(f, "{{REDACTED}}")
        }
        #[cfg(not(feature = "pii"))]
        {
            write!(f, "{}", self.0)
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pii<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "pii")]
        {
            write!(f, "{{REDACTED}}")
        }
        #[cfg(not(feature = "pii"))]
        {
            write!(f, "{:?}", self.0)
        }
    }
}

impl<T> Deref for Pii<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
