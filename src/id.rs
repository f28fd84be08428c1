#![allow(missing_docs)]

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! num_id {
    ($id:ident, $t:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $id($t);

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

num_id!(Pt, u8);
num_id!(Ssrc, u32);
num_id!(StreamId, u32);
num_id!(AgentStreamId, u32);
num_id!(ComponentId, u16);
num_id!(BinId, u64);

impl Pt {
    /// Highest RTP payload type.
    pub const MAX: u8 = 127;

    /// First payload type of the dynamic range.
    pub const DYNAMIC_MIN: u8 = 96;

    /// Whether this payload type is in the dynamic range `[96, 127]`.
    pub fn is_dynamic(&self) -> bool {
        self.0 >= Self::DYNAMIC_MIN && self.0 <= Self::MAX
    }

    /// Whether the value fits in the 7 bit PT field.
    pub fn is_valid(&self) -> bool {
        self.0 <= Self::MAX
    }
}

impl Ssrc {
    pub fn new() -> Self {
        Ssrc(fastrand::u32(..))
    }
}

impl ComponentId {
    /// Component carrying RTP.
    pub const RTP: ComponentId = ComponentId(1);
    /// Component carrying RTCP.
    pub const RTCP: ComponentId = ComponentId(2);
}

impl BinId {
    /// Sequential handle for graph bins. Handles are never reused inside one
    /// process.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        BinId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
