//! H.264 `profile-level-id` handling (RFC 6184 section 8.1).

use std::fmt;

/// Parsed `profile-level-id`: three bytes, hex encoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ProfileLevelId {
    profile_idc: u8,
    profile_iop: u8,
    level_idc: u8,
}

impl ProfileLevelId {
    pub(crate) fn parse(v: &str) -> Option<Self> {
        if v.len() != 6 || !v.is_ascii() {
            return None;
        }
        let value = u32::from_str_radix(v, 16).ok()?;
        let bytes = value.to_be_bytes();

        Some(ProfileLevelId {
            profile_idc: bytes[1],
            profile_iop: bytes[2],
            level_idc: bytes[3],
        })
    }

    /// Negotiated profile level. The profile idc must agree, the constraint
    /// flags are merged and the lowest level is kept.
    pub(crate) fn negotiate(&self, other: &ProfileLevelId) -> Option<ProfileLevelId> {
        if self.profile_idc != other.profile_idc {
            return None;
        }

        Some(ProfileLevelId {
            profile_idc: self.profile_idc,
            profile_iop: self.profile_iop | other.profile_iop,
            level_idc: self.level_idc.min(other.level_idc),
        })
    }

    /// Profile name for logging.
    pub(crate) fn profile_name(&self) -> &'static str {
        // constraint_set1_flag
        const SET1: u8 = 0x40;

        match self.profile_idc {
            66 if self.profile_iop & SET1 != 0 => "constrained-baseline",
            66 => "baseline",
            77 => "main",
            88 => "extended",
            100 => "high",
            110 => "high-10",
            122 => "high-4:2:2",
            244 => "high-4:4:4",
            44 => "cavlc-4:4:4-intra",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ProfileLevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}{:02X}{:02X}",
            self.profile_idc, self.profile_iop, self.level_idc
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_format() {
        let p = ProfileLevelId::parse("42e01f").unwrap();
        assert_eq!(p.to_string(), "42E01F");
        assert_eq!(p.profile_name(), "constrained-baseline");
        assert!(ProfileLevelId::parse("42e0").is_none());
        assert!(ProfileLevelId::parse("zz0000").is_none());
    }

    #[test]
    fn negotiate_min_level() {
        let local = ProfileLevelId::parse("42E015").unwrap();
        let remote = ProfileLevelId::parse("420014").unwrap();
        assert_eq!(local.negotiate(&remote).unwrap().to_string(), "42E014");
    }

    #[test]
    fn negotiate_idc_mismatch() {
        let a = ProfileLevelId::parse("42E015").unwrap();
        let b = ProfileLevelId::parse("640015").unwrap();
        assert!(a.negotiate(&b).is_none());
    }
}
