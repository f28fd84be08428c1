//! Encryption parameters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfError;

/// Name of the only supported parameter record.
pub const SRTP_RECORD: &str = "FarstreamSRTP";

/// Loosely typed encryption parameters as supplied by the application.
///
/// Per-direction fields default from `cipher` and `auth`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    pub name: String,
    pub cipher: Option<String>,
    pub rtp_cipher: Option<String>,
    pub rtcp_cipher: Option<String>,
    pub auth: Option<String>,
    pub rtp_auth: Option<String>,
    pub rtcp_auth: Option<String>,
    pub key: Option<Vec<u8>>,
    pub replay_window_size: Option<u32>,
}

impl EncryptionParameters {
    /// An SRTP record with the same cipher and auth for RTP and RTCP.
    pub fn srtp(cipher: &str, auth: &str, key: &[u8]) -> Self {
        EncryptionParameters {
            name: SRTP_RECORD.to_string(),
            cipher: Some(cipher.to_string()),
            auth: Some(auth.to_string()),
            key: Some(key.to_vec()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpCipher {
    Null,
    Aes128Icm,
    Aes256Icm,
}

impl SrtpCipher {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "null" => Some(SrtpCipher::Null),
            "aes-128-icm" => Some(SrtpCipher::Aes128Icm),
            "aes-256-icm" => Some(SrtpCipher::Aes256Icm),
            _ => None,
        }
    }

    /// Master key plus salt length.
    fn key_len(&self) -> Option<usize> {
        match self {
            SrtpCipher::Null => None,
            SrtpCipher::Aes128Icm => Some(30),
            SrtpCipher::Aes256Icm => Some(46),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpAuth {
    Null,
    HmacSha1_32,
    HmacSha1_80,
}

impl SrtpAuth {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "null" => Some(SrtpAuth::Null),
            "hmac-sha1-32" => Some(SrtpAuth::HmacSha1_32),
            "hmac-sha1-80" => Some(SrtpAuth::HmacSha1_80),
            _ => None,
        }
    }
}

/// Validated SRTP parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtpParams {
    pub rtp_cipher: SrtpCipher,
    pub rtcp_cipher: SrtpCipher,
    pub rtp_auth: SrtpAuth,
    pub rtcp_auth: SrtpAuth,
    pub key: Vec<u8>,
    pub replay_window_size: u32,
}

// Keys stay out of logs.
impl fmt::Debug for SrtpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpParams")
            .field("rtp_cipher", &self.rtp_cipher)
            .field("rtcp_cipher", &self.rtcp_cipher)
            .field("rtp_auth", &self.rtp_auth)
            .field("rtcp_auth", &self.rtcp_auth)
            .field("key_len", &self.key.len())
            .field("replay_window_size", &self.replay_window_size)
            .finish()
    }
}

const REPLAY_WINDOW_DEFAULT: u32 = 128;
const REPLAY_WINDOW_MIN: u32 = 64;
const REPLAY_WINDOW_MAX: u32 = 32767;

impl SrtpParams {
    /// A pass-through configuration.
    pub fn null() -> Self {
        SrtpParams {
            rtp_cipher: SrtpCipher::Null,
            rtcp_cipher: SrtpCipher::Null,
            rtp_auth: SrtpAuth::Null,
            rtcp_auth: SrtpAuth::Null,
            key: vec![],
            replay_window_size: REPLAY_WINDOW_DEFAULT,
        }
    }

    /// Validate what the application supplied.
    pub fn validate(p: &EncryptionParameters) -> Result<SrtpParams, ConfError> {
        if p.name != SRTP_RECORD {
            return Err(ConfError::invalid(format!(
                "Unknown encryption parameters: {}",
                p.name
            )));
        }

        // Without a cipher the payload is only authenticated.
        let cipher = |specific: &Option<String>| -> Result<SrtpCipher, ConfError> {
            match specific.as_deref().or(p.cipher.as_deref()) {
                Some(s) => {
                    SrtpCipher::parse(s).ok_or_else(|| ConfError::invalid(format!("Unknown cipher: {}", s)))
                }
                None => Ok(SrtpCipher::Null),
            }
        };

        let auth = |specific: &Option<String>, which: &str| -> Result<SrtpAuth, ConfError> {
            let s = specific
                .as_deref()
                .or(p.auth.as_deref())
                .ok_or_else(|| ConfError::invalid(format!("No {} auth", which)))?;
            SrtpAuth::parse(s).ok_or_else(|| ConfError::invalid(format!("Unknown auth: {}", s)))
        };

        let rtp_cipher = cipher(&p.rtp_cipher)?;
        let rtcp_cipher = cipher(&p.rtcp_cipher)?;
        let rtp_auth = auth(&p.rtp_auth, "rtp")?;
        let rtcp_auth = auth(&p.rtcp_auth, "rtcp")?;

        let key = p
            .key
            .clone()
            .ok_or_else(|| ConfError::invalid("Encryption key is required"))?;

        for c in [rtp_cipher, rtcp_cipher] {
            if let Some(len) = c.key_len() {
                if key.len() != len {
                    return Err(ConfError::invalid(format!(
                        "Key of {} bytes, {:?} needs {}",
                        key.len(),
                        c,
                        len
                    )));
                }
            }
        }

        let replay_window_size = p.replay_window_size.unwrap_or(REPLAY_WINDOW_DEFAULT);
        if !(REPLAY_WINDOW_MIN..=REPLAY_WINDOW_MAX).contains(&replay_window_size) {
            return Err(ConfError::invalid(format!(
                "Replay window size {} out of range",
                replay_window_size
            )));
        }

        Ok(SrtpParams {
            rtp_cipher,
            rtcp_cipher,
            rtp_auth,
            rtcp_auth,
            key,
            replay_window_size,
        })
    }
}
