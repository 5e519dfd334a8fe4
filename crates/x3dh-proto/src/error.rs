use thiserror::Error;

/// Faults raised while decoding an untrusted X3DH payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("message type {0:#04x} is not a request")]
    NotARequest(u8),

    #[error("unknown curve id {0}")]
    UnknownCurve(u8),

    #[error("declared {declared} one-time prekeys, server cap is {cap}")]
    OpkQuotaExceeded { declared: u16, cap: u16 },

    #[error("peer bundle request names no peers")]
    NoPeers,

    #[error("peer id list truncated or inconsistent with declared count")]
    MalformedPeerList,

    #[error("peer id is not valid UTF-8")]
    MalformedPeerId,

    #[error("unknown key bundle flag {0}")]
    UnknownBundleFlag(u8),
}
