//! Wire types for the X3DH key distribution protocol.
//!
//! Every message starts with a 3-byte header: protocol version, message
//! type, curve id. Bodies are fixed-layout big-endian binary; all key and
//! signature lengths derive from the curve named in the header.

pub mod codec;
pub mod error;

pub use codec::{Header, OneTimePreKey, PeerBundle, Request, Response, SignedPreKey};
pub use error::CodecError;

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 3;

/// Byte lengths of the five key/signature kinds for one curve family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySizes {
    pub x_pub: usize,
    pub x_priv: usize,
    pub ed_pub: usize,
    pub ed_priv: usize,
    pub sig: usize,
}

const CURVE25519_SIZES: KeySizes = KeySizes {
    x_pub: 32,
    x_priv: 32,
    ed_pub: 32,
    ed_priv: 32,
    sig: 64,
};

const CURVE448_SIZES: KeySizes = KeySizes {
    x_pub: 56,
    x_priv: 56,
    ed_pub: 57,
    ed_priv: 57,
    sig: 114,
};

/// Elliptic curve family a deployment exclusively serves.
///
/// Wire values shall stay in sync with the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CurveId {
    Curve25519 = 1,
    Curve448 = 2,
}

impl CurveId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Curve25519),
            2 => Some(Self::Curve448),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn sizes(self) -> &'static KeySizes {
        match self {
            Self::Curve25519 => &CURVE25519_SIZES,
            Self::Curve448 => &CURVE448_SIZES,
        }
    }
}

impl std::fmt::Display for CurveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Curve25519 => write!(f, "c25519"),
            Self::Curve448 => write!(f, "c448"),
        }
    }
}

/// Message type carried in the second header byte.
///
/// `0x00` (unset) and `0x01` (a long-deprecated identity-only
/// registration) are deliberately absent and rejected at decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    DeleteUser = 0x02,
    PostSignedPreKey = 0x03,
    PostOneTimePreKeys = 0x04,
    GetPeerBundles = 0x05,
    PeerBundles = 0x06,
    GetSelfOpkIds = 0x07,
    SelfOpkIds = 0x08,
    RegisterUser = 0x09,
    Error = 0xff,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::DeleteUser),
            0x03 => Some(Self::PostSignedPreKey),
            0x04 => Some(Self::PostOneTimePreKeys),
            0x05 => Some(Self::GetPeerBundles),
            0x06 => Some(Self::PeerBundles),
            0x07 => Some(Self::GetSelfOpkIds),
            0x08 => Some(Self::SelfOpkIds),
            0x09 => Some(Self::RegisterUser),
            0xff => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the six types a client may send.
    pub fn is_request(self) -> bool {
        !matches!(self, Self::PeerBundles | Self::SelfOpkIds | Self::Error)
    }
}

/// Wire error codes returned in the body of an `Error` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    BadContentType = 0x00,
    BadCurve = 0x01,
    MissingSenderId = 0x02,
    BadProtocolVersion = 0x03,
    BadSize = 0x04,
    UserAlreadyExists = 0x05,
    UserNotFound = 0x06,
    DatabaseError = 0x07,
    BadRequest = 0x08,
    ServerFailure = 0x09,
    ResourceLimitReached = 0x0a,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::BadContentType),
            0x01 => Some(Self::BadCurve),
            0x02 => Some(Self::MissingSenderId),
            0x03 => Some(Self::BadProtocolVersion),
            0x04 => Some(Self::BadSize),
            0x05 => Some(Self::UserAlreadyExists),
            0x06 => Some(Self::UserNotFound),
            0x07 => Some(Self::DatabaseError),
            0x08 => Some(Self::BadRequest),
            0x09 => Some(Self::ServerFailure),
            0x0a => Some(Self::ResourceLimitReached),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Per-peer flag in a `PeerBundles` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BundleFlag {
    NoOpk = 0,
    Opk = 1,
    NoBundle = 2,
}

impl BundleFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoOpk),
            1 => Some(Self::Opk),
            2 => Some(Self::NoBundle),
            _ => None,
        }
    }
}
