//! Encode/decode of X3DH messages.
//!
//! Request payloads come from untrusted clients, so every read is
//! bounds-checked before the buffer is indexed. Lengths of key material
//! are fixed by the curve in the header; only counts and ids vary.

use crate::error::CodecError;
use crate::{BundleFlag, CurveId, ErrorCode, MessageType, HEADER_SIZE, PROTOCOL_VERSION};

/// The 3-byte header present on every message.
///
/// Fields are kept raw: version and curve are validated by the server
/// against its own configuration before the type byte is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: u8,
    pub curve_id: u8,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        Ok(Self {
            version: buf[0],
            message_type: buf[1],
            curve_id: buf[2],
        })
    }
}

/// A signed pre-key as carried on the wire: key, signature under the
/// owner's identity key, and the caller-chosen id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKey {
    pub key: Vec<u8>,
    pub signature: Vec<u8>,
    pub id: u32,
}

/// A one-time pre-key and its caller-chosen id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePreKey {
    pub key: Vec<u8>,
    pub id: u32,
}

/// Key bundle served for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBundle {
    pub ik: Vec<u8>,
    pub spk: SignedPreKey,
    pub opk: Option<OneTimePreKey>,
}

/// A decoded client request (header excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RegisterUser {
        ik: Vec<u8>,
        spk: SignedPreKey,
        opks: Vec<OneTimePreKey>,
    },
    DeleteUser,
    PostSignedPreKey(SignedPreKey),
    PostOneTimePreKeys(Vec<OneTimePreKey>),
    GetPeerBundles(Vec<String>),
    GetSelfOpkIds,
}

/// Cursor over an untrusted buffer. Every accessor reports the total
/// byte count the message would need, so error messages stay useful.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated {
            needed: usize::MAX,
            have: self.buf.len(),
        })?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated {
                needed: end,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_be(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl Request {
    /// Decode a request body (the bytes after the header).
    ///
    /// `opk_cap` bounds the declared one-time-prekey count for
    /// `RegisterUser` and `PostOneTimePreKeys`; it is enforced before any
    /// key bytes are read, so an abusive count is rejected without
    /// parsing the (possibly huge) remainder. `0` disables the cap.
    /// Trailing bytes beyond the decoded layout are ignored.
    pub fn decode(
        message_type: MessageType,
        curve: CurveId,
        body: &[u8],
        opk_cap: u16,
    ) -> Result<Self, CodecError> {
        let sizes = curve.sizes();
        match message_type {
            MessageType::RegisterUser => {
                // Fixed part: Ik | SPk | SPkSig | SPkId | OPk count.
                let fixed = sizes.ed_pub + sizes.x_pub + sizes.sig + 4 + 2;
                if body.len() < fixed {
                    return Err(CodecError::Truncated {
                        needed: fixed,
                        have: body.len(),
                    });
                }
                let declared =
                    u16::from_be_bytes([body[fixed - 2], body[fixed - 1]]);
                if opk_cap > 0 && declared > opk_cap {
                    return Err(CodecError::OpkQuotaExceeded {
                        declared,
                        cap: opk_cap,
                    });
                }
                let total = fixed + usize::from(declared) * (sizes.x_pub + 4);
                if body.len() < total {
                    return Err(CodecError::Truncated {
                        needed: total,
                        have: body.len(),
                    });
                }

                let mut r = Reader::new(body);
                let ik = r.take(sizes.ed_pub)?.to_vec();
                let spk = decode_signed_prekey(&mut r, curve)?;
                let declared = r.u16_be()?;
                let opks = decode_opk_list(&mut r, curve, declared)?;
                Ok(Self::RegisterUser { ik, spk, opks })
            }
            MessageType::DeleteUser => Ok(Self::DeleteUser),
            MessageType::PostSignedPreKey => {
                let mut r = Reader::new(body);
                Ok(Self::PostSignedPreKey(decode_signed_prekey(&mut r, curve)?))
            }
            MessageType::PostOneTimePreKeys => {
                let mut r = Reader::new(body);
                let declared = r.u16_be()?;
                if opk_cap > 0 && declared > opk_cap {
                    return Err(CodecError::OpkQuotaExceeded {
                        declared,
                        cap: opk_cap,
                    });
                }
                Ok(Self::PostOneTimePreKeys(decode_opk_list(
                    &mut r, curve, declared,
                )?))
            }
            MessageType::GetPeerBundles => decode_peer_id_list(body),
            MessageType::GetSelfOpkIds => Ok(Self::GetSelfOpkIds),
            MessageType::PeerBundles | MessageType::SelfOpkIds | MessageType::Error => {
                Err(CodecError::NotARequest(message_type.as_u8()))
            }
        }
    }
}

impl Request {
    /// Encode a full request message, header included. This is the
    /// client-side counterpart of [`Request::decode`].
    pub fn encode(&self, curve: CurveId) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 16);
        out.push(PROTOCOL_VERSION);
        out.push(self.message_type().as_u8());
        out.push(curve.as_u8());
        match self {
            Self::RegisterUser { ik, spk, opks } => {
                out.extend_from_slice(ik);
                encode_signed_prekey(&mut out, spk);
                encode_opk_list(&mut out, opks);
            }
            Self::DeleteUser | Self::GetSelfOpkIds => {}
            Self::PostSignedPreKey(spk) => encode_signed_prekey(&mut out, spk),
            Self::PostOneTimePreKeys(opks) => encode_opk_list(&mut out, opks),
            Self::GetPeerBundles(peers) => {
                out.extend_from_slice(&(peers.len() as u16).to_be_bytes());
                for peer in peers {
                    out.extend_from_slice(&(peer.len() as u16).to_be_bytes());
                    out.extend_from_slice(peer.as_bytes());
                }
            }
        }
        out
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RegisterUser { .. } => MessageType::RegisterUser,
            Self::DeleteUser => MessageType::DeleteUser,
            Self::PostSignedPreKey(_) => MessageType::PostSignedPreKey,
            Self::PostOneTimePreKeys(_) => MessageType::PostOneTimePreKeys,
            Self::GetPeerBundles(_) => MessageType::GetPeerBundles,
            Self::GetSelfOpkIds => MessageType::GetSelfOpkIds,
        }
    }
}

fn encode_signed_prekey(out: &mut Vec<u8>, spk: &SignedPreKey) {
    out.extend_from_slice(&spk.key);
    out.extend_from_slice(&spk.signature);
    out.extend_from_slice(&spk.id.to_be_bytes());
}

fn encode_opk_list(out: &mut Vec<u8>, opks: &[OneTimePreKey]) {
    out.extend_from_slice(&(opks.len() as u16).to_be_bytes());
    for opk in opks {
        out.extend_from_slice(&opk.key);
        out.extend_from_slice(&opk.id.to_be_bytes());
    }
}

fn decode_signed_prekey(r: &mut Reader<'_>, curve: CurveId) -> Result<SignedPreKey, CodecError> {
    let sizes = curve.sizes();
    Ok(SignedPreKey {
        key: r.take(sizes.x_pub)?.to_vec(),
        signature: r.take(sizes.sig)?.to_vec(),
        id: r.u32_be()?,
    })
}

fn decode_opk_list(
    r: &mut Reader<'_>,
    curve: CurveId,
    count: u16,
) -> Result<Vec<OneTimePreKey>, CodecError> {
    let sizes = curve.sizes();
    let mut opks = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        opks.push(OneTimePreKey {
            key: r.take(sizes.x_pub)?.to_vec(),
            id: r.u32_be()?,
        });
    }
    Ok(opks)
}

/// Peer id list faults are all reported as malformed-request rather than
/// bad-size: the declared count and the id lengths drive the layout, so
/// any inconsistency means the request itself is ill-formed.
fn decode_peer_id_list(body: &[u8]) -> Result<Request, CodecError> {
    let mut r = Reader::new(body);
    let count = r.u16_be().map_err(|_| CodecError::MalformedPeerList)?;
    if count == 0 {
        return Err(CodecError::NoPeers);
    }
    let mut peers = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = r.u16_be().map_err(|_| CodecError::MalformedPeerList)?;
        let raw = r
            .take(usize::from(len))
            .map_err(|_| CodecError::MalformedPeerList)?;
        let id = std::str::from_utf8(raw).map_err(|_| CodecError::MalformedPeerId)?;
        peers.push(id.to_owned());
    }
    Ok(Request::GetPeerBundles(peers))
}

/// A server response, encoded with the standard header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Empty body echoing the request's message type; acknowledges a
    /// mutating operation.
    Ack(MessageType),
    /// One entry per requested peer, in request order. `None` means no
    /// usable bundle exists for that id.
    PeerBundles(Vec<(String, Option<PeerBundle>)>),
    SelfOpkIds(Vec<u32>),
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn encode(&self, curve: CurveId) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 16);
        out.push(PROTOCOL_VERSION);
        out.push(self.message_type().as_u8());
        out.push(curve.as_u8());
        match self {
            Self::Ack(_) => {}
            Self::PeerBundles(entries) => {
                out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
                for (peer_id, bundle) in entries {
                    out.extend_from_slice(&(peer_id.len() as u16).to_be_bytes());
                    out.extend_from_slice(peer_id.as_bytes());
                    match bundle {
                        None => out.push(BundleFlag::NoBundle as u8),
                        Some(b) => {
                            let flag = if b.opk.is_some() {
                                BundleFlag::Opk
                            } else {
                                BundleFlag::NoOpk
                            };
                            out.push(flag as u8);
                            out.extend_from_slice(&b.ik);
                            out.extend_from_slice(&b.spk.key);
                            out.extend_from_slice(&b.spk.id.to_be_bytes());
                            out.extend_from_slice(&b.spk.signature);
                            if let Some(opk) = &b.opk {
                                out.extend_from_slice(&opk.key);
                                out.extend_from_slice(&opk.id.to_be_bytes());
                            }
                        }
                    }
                }
            }
            Self::SelfOpkIds(ids) => {
                out.extend_from_slice(&(ids.len() as u16).to_be_bytes());
                for id in ids {
                    out.extend_from_slice(&id.to_be_bytes());
                }
            }
            Self::Error { code, message } => {
                out.push(code.as_u8());
                out.extend_from_slice(message.as_bytes());
            }
        }
        out
    }

    fn message_type(&self) -> MessageType {
        match self {
            Self::Ack(echoed) => *echoed,
            Self::PeerBundles(_) => MessageType::PeerBundles,
            Self::SelfOpkIds(_) => MessageType::SelfOpkIds,
            Self::Error { .. } => MessageType::Error,
        }
    }
}

/// Client-side decode of a `PeerBundles` response body.
pub fn decode_peer_bundles(
    curve: CurveId,
    body: &[u8],
) -> Result<Vec<(String, Option<PeerBundle>)>, CodecError> {
    let sizes = curve.sizes();
    let mut r = Reader::new(body);
    let count = r.u16_be()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = r.u16_be()?;
        let raw = r.take(usize::from(len))?;
        let peer_id = std::str::from_utf8(raw)
            .map_err(|_| CodecError::MalformedPeerId)?
            .to_owned();
        let flag_byte = r.u8()?;
        let flag =
            BundleFlag::from_u8(flag_byte).ok_or(CodecError::UnknownBundleFlag(flag_byte))?;
        if flag == BundleFlag::NoBundle {
            entries.push((peer_id, None));
            continue;
        }
        let ik = r.take(sizes.ed_pub)?.to_vec();
        let key = r.take(sizes.x_pub)?.to_vec();
        let id = r.u32_be()?;
        let signature = r.take(sizes.sig)?.to_vec();
        let opk = if flag == BundleFlag::Opk {
            Some(OneTimePreKey {
                key: r.take(sizes.x_pub)?.to_vec(),
                id: r.u32_be()?,
            })
        } else {
            None
        };
        entries.push((
            peer_id,
            Some(PeerBundle {
                ik,
                spk: SignedPreKey { key, signature, id },
                opk,
            }),
        ));
    }
    Ok(entries)
}

/// Client-side decode of a `SelfOpkIds` response body.
pub fn decode_self_opk_ids(body: &[u8]) -> Result<Vec<u32>, CodecError> {
    let mut r = Reader::new(body);
    let count = r.u16_be()?;
    let mut ids = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        ids.push(r.u32_be()?);
    }
    Ok(ids)
}
