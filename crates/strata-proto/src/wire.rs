// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic packet framing and CBOR helpers.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR [`Envelope`](crate::Envelope) or [`Reply`](crate::Reply)
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{Envelope, Reply};

/// Protocol magic constant "STRA".
pub const MAGIC: [u8; 4] = *b"STRA";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero in version 1).
pub const FLAGS: u16 = 0x0000;
/// Header size in bytes.
pub const HEADER_LEN: usize = 12;
/// Trailing checksum size in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Framing and payload failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header or declared length require.
    #[error("short buffer: need {need} bytes, have {have}")]
    ShortBuffer {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },
    /// The first four bytes are not [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Header version differs from [`VERSION`].
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Checksum does not cover the header and payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Payload does not fit the 32-bit length field.
    #[error("payload of {0} bytes is too large")]
    Oversized(usize),
    /// CBOR encode or decode failure.
    #[error("cbor: {0}")]
    Cbor(String),
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Cbor(e.to_string()))?;
    Ok(out)
}

/// Decode from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Cbor(e.to_string()))
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header.
    pub header: [u8; HEADER_LEN],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Packet {
    /// Build a packet around a CBOR payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        let len = u32::try_from(payload.len()).map_err(|_| WireError::Oversized(payload.len()))?;
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&len.to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let checksum = *hasher.finalize().as_bytes();

        Ok(Packet {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenated packet bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }
}

/// Total packet size announced by a header, or `None` when fewer than
/// [`HEADER_LEN`] bytes are available.
pub fn frame_len(bytes: &[u8]) -> Option<usize> {
    let len = bytes.get(8..HEADER_LEN)?;
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    Some(HEADER_LEN + len + CHECKSUM_LEN)
}

/// Serialize `value` and frame it.
pub fn encode_packet<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(Packet::from_payload(to_cbor(value)?)?.into_bytes())
}

/// Verify and decode one packet from the front of `bytes`, returning the
/// value and the number of bytes consumed.
pub fn decode_packet<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), WireError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(WireError::ShortBuffer {
            need: HEADER_LEN + CHECKSUM_LEN,
            have: bytes.len(),
        });
    }
    if bytes[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let total = frame_len(bytes).ok_or(WireError::ShortBuffer {
        need: HEADER_LEN,
        have: bytes.len(),
    })?;
    if bytes.len() < total {
        return Err(WireError::ShortBuffer {
            need: total,
            have: bytes.len(),
        });
    }
    let body_end = total - CHECKSUM_LEN;
    let header = &bytes[0..HEADER_LEN];
    let payload = &bytes[HEADER_LEN..body_end];
    let checksum = &bytes[body_end..total];

    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    if hasher.finalize().as_bytes() != checksum {
        return Err(WireError::ChecksumMismatch);
    }

    Ok((from_cbor(payload)?, total))
}

/// Frame an [`Envelope`].
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, WireError> {
    encode_packet(env)
}

/// Decode an [`Envelope`] packet.
pub fn decode_envelope(bytes: &[u8]) -> Result<(Envelope, usize), WireError> {
    decode_packet(bytes)
}

/// Frame a [`Reply`].
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, WireError> {
    encode_packet(reply)
}

/// Decode a [`Reply`] packet.
pub fn decode_reply(bytes: &[u8]) -> Result<(Reply, usize), WireError> {
    decode_packet(bytes)
}
