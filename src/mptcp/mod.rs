//! MPTCP option decoding (RFC 6824).
//!
//! The gateway never authenticates MPTCP handshakes. It only needs two
//! pieces of evidence from captured segments:
//!
//! - the sender key of an MP_CAPABLE option, from which the connection
//!   token is derived, and
//! - the receiver token of an MP_JOIN SYN, which names the connection a
//!   new subflow wants to join.
//!
//! The other subtypes are recognized and kept raw.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::error::{Error, ProtocolError, Result};
use crate::packet::tcpip::{TcpOption, TcpSegment};

/// TCP option kind assigned to MPTCP.
pub const OPTION_KIND_MPTCP: u8 = 30;

/// 64-bit key exchanged in MP_CAPABLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey(pub u64);

impl EndpointKey {
    /// Derive the 32-bit token identifying the connection.
    pub fn token(&self) -> EndpointToken {
        endpoint_key_to_token(*self)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// 32-bit connection token carried in MP_JOIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointToken(pub u32);

impl fmt::Display for EndpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// MPTCP option subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionSubtype {
    MpCapable,
    MpJoin,
    Dss,
    AddAddress,
    RemoveAddress,
    Priority,
    Fail,
    FastClose,
}

impl OptionSubtype {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::MpCapable),
            1 => Some(Self::MpJoin),
            2 => Some(Self::Dss),
            3 => Some(Self::AddAddress),
            4 => Some(Self::RemoveAddress),
            5 => Some(Self::Priority),
            6 => Some(Self::Fail),
            7 => Some(Self::FastClose),
            _ => None,
        }
    }
}

impl fmt::Display for OptionSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MpCapable => "MP_CAPABLE",
            Self::MpJoin => "MP_JOIN",
            Self::Dss => "DSS",
            Self::AddAddress => "ADD_ADDR",
            Self::RemoveAddress => "REMOVE_ADDR",
            Self::Priority => "MP_PRIO",
            Self::Fail => "MP_FAIL",
            Self::FastClose => "MP_FASTCLOSE",
        };
        f.write_str(name)
    }
}

/// The three MP_JOIN handshake messages, told apart by length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpJoin {
    /// SYN: names the connection to join.
    Syn {
        backup: bool,
        address_id: u8,
        receiver_token: EndpointToken,
        sender_random: u32,
    },
    /// SYN/ACK: truncated HMAC and the responder's random number.
    SynAck {
        backup: bool,
        address_id: u8,
        truncated_hmac: u64,
        sender_random: u32,
    },
    /// Third ACK: full 160-bit HMAC.
    Ack { hmac: [u8; 20] },
}

/// A decoded MPTCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MptcpOption {
    MpCapable {
        version: u8,
        flags: u8,
        sender_key: EndpointKey,
        receiver_key: Option<EndpointKey>,
    },
    MpJoin(MpJoin),
    /// Any other known subtype, kept undecoded.
    Raw {
        subtype: OptionSubtype,
        data: Vec<u8>,
    },
}

impl MptcpOption {
    pub fn subtype(&self) -> OptionSubtype {
        match self {
            Self::MpCapable { .. } => OptionSubtype::MpCapable,
            Self::MpJoin(_) => OptionSubtype::MpJoin,
            Self::Raw { subtype, .. } => *subtype,
        }
    }

    /// Decode the payload of a kind-30 TCP option.
    ///
    /// Returns `Ok(None)` for subtypes this decoder does not know.
    pub fn parse(option: &TcpOption<'_>) -> Result<Option<Self>> {
        let data = option.data;
        let Some(&first) = data.first() else {
            return Err(Error::Protocol(ProtocolError::MalformedOption {
                kind: option.kind,
                reason: "empty MPTCP option".into(),
            }));
        };

        let Some(subtype) = OptionSubtype::from_u8(first >> 4) else {
            return Ok(None);
        };

        let invalid = || {
            Error::Protocol(ProtocolError::InvalidMptcpLength {
                subtype,
                length: option.length,
            })
        };

        let decoded = match subtype {
            OptionSubtype::MpCapable => match option.length {
                12 => Self::MpCapable {
                    version: first & 0x0f,
                    flags: data[1],
                    sender_key: EndpointKey(read_u64(&data[2..10])),
                    receiver_key: None,
                },
                20 => Self::MpCapable {
                    version: first & 0x0f,
                    flags: data[1],
                    sender_key: EndpointKey(read_u64(&data[2..10])),
                    receiver_key: Some(EndpointKey(read_u64(&data[10..18]))),
                },
                _ => return Err(invalid()),
            },
            OptionSubtype::MpJoin => {
                let backup = first & 0x01 != 0;
                match option.length {
                    12 => Self::MpJoin(MpJoin::Syn {
                        backup,
                        address_id: data[1],
                        receiver_token: EndpointToken(read_u32(&data[2..6])),
                        sender_random: read_u32(&data[6..10]),
                    }),
                    16 => Self::MpJoin(MpJoin::SynAck {
                        backup,
                        address_id: data[1],
                        truncated_hmac: read_u64(&data[2..10]),
                        sender_random: read_u32(&data[10..14]),
                    }),
                    24 => {
                        let mut hmac = [0u8; 20];
                        hmac.copy_from_slice(&data[2..22]);
                        Self::MpJoin(MpJoin::Ack { hmac })
                    }
                    _ => return Err(invalid()),
                }
            }
            subtype => Self::Raw {
                subtype,
                data: data.to_vec(),
            },
        };

        Ok(Some(decoded))
    }
}

impl fmt::Display for MptcpOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MpCapable {
                version,
                sender_key,
                receiver_key,
                ..
            } => {
                write!(f, "MP_CAPABLE v{version} sender_key={sender_key} token={}", sender_key.token())?;
                if let Some(receiver_key) = receiver_key {
                    write!(f, " receiver_key={receiver_key}")?;
                }
                Ok(())
            }
            Self::MpJoin(MpJoin::Syn {
                address_id,
                receiver_token,
                ..
            }) => write!(f, "MP_JOIN SYN address_id={address_id} receiver_token={receiver_token}"),
            Self::MpJoin(MpJoin::SynAck { address_id, .. }) => {
                write!(f, "MP_JOIN SYN/ACK address_id={address_id}")
            }
            Self::MpJoin(MpJoin::Ack { .. }) => write!(f, "MP_JOIN ACK"),
            Self::Raw { subtype, data } => write!(f, "{subtype} ({} bytes)", data.len()),
        }
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Decode the first known MPTCP option of a raw IP packet.
pub fn decode(raw: &[u8]) -> Result<Option<MptcpOption>> {
    let segment = TcpSegment::parse(raw)?;
    for option in segment.options() {
        let option = option?;
        if option.kind != OPTION_KIND_MPTCP {
            continue;
        }
        if let Some(decoded) = MptcpOption::parse(&option)? {
            return Ok(Some(decoded));
        }
    }
    Ok(None)
}

/// Sender key of an MP_CAPABLE option, if the packet carries one.
pub fn sender_key(raw: &[u8]) -> Result<Option<EndpointKey>> {
    Ok(match decode(raw)? {
        Some(MptcpOption::MpCapable { sender_key, .. }) => Some(sender_key),
        _ => None,
    })
}

/// Receiver token of an MP_JOIN SYN, if the packet carries one.
pub fn receiver_token(raw: &[u8]) -> Result<Option<EndpointToken>> {
    Ok(match decode(raw)? {
        Some(MptcpOption::MpJoin(MpJoin::Syn { receiver_token, .. })) => Some(receiver_token),
        _ => None,
    })
}

/// Token of a key: the most significant 32 bits of SHA-1 over the
/// big-endian key.
pub fn endpoint_key_to_token(key: EndpointKey) -> EndpointToken {
    let digest = Sha1::digest(key.0.to_be_bytes());
    EndpointToken(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

/// Option encoders for tests and tooling.
pub mod build {
    use super::{EndpointKey, EndpointToken, OPTION_KIND_MPTCP};

    /// MP_CAPABLE with the sender key only (SYN, SYN/ACK).
    pub fn mp_capable(sender_key: EndpointKey) -> Vec<u8> {
        let mut out = vec![OPTION_KIND_MPTCP, 12, 0x00, 0x81];
        out.extend_from_slice(&sender_key.0.to_be_bytes());
        out
    }

    /// MP_CAPABLE carrying both keys (third ACK).
    pub fn mp_capable_ack(sender_key: EndpointKey, receiver_key: EndpointKey) -> Vec<u8> {
        let mut out = vec![OPTION_KIND_MPTCP, 20, 0x00, 0x81];
        out.extend_from_slice(&sender_key.0.to_be_bytes());
        out.extend_from_slice(&receiver_key.0.to_be_bytes());
        out
    }

    /// MP_JOIN SYN naming `token`.
    pub fn mp_join_syn(token: EndpointToken, address_id: u8, random: u32) -> Vec<u8> {
        let mut out = vec![OPTION_KIND_MPTCP, 12, 0x10, address_id];
        out.extend_from_slice(&token.0.to_be_bytes());
        out.extend_from_slice(&random.to_be_bytes());
        out
    }
}
