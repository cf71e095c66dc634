//! IPv4/IPv6 and TCP header access.
//!
//! Only what the core needs: the TCP endpoints of a packet and its option
//! list. Payload and checksums are never touched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, ProtocolError, Result};

/// IP protocol number of TCP.
pub const IPPROTO_TCP: u8 = 6;

const TCP_MIN_HEADER: usize = 20;

const OPTION_EOL: u8 = 0;
const OPTION_NOP: u8 = 1;

fn malformed(reason: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError::MalformedPacket(reason.into()))
}

/// A TCP segment inside a raw IP packet.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    /// Source transport address.
    pub src: SocketAddr,
    /// Destination transport address.
    pub dst: SocketAddr,
    /// TCP flag byte (CWR..FIN).
    pub flags: u8,
    /// Raw option bytes between the fixed header and the payload.
    options: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Parse the IP and TCP headers of a raw packet.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(malformed("empty packet"));
        }

        let (src_ip, dst_ip, offset) = match data[0] >> 4 {
            4 => Self::parse_ipv4(data)?,
            6 => Self::parse_ipv6(data)?,
            v => return Err(Error::Protocol(ProtocolError::UnsupportedIpVersion(v))),
        };

        if data.len() < offset + TCP_MIN_HEADER {
            return Err(malformed("TCP header truncated"));
        }
        let tcp = &data[offset..];

        let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
        let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
        let data_offset = ((tcp[12] >> 4) as usize) * 4;
        let flags = tcp[13];

        if data_offset < TCP_MIN_HEADER || tcp.len() < data_offset {
            return Err(Error::Protocol(ProtocolError::MalformedHeader));
        }

        Ok(Self {
            src: SocketAddr::new(src_ip, src_port),
            dst: SocketAddr::new(dst_ip, dst_port),
            flags,
            options: &tcp[TCP_MIN_HEADER..data_offset],
        })
    }

    fn parse_ipv4(data: &[u8]) -> Result<(IpAddr, IpAddr, usize)> {
        if data.len() < 20 {
            return Err(malformed("IPv4 packet too short"));
        }

        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < 20 || data.len() < header_len {
            return Err(malformed("IPv4 header truncated"));
        }

        let protocol = data[9];
        if protocol != IPPROTO_TCP {
            return Err(Error::Protocol(ProtocolError::NotTcp(protocol)));
        }

        let src = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
        let dst = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
        Ok((src, dst, header_len))
    }

    fn parse_ipv6(data: &[u8]) -> Result<(IpAddr, IpAddr, usize)> {
        if data.len() < 40 {
            return Err(malformed("IPv6 packet too short"));
        }

        let mut src_bytes = [0u8; 16];
        let mut dst_bytes = [0u8; 16];
        src_bytes.copy_from_slice(&data[8..24]);
        dst_bytes.copy_from_slice(&data[24..40]);

        let (protocol, offset) = skip_ipv6_extension_headers(data, data[6], 40);
        if protocol != IPPROTO_TCP {
            return Err(Error::Protocol(ProtocolError::NotTcp(protocol)));
        }

        Ok((
            IpAddr::V6(Ipv6Addr::from(src_bytes)),
            IpAddr::V6(Ipv6Addr::from(dst_bytes)),
            offset,
        ))
    }

    /// Check if this is a SYN without ACK (connection start).
    pub fn is_syn(&self) -> bool {
        (self.flags & 0x02) != 0 && (self.flags & 0x10) == 0
    }

    /// Check if this is a SYN/ACK.
    pub fn is_syn_ack(&self) -> bool {
        (self.flags & 0x12) == 0x12
    }

    /// Iterate over the TCP options of this segment.
    pub fn options(&self) -> TcpOptions<'a> {
        TcpOptions {
            data: self.options,
            pos: 0,
        }
    }
}

fn skip_ipv6_extension_headers(data: &[u8], next_header: u8, mut offset: usize) -> (u8, usize) {
    const HOP_BY_HOP: u8 = 0;
    const ROUTING: u8 = 43;
    const FRAGMENT: u8 = 44;
    const DESTINATION: u8 = 60;

    let mut current = next_header;
    loop {
        match current {
            HOP_BY_HOP | ROUTING | DESTINATION => {
                if data.len() < offset + 2 {
                    break;
                }
                current = data[offset];
                offset += (data[offset + 1] as usize + 1) * 8;
            }
            FRAGMENT => {
                if data.len() < offset + 8 {
                    break;
                }
                current = data[offset];
                offset += 8;
            }
            _ => break,
        }
    }
    (current, offset)
}

/// A single kind/length/value TCP option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOption<'a> {
    pub kind: u8,
    /// Total option length as carried on the wire, kind and length bytes included.
    pub length: u8,
    /// Option payload after the kind and length bytes.
    pub data: &'a [u8],
}

/// Iterator over TCP options. Stops at end-of-list.
#[derive(Debug, Clone)]
pub struct TcpOptions<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for TcpOptions<'a> {
    type Item = Result<TcpOption<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let kind = *self.data.get(self.pos)?;
            match kind {
                OPTION_EOL => {
                    self.pos = self.data.len();
                    return None;
                }
                OPTION_NOP => {
                    self.pos += 1;
                }
                _ => {
                    let Some(&length) = self.data.get(self.pos + 1) else {
                        self.pos = self.data.len();
                        return Some(Err(Error::Protocol(ProtocolError::MalformedOption {
                            kind,
                            reason: "missing length byte".into(),
                        })));
                    };
                    let end = self.pos + length as usize;
                    if length < 2 || end > self.data.len() {
                        self.pos = self.data.len();
                        return Some(Err(Error::Protocol(ProtocolError::MalformedOption {
                            kind,
                            reason: format!("length {length} exceeds option space"),
                        })));
                    }
                    let option = TcpOption {
                        kind,
                        length,
                        data: &self.data[self.pos + 2..end],
                    };
                    self.pos = end;
                    return Some(Ok(option));
                }
            }
        }
    }
}

/// Build an IPv4/TCP packet with the given options. Used by tests and tools.
pub fn build_ipv4_tcp(src: SocketAddr, dst: SocketAddr, flags: u8, options: &[u8], payload: &[u8]) -> Vec<u8> {
    let (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) = (src.ip(), dst.ip()) else {
        return Vec::new();
    };

    let padded = (options.len() + 3) / 4 * 4;
    let tcp_len = TCP_MIN_HEADER + padded;
    let total = 20 + tcp_len + payload.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&[0x45, 0x00]);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, IPPROTO_TCP, 0x00, 0x00]);
    out.extend_from_slice(&src_ip.octets());
    out.extend_from_slice(&dst_ip.octets());

    out.extend_from_slice(&src.port().to_be_bytes());
    out.extend_from_slice(&dst.port().to_be_bytes());
    out.extend_from_slice(&[0; 8]);
    out.push(((tcp_len / 4) as u8) << 4);
    out.push(flags);
    out.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
    out.extend_from_slice(options);
    out.resize(20 + tcp_len, OPTION_NOP);
    out.extend_from_slice(payload);
    out
}
