//! HAProxy PROXY protocol codec
//!
//! Parses and emits version 1 (ASCII) and version 2 (binary) PROXY headers,
//! TCP4/TCP6 only. The original client address travels through the tunnel
//! so the far side can re-emit a correct header to its backend.
//!
//! v2 wire format:
//! ```text
//! +------------------+--------+--------+--------+
//! | signature (12B)  | v..cmd | fam.pr | len 2B |
//! +------------------+--------+--------+--------+
//! |    src addr, dst addr, src port, dst port   |
//! +---------------------------------------------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// PROXY protocol v2 signature (12 bytes)
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command)
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_INET (IPv4), high nibble
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6), high nibble
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP), low nibble
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of the IPv4 address block (4 + 4 + 2 + 2)
const IPV4_ADDR_LEN: u16 = 12;

/// Length of the IPv6 address block (16 + 16 + 2 + 2)
const IPV6_ADDR_LEN: u16 = 36;

/// Codec errors
#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    /// Not enough bytes buffered to finish parsing; retry with more
    #[error("incomplete PROXY header")]
    Incomplete,

    #[error("malformed PROXY v1 header: {0}")]
    MalformedV1(String),

    #[error("malformed PROXY v2 header: {0}")]
    MalformedV2(String),

    #[error("unsupported family or protocol: {0}")]
    UnsupportedFamilyOrProtocol(String),
}

/// Which PROXY protocol version carried the tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// Parsed PROXY tuple carried through a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub version: ProxyVersion,
}

impl ProxyInfo {
    /// Build a tuple, canonicalizing IPv4-mapped IPv6 addresses to IPv4 so
    /// `::ffff:a.b.c.d` emits as TCP4 / family 1.
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        version: ProxyVersion,
    ) -> Self {
        Self {
            src_ip: canonical_ip(src_ip),
            dst_ip: canonical_ip(dst_ip),
            src_port,
            dst_port,
            version,
        }
    }

    /// Emit the ASCII v1 header line
    pub fn emit_v1(&self) -> Vec<u8> {
        let family = match self.src_ip {
            IpAddr::V4(_) => "TCP4",
            IpAddr::V6(_) => "TCP6",
        };
        format!(
            "PROXY {} {} {} {} {}\r\n",
            family, self.src_ip, self.dst_ip, self.src_port, self.dst_port
        )
        .into_bytes()
    }

    /// Emit the binary v2 header
    pub fn emit_v2(&self) -> Vec<u8> {
        match (self.src_ip, self.dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let mut buf = Vec::with_capacity(16 + IPV4_ADDR_LEN as usize);
                buf.extend_from_slice(&V2_SIGNATURE);
                buf.push(VERSION_COMMAND_PROXY);
                buf.push(AF_INET | TRANSPORT_STREAM);
                buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
                buf.extend_from_slice(&self.src_port.to_be_bytes());
                buf.extend_from_slice(&self.dst_port.to_be_bytes());
                buf
            }
            (src, dst) => {
                // Any v6 involvement emits family 2; a mixed v4 side is
                // widened to its mapped form
                let src = to_v6(src);
                let dst = to_v6(dst);
                let mut buf = Vec::with_capacity(16 + IPV6_ADDR_LEN as usize);
                buf.extend_from_slice(&V2_SIGNATURE);
                buf.push(VERSION_COMMAND_PROXY);
                buf.push(AF_INET6 | TRANSPORT_STREAM);
                buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
                buf.extend_from_slice(&self.src_port.to_be_bytes());
                buf.extend_from_slice(&self.dst_port.to_be_bytes());
                buf
            }
        }
    }
}

/// Map an IPv4-mapped or IPv4-compatible IPv6 address back to IPv4
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match extract_v4(v6) {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

fn extract_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = addr.octets();

    // IPv4-mapped: ::ffff:a.b.c.d
    if octets[..10].iter().all(|&b| b == 0) && octets[10] == 0xff && octets[11] == 0xff {
        return Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
    }

    None
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Detection outcome for a buffered prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Fewer than 5 bytes buffered; undecidable
    NeedMore,
    /// The buffer does not start a PROXY header
    NotProxy,
    /// v1 candidate (buffer begins with "PROXY")
    V1,
    /// v2 candidate (12-byte signature present)
    V2,
}

/// Decide whether a buffer starts a PROXY header
pub fn detect(data: &[u8]) -> Detection {
    if data.len() < 5 {
        return Detection::NeedMore;
    }

    if data.starts_with(b"PROXY") {
        return Detection::V1;
    }

    if data.len() >= 12 && data[..12] == V2_SIGNATURE {
        return Detection::V2;
    }

    Detection::NotProxy
}

/// Parse a v1 header line.
///
/// Returns the tuple and the header length (index of CRLF + 2). The bytes
/// past the header belong to the application stream.
pub fn parse_v1(data: &[u8]) -> Result<(ProxyInfo, usize), ProxyProtocolError> {
    let crlf = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(ProxyProtocolError::Incomplete)?;

    let line = std::str::from_utf8(&data[..crlf])
        .map_err(|_| ProxyProtocolError::MalformedV1("non-ASCII header".to_string()))?;

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 6 || parts[0] != "PROXY" {
        return Err(ProxyProtocolError::MalformedV1(format!(
            "expected 6 tokens, got {}",
            parts.len()
        )));
    }

    let family = parts[1];
    if family != "TCP4" && family != "TCP6" {
        return Err(ProxyProtocolError::UnsupportedFamilyOrProtocol(
            family.to_string(),
        ));
    }

    let src_ip: IpAddr = parts[2]
        .parse()
        .map_err(|_| ProxyProtocolError::MalformedV1(format!("bad source IP: {}", parts[2])))?;
    let dst_ip: IpAddr = parts[3]
        .parse()
        .map_err(|_| ProxyProtocolError::MalformedV1(format!("bad destination IP: {}", parts[3])))?;

    let src_port: u16 = parts[4]
        .parse()
        .map_err(|_| ProxyProtocolError::MalformedV1(format!("bad source port: {}", parts[4])))?;
    let dst_port: u16 = parts[5].parse().map_err(|_| {
        ProxyProtocolError::MalformedV1(format!("bad destination port: {}", parts[5]))
    })?;

    Ok((
        ProxyInfo::new(src_ip, src_port, dst_ip, dst_port, ProxyVersion::V1),
        crlf + 2,
    ))
}

/// Parse a v2 header.
///
/// Returns the tuple and the header length (`16 + payload_length`).
pub fn parse_v2(data: &[u8]) -> Result<(ProxyInfo, usize), ProxyProtocolError> {
    if data.len() < 16 {
        return Err(ProxyProtocolError::Incomplete);
    }

    if data[..12] != V2_SIGNATURE {
        return Err(ProxyProtocolError::MalformedV2("bad signature".to_string()));
    }

    let version = (data[12] & 0xF0) >> 4;
    let command = data[12] & 0x0F;
    if version != 2 {
        return Err(ProxyProtocolError::MalformedV2(format!(
            "version {}",
            version
        )));
    }
    if command != 1 {
        return Err(ProxyProtocolError::MalformedV2(format!(
            "command {}",
            command
        )));
    }

    let family = (data[13] & 0xF0) >> 4;
    let protocol = data[13] & 0x0F;
    if protocol != 1 {
        return Err(ProxyProtocolError::UnsupportedFamilyOrProtocol(format!(
            "protocol {}",
            protocol
        )));
    }

    let payload_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let header_len = 16 + payload_len;
    if data.len() < header_len {
        return Err(ProxyProtocolError::Incomplete);
    }

    let (src_ip, dst_ip, src_port, dst_port) = match family {
        1 => {
            if payload_len < IPV4_ADDR_LEN as usize {
                return Err(ProxyProtocolError::MalformedV2(format!(
                    "IPv4 body too short: {}",
                    payload_len
                )));
            }
            let src = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            let dst = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
            let src_port = u16::from_be_bytes([data[24], data[25]]);
            let dst_port = u16::from_be_bytes([data[26], data[27]]);
            (IpAddr::V4(src), IpAddr::V4(dst), src_port, dst_port)
        }
        2 => {
            if payload_len < IPV6_ADDR_LEN as usize {
                return Err(ProxyProtocolError::MalformedV2(format!(
                    "IPv6 body too short: {}",
                    payload_len
                )));
            }
            let src_octets: [u8; 16] = data[16..32].try_into().unwrap();
            let dst_octets: [u8; 16] = data[32..48].try_into().unwrap();
            let src_port = u16::from_be_bytes([data[48], data[49]]);
            let dst_port = u16::from_be_bytes([data[50], data[51]]);
            (
                IpAddr::V6(Ipv6Addr::from(src_octets)),
                IpAddr::V6(Ipv6Addr::from(dst_octets)),
                src_port,
                dst_port,
            )
        }
        other => {
            return Err(ProxyProtocolError::UnsupportedFamilyOrProtocol(format!(
                "family {}",
                other
            )));
        }
    };

    Ok((
        ProxyInfo::new(src_ip, src_port, dst_ip, dst_port, ProxyVersion::V2),
        header_len,
    ))
}
