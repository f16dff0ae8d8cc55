//! Tunnel wire framing
//!
//! Every client-to-server tunnel connection opens with a single ASCII
//! preamble line carrying the flow's connection ID and, when known, the
//! original client address tuple:
//!
//! ```text
//! TUNNELLED_ID:<32-hex>[|PROXY_INFO:<src>:<sport>-><dst>:<dport>]\n
//! ```
//!
//! Everything after the newline is application payload; there is no
//! further framing.

use crate::proxy_protocol::{ProxyInfo, ProxyVersion};
use std::net::IpAddr;
use thiserror::Error;

/// Leading token of the preamble line
pub const ID_PREFIX: &str = "TUNNELLED_ID:";

/// Key of the optional client-address token
pub const PROXY_INFO_KEY: &str = "PROXY_INFO:";

/// The preamble must fit in this many bytes, newline included. Anything
/// longer is rejected rather than buffered indefinitely.
pub const MAX_PREAMBLE_LEN: usize = 1024;

/// Tunnel framing errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed preamble: {0}")]
    MalformedPreamble(String),

    #[error("preamble exceeds {MAX_PREAMBLE_LEN} bytes without a newline")]
    PreambleTooLong,
}

/// The leading line of a tunnel connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub connection_id: String,
    pub proxy_info: Option<ProxyInfo>,
}

impl Preamble {
    pub fn new(connection_id: String, proxy_info: Option<ProxyInfo>) -> Self {
        Self {
            connection_id,
            proxy_info,
        }
    }

    /// Encode the preamble line, newline included
    pub fn encode(&self) -> Vec<u8> {
        let mut line = format!("{}{}", ID_PREFIX, self.connection_id);

        if let Some(ref info) = self.proxy_info {
            line.push('|');
            line.push_str(PROXY_INFO_KEY);
            line.push_str(&format!(
                "{}:{}->{}:{}",
                info.src_ip, info.src_port, info.dst_ip, info.dst_port
            ));
        }

        line.push('\n');
        line.into_bytes()
    }

    /// Try to parse a preamble from the start of `data`.
    ///
    /// Returns `Ok(None)` when no newline has arrived yet, and the number
    /// of bytes consumed (newline included) on success; bytes past that
    /// point are application payload.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, TunnelError> {
        let newline = match data.iter().position(|&b| b == b'\n') {
            Some(idx) => idx,
            None => {
                if data.len() >= MAX_PREAMBLE_LEN {
                    return Err(TunnelError::PreambleTooLong);
                }
                return Ok(None);
            }
        };

        if newline + 1 > MAX_PREAMBLE_LEN {
            return Err(TunnelError::PreambleTooLong);
        }

        let line = std::str::from_utf8(&data[..newline])
            .map_err(|_| TunnelError::MalformedPreamble("not valid UTF-8".to_string()))?;

        let body = line
            .strip_prefix(ID_PREFIX)
            .ok_or_else(|| TunnelError::MalformedPreamble("missing id prefix".to_string()))?;

        let mut tokens = body.split('|');
        let connection_id = tokens.next().unwrap_or_default();
        if connection_id.is_empty() {
            return Err(TunnelError::MalformedPreamble("empty connection id".to_string()));
        }

        let mut proxy_info = None;
        for token in tokens {
            if let Some(tuple) = token.strip_prefix(PROXY_INFO_KEY) {
                // A garbled tuple is dropped, not fatal; the flow just
                // loses its client-address information
                proxy_info = parse_proxy_tuple(tuple);
            }
            // Unknown keys are ignored for forward compatibility
        }

        Ok(Some((
            Self {
                connection_id: connection_id.to_string(),
                proxy_info,
            },
            newline + 1,
        )))
    }
}

/// Parse `src:sport->dst:dport`
fn parse_proxy_tuple(tuple: &str) -> Option<ProxyInfo> {
    let (src, dst) = tuple.split_once("->")?;
    let (src_ip, src_port) = split_host_port(src)?;
    let (dst_ip, dst_port) = split_host_port(dst)?;

    Some(ProxyInfo::new(
        src_ip,
        src_port,
        dst_ip,
        dst_port,
        ProxyVersion::V1,
    ))
}

fn split_host_port(s: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    Some((host.parse().ok()?, port.parse().ok()?))
}
