//! Minimal STUN (RFC 5389) binding client.
//!
//! Only what reflexive-address discovery needs: encode a Binding Request,
//! decode the XOR-MAPPED-ADDRESS of a Binding Success Response, and run the
//! exchange over UDP.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::TransportError;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS: u16 = 0x0101;
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const HEADER_LEN: usize = 20;

const FAMILY_IPV4: u8 = 0x01;

pub type TransactionId = [u8; 12];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StunError {
    #[error("response too short ({0} bytes)")]
    TooShort(usize),
    #[error("unexpected message type 0x{0:04x}")]
    UnexpectedType(u16),
    #[error("bad magic cookie 0x{0:08x}")]
    BadCookie(u32),
    #[error("transaction id mismatch")]
    TransactionMismatch,
    #[error("no IPv4 mapped address in response")]
    NoMappedAddress,
}

/// Fresh random transaction id.
pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

/// Encode a 20-byte Binding Request: type, zero length, cookie, transaction id.
pub fn binding_request(transaction_id: &TransactionId) -> [u8; HEADER_LEN] {
    let mut msg = [0u8; HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // msg[2..4] stays zero: no attributes
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

/// Encode a Binding Success Response carrying one XOR-MAPPED-ADDRESS.
///
/// Used by peers answering probes and by local test servers.
pub fn binding_success(transaction_id: &TransactionId, mapped: SocketAddrV4) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + 12);
    msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);

    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.push(0);
    msg.push(FAMILY_IPV4);
    msg.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    let cookie = MAGIC_COOKIE.to_be_bytes();
    for (octet, key) in mapped.ip().octets().iter().zip(cookie) {
        msg.push(octet ^ key);
    }
    msg
}

/// Decode the reflexive address from a Binding Success Response.
///
/// Attributes are walked on 4-byte boundaries; unknown ones are skipped.
/// XOR-MAPPED-ADDRESS wins over the legacy MAPPED-ADDRESS. When
/// `expected` is given the transaction id must match.
pub fn parse_binding_response(
    buf: &[u8],
    expected: Option<&TransactionId>,
) -> Result<SocketAddrV4, StunError> {
    if buf.len() < HEADER_LEN {
        return Err(StunError::TooShort(buf.len()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(StunError::UnexpectedType(msg_type));
    }
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadCookie(cookie));
    }
    if let Some(tid) = expected {
        if buf[8..20] != tid[..] {
            return Err(StunError::TransactionMismatch);
        }
    }

    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = buf.len().min(HEADER_LEN + msg_len);
    let mut legacy = None;
    let mut offset = HEADER_LEN;

    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        let value = &buf[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, true) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if legacy.is_none() {
                    legacy = decode_address(value, false);
                }
            }
            _ => {}
        }

        offset = value_start + attr_len.div_ceil(4) * 4;
    }

    legacy.ok_or(StunError::NoMappedAddress)
}

fn decode_address(value: &[u8], xored: bool) -> Option<SocketAddrV4> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut octets = [value[4], value[5], value[6], value[7]];
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        for (octet, key) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
            *octet ^= key;
        }
    }
    Some(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

/// Ask `server` (`host:port`) for our public IPv4 address.
pub async fn query(server: &str, timeout: Duration) -> Result<SocketAddrV4, TransportError> {
    let target = tokio::time::timeout(timeout, tokio::net::lookup_host(server))
        .await
        .map_err(|_| TransportError::timeout("stun", timeout))?
        .map_err(|e| TransportError::Resolve {
            endpoint: "stun".into(),
            host: server.to_string(),
            reason: e.to_string(),
        })?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TransportError::Resolve {
            endpoint: "stun".into(),
            host: server.to_string(),
            reason: "no IPv4 address".into(),
        })?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TransportError::io("stun", e))?;
    let tid = new_transaction_id();
    socket
        .send_to(&binding_request(&tid), target)
        .await
        .map_err(|e| TransportError::io("stun", e))?;

    let exchange = async {
        let mut buf = [0u8; 576];
        loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| TransportError::io("stun", e))?;
            if from != target {
                continue;
            }
            match parse_binding_response(&buf[..len], Some(&tid)) {
                Ok(addr) => return Ok(addr),
                // Stray datagram from an earlier exchange
                Err(StunError::TransactionMismatch) => continue,
                Err(e) => return Err(TransportError::Stun(format!("{server}: {e}"))),
            }
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::timeout("stun", timeout))?
}
