//! Address codec for the destination protocol.
//!
//! Resolved addresses leave this crate as `TcpAddress` messages: an IPv4 address is
//! carried as a big-endian `fixed32`, an IPv6 address as two `fixed64` halves, and the
//! port as a `uint32` that must fit in 16 bits.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use prost::Message;

use crate::error::{Error, Result};

pub use proto::{IPv6, IpAddress, TcpAddress, ip_address};

/// Protobuf messages of the destination protocol's address types.
#[allow(missing_docs, clippy::derive_partial_eq_without_eq)]
pub mod proto {
    /// A TCP endpoint.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TcpAddress {
        #[prost(message, optional, tag = "1")]
        pub ip: Option<IpAddress>,
        #[prost(uint32, tag = "2")]
        pub port: u32,
    }

    /// An IPv4 or IPv6 address.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct IpAddress {
        #[prost(oneof = "ip_address::Ip", tags = "1, 2")]
        pub ip: Option<ip_address::Ip>,
    }

    pub mod ip_address {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Ip {
            #[prost(fixed32, tag = "1")]
            Ipv4(u32),
            #[prost(message, tag = "2")]
            Ipv6(super::IPv6),
        }
    }

    /// An IPv6 address split into its high and low 64 bits.
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct IPv6 {
        #[prost(fixed64, tag = "1")]
        pub first: u64,
        #[prost(fixed64, tag = "2")]
        pub last: u64,
    }
}

impl From<SocketAddr> for TcpAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: Some(IpAddress::from(addr.ip())),
            port: u32::from(addr.port()),
        }
    }
}

impl From<IpAddr> for IpAddress {
    #[allow(clippy::cast_possible_truncation)]
    fn from(ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => ip_address::Ip::Ipv4(u32::from(v4)),
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                ip_address::Ip::Ipv6(IPv6 {
                    first: (bits >> 64) as u64,
                    last: bits as u64,
                })
            }
        };

        Self { ip: Some(ip) }
    }
}

/// Encodes a textual IP and a port into a wire address.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if `ip` is not a valid IPv4/IPv6 literal or `port`
/// does not fit in 16 bits.
pub fn encode(ip: &str, port: u32) -> Result<TcpAddress> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("{ip:?} is not an IP address")))?;
    let port = u16::try_from(port)
        .map_err(|_| Error::InvalidAddress(format!("port {port} is out of range")))?;

    Ok(TcpAddress::from(SocketAddr::new(ip, port)))
}

/// Decodes a wire address into a socket address.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if the message has no IP or its port does not fit
/// in 16 bits.
pub fn decode(addr: &TcpAddress) -> Result<SocketAddr> {
    let ip = match addr.ip.as_ref().and_then(|ip| ip.ip.as_ref()) {
        Some(ip_address::Ip::Ipv4(bits)) => IpAddr::V4(Ipv4Addr::from(*bits)),
        Some(ip_address::Ip::Ipv6(IPv6 { first, last })) => {
            let bits = (u128::from(*first) << 64) | u128::from(*last);
            IpAddr::V6(Ipv6Addr::from(bits))
        }
        None => return Err(Error::InvalidAddress("address has no IP".to_string())),
    };

    let port = u16::try_from(addr.port)
        .map_err(|_| Error::InvalidAddress(format!("port {} is out of range", addr.port)))?;

    Ok(SocketAddr::new(ip, port))
}

/// Serializes a socket address as a protobuf-encoded `TcpAddress`.
#[must_use]
pub fn to_bytes(addr: SocketAddr) -> Vec<u8> {
    TcpAddress::from(addr).encode_to_vec()
}

/// Parses a protobuf-encoded `TcpAddress`.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if the bytes are not a valid message or the decoded
/// address is malformed.
pub fn from_bytes(bytes: &[u8]) -> Result<SocketAddr> {
    let addr = TcpAddress::decode(bytes)
        .map_err(|e| Error::InvalidAddress(format!("undecodable address message: {e}")))?;
    decode(&addr)
}

/// Formats a wire address as `ip:port`, or `<invalid>` if it cannot be decoded.
#[must_use]
pub fn display(addr: &TcpAddress) -> String {
    decode(addr).map_or_else(|_| "<invalid>".to_string(), |addr| addr.to_string())
}
