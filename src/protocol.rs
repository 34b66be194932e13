//! SOCKS5 wire encoding shared by the client-facing and backend-facing legs.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Greeting reply sent to every client: no authentication required.
pub const GREETING_REPLY: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// CONNECT success reply. Always reports `0.0.0.0:0` as the bound address.
pub const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// General SOCKS server failure, sent when no upstream could be opened.
pub const FAILURE_REPLY: [u8; 2] = [SOCKS_VERSION, 0x01];

/// Greeting offered to every backend: NO-AUTH and USERNAME/PASSWORD.
pub const UPSTREAM_GREETING: [u8; 4] = [SOCKS_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS];

/// Errors raised while decoding SOCKS5 frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name in request")]
    InvalidDomain,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// SOCKS5 reply field (REP) as returned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Other(u8),
}

impl From<u8> for ReplyCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Other(other),
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyCode::Succeeded => f.write_str("succeeded"),
            ReplyCode::GeneralFailure => f.write_str("general SOCKS server failure"),
            ReplyCode::NotAllowed => f.write_str("connection not allowed by ruleset"),
            ReplyCode::NetworkUnreachable => f.write_str("network unreachable"),
            ReplyCode::HostUnreachable => f.write_str("host unreachable"),
            ReplyCode::ConnectionRefused => f.write_str("connection refused"),
            ReplyCode::TtlExpired => f.write_str("TTL expired"),
            ReplyCode::CommandNotSupported => f.write_str("command not supported"),
            ReplyCode::AddressTypeNotSupported => f.write_str("address type not supported"),
            ReplyCode::Other(code) => write!(f, "unassigned reply code {:#04x}", code),
        }
    }
}

/// Destination host as it arrived on the wire.
///
/// IPv6 keeps its raw 16 bytes so the nested CONNECT can re-encode it
/// without going through the hex rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6([u8; 16]),
}

impl TargetHost {
    /// Host string: dotted-decimal, domain name, or lowercase hex for IPv6.
    pub fn host_string(&self) -> String {
        match self {
            TargetHost::Ipv4(ip) => ip.to_string(),
            TargetHost::Domain(name) => name.clone(),
            TargetHost::Ipv6(raw) => raw.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }

    /// Form used for the backend CONNECT: IPv4 literals sent as domains become ATYP 0x01.
    pub fn upstream_form(&self) -> TargetHost {
        match self {
            TargetHost::Domain(name) => match name.parse::<Ipv4Addr>() {
                Ok(ip) => TargetHost::Ipv4(ip),
                Err(_) => self.clone(),
            },
            other => other.clone(),
        }
    }
}

/// Destination requested by a client CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: TargetHost,
    pub port: u16,
}

impl Destination {
    pub fn new(host: TargetHost, port: u16) -> Self {
        Self { host, port }
    }

    pub fn host_string(&self) -> String {
        self.host.host_string()
    }

    /// Append `ATYP DST.ADDR DST.PORT` to `buf`.
    pub fn encode_address(&self, buf: &mut Vec<u8>) {
        match &self.host {
            TargetHost::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            TargetHost::Domain(name) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            TargetHost::Ipv6(raw) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(raw);
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Full CONNECT request frame: `05 01 00 ATYP DST.ADDR DST.PORT`.
    pub fn connect_request(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 + 255);
        buf.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
        self.encode_address(&mut buf);
        buf
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            TargetHost::Domain(name) => write!(f, "{}:{}", name, self.port),
            TargetHost::Ipv6(raw) => write!(f, "[{}]:{}", Ipv6Addr::from(*raw), self.port),
        }
    }
}

/// Read `DST.ADDR DST.PORT` for the given ATYP.
pub async fn read_destination<R>(reader: &mut R, atyp: u8) -> Result<Destination, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            TargetHost::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            if len == 0 {
                return Err(ProtocolError::InvalidDomain);
            }
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            TargetHost::Domain(String::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?)
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 16];
            reader.read_exact(&mut raw).await?;
            TargetHost::Ipv6(raw)
        }
        other => return Err(ProtocolError::UnsupportedAddressType(other)),
    };
    let port = reader.read_u16().await?;
    Ok(Destination { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ipv4_request_decodes_to_same_host_and_port() {
        let dest = Destination::new(TargetHost::Ipv4(Ipv4Addr::new(93, 184, 216, 34)), 80);
        let frame = dest.connect_request();
        assert_eq!(&frame[..4], &[0x05, 0x01, 0x00, 0x01]);

        let mut rest = &frame[4..];
        let decoded = read_destination(&mut rest, frame[3]).await.unwrap();
        assert_eq!(decoded.host_string(), "93.184.216.34");
        assert_eq!(decoded.port, 80);
    }

    #[tokio::test]
    async fn domain_address_parses() {
        let mut bytes: &[u8] = &[
            0x0B, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', 0x00, 0x50,
        ];
        let dest = read_destination(&mut bytes, ATYP_DOMAIN).await.unwrap();
        assert_eq!(dest.host_string(), "example.com");
        assert_eq!(dest.port, 80);
    }

    #[tokio::test]
    async fn ipv6_renders_as_hex_and_keeps_raw_bytes() {
        let mut raw = [0u8; 16];
        raw[15] = 1;
        let mut bytes = raw.to_vec();
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let dest = read_destination(&mut bytes.as_slice(), ATYP_IPV6).await.unwrap();
        assert_eq!(dest.host_string(), "00000000000000000000000000000001");
        assert_eq!(dest.to_string(), "[::1]:443");

        let frame = dest.connect_request();
        assert_eq!(frame[3], ATYP_IPV6);
        assert_eq!(&frame[4..20], &raw);
        assert_eq!(&frame[20..], &[0x01, 0xBB]);
    }

    #[tokio::test]
    async fn empty_or_non_utf8_domain_is_rejected() {
        let mut empty: &[u8] = &[0x00, 0x00, 0x50];
        assert!(matches!(
            read_destination(&mut empty, ATYP_DOMAIN).await,
            Err(ProtocolError::InvalidDomain)
        ));

        let mut garbage: &[u8] = &[0x02, 0xFF, 0xFE, 0x00, 0x50];
        assert!(matches!(
            read_destination(&mut garbage, ATYP_DOMAIN).await,
            Err(ProtocolError::InvalidDomain)
        ));
    }

    #[tokio::test]
    async fn unknown_address_type_and_truncation() {
        let mut bytes: &[u8] = &[1, 2, 3, 4, 0, 80];
        assert!(matches!(
            read_destination(&mut bytes, 0x02).await,
            Err(ProtocolError::UnsupportedAddressType(0x02))
        ));

        let mut short: &[u8] = &[10, 0];
        assert!(matches!(
            read_destination(&mut short, ATYP_IPV4).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[test]
    fn ipv4_literal_domain_is_sent_upstream_as_ipv4() {
        let host = TargetHost::Domain("10.1.2.3".to_string());
        assert_eq!(host.upstream_form(), TargetHost::Ipv4(Ipv4Addr::new(10, 1, 2, 3)));

        let name = TargetHost::Domain("example.com".to_string());
        assert_eq!(name.upstream_form(), name);
    }

    #[test]
    fn reply_codes_map_standard_table() {
        assert_eq!(ReplyCode::from(0x05), ReplyCode::ConnectionRefused);
        assert_eq!(ReplyCode::from(0x08), ReplyCode::AddressTypeNotSupported);
        assert_eq!(ReplyCode::from(0x42), ReplyCode::Other(0x42));
        assert_eq!(ReplyCode::from(0x04).to_string(), "host unreachable");
    }
}
