//! SOCKS wire codecs
//!
//! Client-side CONNECT handshakes for SOCKS4/4a and SOCKS5 (no
//! authentication), used when dialing a transport's local endpoint, plus the
//! server side of SOCKSv4 used by the chain head toward the application.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

// SOCKSv4 reply codes (the reply's version octet is always 0)
const SOCKS4_REPLY_VERSION: u8 = 0x00;
const SOCKS4_GRANTED: u8 = 90;
const SOCKS4_REJECTED: u8 = 91;

/// SOCKS protocol errors
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u8, actual: u8 },

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("CONNECT rejected (code {code}): {message}")]
    Rejected { code: u8, message: String },

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("hostname too long: {0} bytes")]
    HostTooLong(usize),
}

/// A CONNECT destination: IP literal or hostname, plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// A loopback destination, used between chain hops.
    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST.to_string(), port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Perform a SOCKS5 no-auth CONNECT handshake on an established stream.
pub async fn socks5_connect<S>(stream: &mut S, target: &Target) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // method selection
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
        .await?;
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: selection[0],
        });
    }
    match selection[1] {
        AUTH_METHOD_NONE => {}
        AUTH_METHOD_NO_ACCEPTABLE => return Err(SocksError::NoAcceptableMethod),
        other => {
            return Err(SocksError::Malformed(format!(
                "unsupported auth method {other:#04x}"
            )))
        }
    }

    // CONNECT request: VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = Vec::with_capacity(22);
    request.push(SOCKS5_VERSION);
    request.push(CMD_CONNECT);
    request.push(0x00);
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if target.host.len() > 255 {
                return Err(SocksError::HostTooLong(target.host.len()));
            }
            request.push(ATYP_DOMAIN);
            request.push(target.host.len() as u8);
            request.extend_from_slice(target.host.as_bytes());
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    // reply: VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(SocksError::Rejected {
            code: header[1],
            message: socks5_reply_message(header[1]).to_string(),
        });
    }
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(SocksError::InvalidAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Perform a SOCKS4 CONNECT handshake on an established stream.
///
/// Hostname targets use the 4a extension (address `0.0.0.1`, hostname
/// appended after the user id).
pub async fn socks4_connect<S>(stream: &mut S, target: &Target) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(16);
    request.push(SOCKS4_VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&target.port.to_be_bytes());
    match target.host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.extend_from_slice(&ip.octets());
            request.push(0x00); // empty user id
        }
        Err(_) => {
            if target.host.len() > 255 {
                return Err(SocksError::HostTooLong(target.host.len()));
            }
            request.extend_from_slice(&[0, 0, 0, 1]);
            request.push(0x00);
            request.extend_from_slice(target.host.as_bytes());
            request.push(0x00);
        }
    }
    stream.write_all(&request).await?;

    // reply: VN | CD | DSTPORT | DSTIP
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS4_REPLY_VERSION {
        return Err(SocksError::InvalidVersion {
            expected: SOCKS4_REPLY_VERSION,
            actual: reply[0],
        });
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(SocksError::Rejected {
            code: reply[1],
            message: "request rejected or failed".to_string(),
        });
    }
    Ok(())
}

/// Read a SOCKSv4 CONNECT request from an application (server side).
///
/// Accepts plain SOCKS4 and the 4a hostname extension; the user id is
/// discarded. Returns the requested destination.
pub async fn read_socks4_request<S>(stream: &mut S) -> Result<Target, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS4_VERSION {
        return Err(SocksError::InvalidVersion {
            expected: SOCKS4_VERSION,
            actual: header[0],
        });
    }
    if header[1] != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(header[1]));
    }
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = [header[4], header[5], header[6], header[7]];

    read_null_terminated(stream).await?; // user id

    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let raw = read_null_terminated(stream).await?;
        String::from_utf8(raw)
            .map_err(|_| SocksError::Malformed("hostname is not valid UTF-8".into()))?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    Ok(Target::new(host, port))
}

/// Write the SOCKSv4 reply toward the application.
pub async fn write_socks4_reply<S>(stream: &mut S, granted: bool) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let code = if granted {
        SOCKS4_GRANTED
    } else {
        SOCKS4_REJECTED
    };
    stream
        .write_all(&[SOCKS4_REPLY_VERSION, code, 0, 0, 0, 0, 0, 0])
        .await
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<Vec<u8>, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
        if out.len() > 255 {
            return Err(SocksError::Malformed("unterminated field".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn socks5_connect_ipv4() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move {
            socks5_connect(&mut client, &Target::new("10.0.0.2", 443)).await
        });

        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [SOCKS5_VERSION, 1, AUTH_METHOD_NONE]);
        server
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])
            .await
            .unwrap();

        let mut request = [0u8; 10];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(
            request,
            [SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_IPV4, 10, 0, 0, 2, 0x01, 0xBB]
        );
        server
            .write_all(&[SOCKS5_VERSION, REPLY_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn socks5_connect_domain_rejected() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move {
            socks5_connect(&mut client, &Target::new("bridge.example", 8080)).await
        });

        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        server
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])
            .await
            .unwrap();

        let mut head = [0u8; 5];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(head[3], ATYP_DOMAIN);
        let mut rest = vec![0u8; head[4] as usize + 2];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest[..head[4] as usize], b"bridge.example");

        server
            .write_all(&[SOCKS5_VERSION, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = handshake.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SocksError::Rejected { code: 0x05, ref message } if message == "connection refused"
        ));
    }

    #[tokio::test]
    async fn socks4_connect_ip() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move {
            socks4_connect(&mut client, &Target::new("192.0.2.7", 9001)).await
        });

        let mut request = [0u8; 9];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(request[0], SOCKS4_VERSION);
        assert_eq!(request[1], CMD_CONNECT);
        assert_eq!(u16::from_be_bytes([request[2], request[3]]), 9001);
        assert_eq!(&request[4..8], &[192, 0, 2, 7]);
        assert_eq!(request[8], 0);

        server
            .write_all(&[SOCKS4_REPLY_VERSION, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn socks4a_connect_hostname() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move {
            socks4_connect(&mut client, &Target::new("bridge.example", 80)).await
        });

        let mut header = [0u8; 9];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[4..8], &[0, 0, 0, 1]);
        let mut hostname = vec![0u8; b"bridge.example".len() + 1];
        server.read_exact(&mut hostname).await.unwrap();
        assert_eq!(&hostname[..hostname.len() - 1], b"bridge.example");
        assert_eq!(*hostname.last().unwrap(), 0);

        server
            .write_all(&[SOCKS4_REPLY_VERSION, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn socks4_connect_rejected() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move {
            socks4_connect(&mut client, &Target::new("192.0.2.7", 9001)).await
        });

        let mut request = [0u8; 9];
        server.read_exact(&mut request).await.unwrap();
        server
            .write_all(&[SOCKS4_REPLY_VERSION, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = handshake.await.unwrap().unwrap_err();
        assert!(matches!(err, SocksError::Rejected { code: 91, .. }));
    }

    #[tokio::test]
    async fn read_request_plain() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[SOCKS4_VERSION, CMD_CONNECT, 0x00, 0x50, 203, 0, 113, 9, b'u', 0])
            .await
            .unwrap();
        let target = read_socks4_request(&mut server).await.unwrap();
        assert_eq!(target, Target::new("203.0.113.9", 80));
    }

    #[tokio::test]
    async fn read_request_socks4a() {
        let (mut client, mut server) = duplex(256);
        let mut bytes = vec![SOCKS4_VERSION, CMD_CONNECT, 0x1F, 0x90, 0, 0, 0, 1, 0];
        bytes.extend_from_slice(b"bridge.example");
        bytes.push(0);
        client.write_all(&bytes).await.unwrap();
        let target = read_socks4_request(&mut server).await.unwrap();
        assert_eq!(target, Target::new("bridge.example", 8080));
    }

    #[tokio::test]
    async fn read_request_wrong_version() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[SOCKS5_VERSION, CMD_CONNECT, 0, 80, 1, 2, 3, 4, 0])
            .await
            .unwrap();
        let err = read_socks4_request(&mut server).await.unwrap_err();
        assert!(matches!(
            err,
            SocksError::InvalidVersion { expected: 4, actual: 5 }
        ));
    }

    #[tokio::test]
    async fn reply_bytes() {
        let (mut client, mut server) = duplex(64);
        write_socks4_reply(&mut client, true).await.unwrap();
        write_socks4_reply(&mut client, false).await.unwrap();
        let mut replies = [0u8; 16];
        server.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies[1], SOCKS4_GRANTED);
        assert_eq!(replies[9], SOCKS4_REJECTED);
    }
}
