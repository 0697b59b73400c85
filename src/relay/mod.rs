//! Single-use SOCKS relays
//!
//! A relay sits between two chain hops: it accepts exactly one inbound TCP
//! connection, closes its listening port, tunnels an outbound connection
//! through the downstream transport's local SOCKS endpoint to the upstream
//! destination, and splices the two sockets until either side hangs up.

mod socks;

pub use socks::{
    read_socks4_request, socks4_connect, socks5_connect, write_socks4_reply, SocksError, Target,
};

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::pt::{MethodSpec, SocksProtocol};

/// Time allowed for dialing a transport and completing its SOCKS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connecting to transport {transport} at {addr} failed: {source}")]
    Connect {
        transport: String,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("SOCKS handshake with transport {transport} failed: {source}")]
    Handshake {
        transport: String,
        source: SocksError,
    },

    #[error("timed out connecting through transport {transport}")]
    Timeout { transport: String },
}

/// A bound, not-yet-running relay in front of one downstream transport.
pub struct Relay {
    listener: TcpListener,
    downstream: MethodSpec,
    upstream: Target,
    port: u16,
}

impl Relay {
    /// Bind the relay's listening port on the loopback interface.
    ///
    /// The port is available via [`Relay::port`] before any accept, so the
    /// next-inner hop can be pointed at it.
    pub async fn bind(downstream: MethodSpec, upstream: Target) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            downstream,
            upstream,
            port,
        })
    }

    /// The relay's listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one connection and splice it through the downstream transport.
    ///
    /// The listener is closed as soon as the first connection arrives, so a
    /// second connect to the port deterministically fails. The inbound
    /// socket is not read until the outbound handshake has completed.
    /// Returns the bytes copied in each direction.
    pub async fn run(self) -> Result<(u64, u64), RelayError> {
        let (mut inbound, peer) = self.listener.accept().await?;
        drop(self.listener);
        debug!(
            port = self.port,
            %peer,
            transport = %self.downstream.name,
            "relay accepted its connection, listener closed"
        );

        let mut outbound = connect_through(&self.downstream, &self.upstream).await?;
        let copied = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
        debug!(
            transport = %self.downstream.name,
            to_upstream = copied.0,
            to_downstream = copied.1,
            "relay finished"
        );
        Ok(copied)
    }
}

/// Dial a transport's local SOCKS endpoint and CONNECT through it to
/// `upstream`, all under [`HANDSHAKE_TIMEOUT`].
pub async fn connect_through(
    downstream: &MethodSpec,
    upstream: &Target,
) -> Result<TcpStream, RelayError> {
    let attempt = async {
        let mut stream =
            TcpStream::connect(downstream.addr)
                .await
                .map_err(|source| RelayError::Connect {
                    transport: downstream.name.clone(),
                    addr: downstream.addr,
                    source,
                })?;
        stream.set_nodelay(true).ok();
        let handshake = match downstream.protocol {
            SocksProtocol::Socks4 => socks4_connect(&mut stream, upstream).await,
            SocksProtocol::Socks5 => socks5_connect(&mut stream, upstream).await,
        };
        handshake.map_err(|source| RelayError::Handshake {
            transport: downstream.name.clone(),
            source,
        })?;
        Ok(stream)
    };
    timeout(HANDSHAKE_TIMEOUT, attempt)
        .await
        .map_err(|_| RelayError::Timeout {
            transport: downstream.name.clone(),
        })?
}
