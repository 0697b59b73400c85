//! Chain construction
//!
//! Each configured chain gets one [`Interceptor`]: a SOCKSv4 listener the
//! application connects to. Per accepted connection the interceptor reads
//! the requested destination (the bridge), allocates one single-use relay
//! per remaining hop, tail first so every inner relay knows the port of
//! the relay behind it, then tunnels through the first transport and
//! splices. Relays are per-connection, so the chain is rebuilt from scratch
//! on every accept and a failed connection leaves the chain serviceable.

use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pt::MethodSpec;
use crate::relay::{
    connect_through, read_socks4_request, write_socks4_reply, Relay, RelayError, SocksError, Target,
};

/// Chain construction errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("application handshake failed: {0}")]
    AppHandshake(#[from] SocksError),

    #[error("binding relay for transport {transport} failed: {source}")]
    RelayBind {
        transport: String,
        source: std::io::Error,
    },

    #[error("head hop through transport {transport} failed: {source}")]
    Head {
        transport: String,
        source: RelayError,
    },
}

/// The user-facing SOCKSv4 endpoint of one chain.
pub struct Interceptor {
    alias: String,
    specs: Vec<MethodSpec>,
    listener: TcpListener,
    port: u16,
}

impl Interceptor {
    /// Bind the chain's SOCKSv4 listener on the loopback interface.
    ///
    /// `specs` are the chain's transports in order, head first.
    pub async fn bind(alias: String, specs: Vec<MethodSpec>) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            alias,
            specs,
            listener,
            port,
        })
    }

    /// The listening port to announce to the controller.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept application connections forever, one rebuilt chain each.
    pub async fn run(self) {
        info!(chain = %self.alias, port = self.port, "interceptor listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(chain = %self.alias, "accept failed: {err}");
                    continue;
                }
            };
            debug!(chain = %self.alias, %peer, "application connected");
            let alias = self.alias.clone();
            let specs = self.specs.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(&alias, &specs, stream).await {
                    warn!(chain = %alias, "connection failed: {err}");
                }
            });
        }
    }
}

/// Drive one application connection through the whole chain.
async fn handle_connection(
    alias: &str,
    specs: &[MethodSpec],
    mut app: TcpStream,
) -> Result<(), ChainError> {
    let bridge = read_socks4_request(&mut app).await?;
    debug!(chain = %alias, %bridge, "building chain");

    let mut head = match build_chain(alias, specs, &bridge).await {
        Ok(head) => head,
        Err(err) => {
            // The application is owed a SOCKSv4 answer before we hang up.
            let _ = write_socks4_reply(&mut app, false).await;
            return Err(err);
        }
    };
    write_socks4_reply(&mut app, true).await?;

    match tokio::io::copy_bidirectional(&mut app, &mut head).await {
        Ok((sent, received)) => {
            debug!(chain = %alias, sent, received, "connection finished");
            Ok(())
        }
        Err(err) => {
            warn!(chain = %alias, "splice ended with error: {err}");
            Ok(())
        }
    }
}

/// Allocate the relays for one connection and dial the head transport.
///
/// For a chain `P1..Pn` with destination `bridge`, relays are created for
/// `Pn` down to `P2` (the relay for `Pn` points at the bridge, each inner
/// relay points at the listener of the one behind it) and the returned
/// stream is tunneled through `P1` to the outermost relay.
async fn build_chain(
    alias: &str,
    specs: &[MethodSpec],
    bridge: &Target,
) -> Result<TcpStream, ChainError> {
    let mut upstream = bridge.clone();
    let mut running: Vec<JoinHandle<()>> = Vec::with_capacity(specs.len().saturating_sub(1));

    for spec in specs[1..].iter().rev() {
        let relay = Relay::bind(spec.clone(), upstream)
            .await
            .map_err(|source| {
                abort_all(&running);
                ChainError::RelayBind {
                    transport: spec.name.clone(),
                    source,
                }
            })?;
        upstream = Target::loopback(relay.port());

        let alias = alias.to_string();
        let transport = spec.name.clone();
        running.push(tokio::spawn(async move {
            if let Err(err) = relay.run().await {
                warn!(chain = %alias, transport = %transport, "relay failed: {err}");
            }
        }));
    }

    match connect_through(&specs[0], &upstream).await {
        Ok(stream) => Ok(stream),
        Err(source) => {
            abort_all(&running);
            Err(ChainError::Head {
                transport: specs[0].name.clone(),
                source,
            })
        }
    }
}

fn abort_all(running: &[JoinHandle<()>]) {
    for handle in running {
        handle.abort();
    }
}
