//! Managed pluggable-transport children
//!
//! Provides:
//! - Method specs parsed from a child's `CMETHOD` status lines
//! - The line-oriented status stream reader
//! - The child process supervisor

mod reader;
mod supervisor;

pub use reader::{read_methods, ChildMethods};
pub use supervisor::{child_environment, spawn_child, ChildPt};

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

/// Errors talking to or supervising a transport child.
#[derive(Debug, Error)]
pub enum PtError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported managed-transport version {0:?}")]
    UnsupportedVersion(String),

    #[error("unknown SOCKS protocol {0:?}")]
    UnknownProtocol(String),

    #[error("malformed CMETHOD line: {0}")]
    MalformedMethod(String),

    #[error("child exited before CMETHODS DONE")]
    EarlyEof,

    #[error("child rejected transport: {0}")]
    MethodRejected(String),

    #[error("transport missing from the child's CMETHODS")]
    MissingMethod,

    #[error("child failed: {0}")]
    ChildFailed(String),

    #[error("empty transport command line")]
    EmptyCommand,

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("child stdout unavailable")]
    NoStdout,
}

/// SOCKS protocol a transport accepts connect requests with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksProtocol {
    Socks4,
    Socks5,
}

impl FromStr for SocksProtocol {
    type Err = PtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks4" => Ok(Self::Socks4),
            "socks5" => Ok(Self::Socks5),
            other => Err(PtError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for SocksProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks4 => write!(f, "socks4"),
            Self::Socks5 => write!(f, "socks5"),
        }
    }
}

/// The local SOCKS endpoint a transport advertised with a `CMETHOD` line.
///
/// Immutable once parsed; shared by value between the supervisor and the
/// chain builder.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub protocol: SocksProtocol,
    pub addr: SocketAddr,
    pub args: Vec<String>,
    pub opt_args: Vec<String>,
}

impl MethodSpec {
    /// Parse the fields following the `CMETHOD` keyword:
    /// `<name> <socks4|socks5> <host>:<port> [ARGS=v1,v2,…] [OPT-ARGS=v1,…]`
    pub fn from_fields(fields: &[&str]) -> Result<Self, PtError> {
        let [name, protocol, addr, rest @ ..] = fields else {
            return Err(PtError::MalformedMethod(fields.join(" ")));
        };
        let protocol = protocol.parse()?;
        let addr = addr
            .parse()
            .map_err(|_| PtError::MalformedMethod(fields.join(" ")))?;

        let mut args = Vec::new();
        let mut opt_args = Vec::new();
        for field in rest {
            if let Some(values) = field.strip_prefix("ARGS=") {
                args = values.split(',').map(str::to_string).collect();
            } else if let Some(values) = field.strip_prefix("OPT-ARGS=") {
                opt_args = values.split(',').map(str::to_string).collect();
            }
        }

        Ok(Self {
            name: name.to_string(),
            protocol,
            addr,
            args,
            opt_args,
        })
    }
}
