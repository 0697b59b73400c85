//! Managed-transport surface toward the controlling parent
//!
//! The parent configures us through `TOR_PT_*` environment variables and
//! reads line-oriented status from our stdout. This module owns both
//! directions: [`parent_request`] validates the environment, [`Reporter`]
//! writes the `VERSION` / `CMETHOD` / `CMETHODS DONE` answers.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Controller handshake errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("no supported managed-transport version in {0:?}")]
    NoVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which chains the parent asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRequest {
    /// `TOR_PT_CLIENT_TRANSPORTS=*`
    All,
    Names(BTreeSet<String>),
}

impl ChainRequest {
    /// Intersect the request with the configured chain names.
    ///
    /// Returns the chains to serve and the requested names nothing is
    /// configured for, both sorted.
    pub fn select<'a>(
        &self,
        known: impl IntoIterator<Item = &'a str>,
    ) -> (Vec<String>, Vec<String>) {
        let known: BTreeSet<&str> = known.into_iter().collect();
        match self {
            Self::All => (
                known.into_iter().map(str::to_string).collect(),
                Vec::new(),
            ),
            Self::Names(names) => {
                let (selected, unknown) = names
                    .iter()
                    .cloned()
                    .partition(|name: &String| known.contains(name.as_str()));
                (selected, unknown)
            }
        }
    }
}

/// The parent's side of the managed-transport handshake.
#[derive(Debug)]
pub struct ParentRequest {
    pub chains: ChainRequest,
    pub state_dir: Option<PathBuf>,
    pub exit_on_stdin_close: bool,
}

/// Read and validate the `TOR_PT_*` handshake from the process environment.
pub fn parent_request() -> Result<ParentRequest, ControllerError> {
    parent_request_from(|key| std::env::var(key).ok())
}

fn parent_request_from(
    get: impl Fn(&str) -> Option<String>,
) -> Result<ParentRequest, ControllerError> {
    let versions = get("TOR_PT_MANAGED_TRANSPORT_VER")
        .ok_or(ControllerError::MissingVar("TOR_PT_MANAGED_TRANSPORT_VER"))?;
    if !versions.split(',').any(|v| v == "1") {
        return Err(ControllerError::NoVersion(versions));
    }

    let transports = get("TOR_PT_CLIENT_TRANSPORTS")
        .ok_or(ControllerError::MissingVar("TOR_PT_CLIENT_TRANSPORTS"))?;
    let chains = if transports == "*" {
        ChainRequest::All
    } else {
        ChainRequest::Names(
            transports
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        )
    };

    Ok(ParentRequest {
        chains,
        state_dir: get("TOR_PT_STATE_LOCATION").map(PathBuf::from),
        exit_on_stdin_close: get("TOR_PT_EXIT_ON_STDIN_CLOSE").as_deref() == Some("1"),
    })
}

/// Serialized writer for the status lines the parent consumes.
///
/// One reporter per process; reports go out one line at a time, flushed, so
/// the parent never sees interleaved output.
pub struct Reporter<W> {
    out: W,
}

impl<W: AsyncWrite + Unpin> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Announce the negotiated managed-transport version.
    pub async fn version(&mut self) -> std::io::Result<()> {
        self.line("VERSION 1").await
    }

    /// No common managed-transport version with the parent.
    pub async fn version_error(&mut self) -> std::io::Result<()> {
        self.line("VERSION-ERROR no-version").await
    }

    /// The environment the parent provided is unusable.
    pub async fn env_error(&mut self, reason: &str) -> std::io::Result<()> {
        self.line(&format!("ENV-ERROR {}", flatten(reason))).await
    }

    /// A chain is up, reachable at the given loopback SOCKSv4 port.
    pub async fn cmethod(&mut self, alias: &str, port: u16) -> std::io::Result<()> {
        self.line(&format!("CMETHOD {alias} socks4 127.0.0.1:{port}"))
            .await
    }

    /// A chain could not be brought up.
    pub async fn cmethod_error(&mut self, alias: &str, reason: &str) -> std::io::Result<()> {
        self.line(&format!("CMETHOD-ERROR {alias} {}", flatten(reason)))
            .await
    }

    /// All requested chains have been answered.
    pub async fn cmethods_done(&mut self) -> std::io::Result<()> {
        self.line("CMETHODS DONE").await
    }

    async fn line(&mut self, line: &str) -> std::io::Result<()> {
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }
}

// Reasons may carry wrapped error chains; the protocol is one line per report.
fn flatten(reason: &str) -> String {
    reason.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn request_with_named_chains() {
        let request = parent_request_from(env(&[
            ("TOR_PT_MANAGED_TRANSPORT_VER", "1"),
            ("TOR_PT_CLIENT_TRANSPORTS", "obfs3_websocket,b64_b64"),
            ("TOR_PT_STATE_LOCATION", "/var/lib/tor/pt_state"),
        ]))
        .unwrap();
        let ChainRequest::Names(names) = &request.chains else {
            panic!("expected named chains");
        };
        assert!(names.contains("obfs3_websocket"));
        assert!(names.contains("b64_b64"));
        assert_eq!(
            request.state_dir.as_deref(),
            Some(std::path::Path::new("/var/lib/tor/pt_state"))
        );
        assert!(!request.exit_on_stdin_close);
    }

    #[test]
    fn request_all_chains() {
        let request = parent_request_from(env(&[
            ("TOR_PT_MANAGED_TRANSPORT_VER", "1,2"),
            ("TOR_PT_CLIENT_TRANSPORTS", "*"),
            ("TOR_PT_EXIT_ON_STDIN_CLOSE", "1"),
        ]))
        .unwrap();
        assert_eq!(request.chains, ChainRequest::All);
        assert!(request.exit_on_stdin_close);
    }

    #[test]
    fn missing_version_variable() {
        let err = parent_request_from(env(&[("TOR_PT_CLIENT_TRANSPORTS", "*")])).unwrap_err();
        assert!(matches!(err, ControllerError::MissingVar(_)));
    }

    #[test]
    fn unsupported_version() {
        let err = parent_request_from(env(&[
            ("TOR_PT_MANAGED_TRANSPORT_VER", "2,3"),
            ("TOR_PT_CLIENT_TRANSPORTS", "*"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::NoVersion(v) if v == "2,3"));
    }

    #[test]
    fn select_intersects_with_known() {
        let request = ChainRequest::Names(
            ["a_b".to_string(), "ghost".to_string()].into_iter().collect(),
        );
        let (selected, unknown) = request.select(["a_b", "c_d"]);
        assert_eq!(selected, vec!["a_b".to_string()]);
        assert_eq!(unknown, vec!["ghost".to_string()]);

        let (all, none) = ChainRequest::All.select(["c_d", "a_b"]);
        assert_eq!(all, vec!["a_b".to_string(), "c_d".to_string()]);
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn reporter_lines() {
        let mut out = Vec::new();
        {
            let mut reporter = Reporter::new(&mut out);
            reporter.version().await.unwrap();
            reporter.cmethod("obfs3_websocket", 45123).await.unwrap();
            reporter
                .cmethod_error("b64_b64", "transport b64: child\nexited")
                .await
                .unwrap();
            reporter.cmethods_done().await.unwrap();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "VERSION 1\n\
             CMETHOD obfs3_websocket socks4 127.0.0.1:45123\n\
             CMETHOD-ERROR b64_b64 transport b64: child exited\n\
             CMETHODS DONE\n"
        );
    }
}
