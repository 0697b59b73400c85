//! Status stream reader for a managed transport child
//!
//! A freshly launched child reports on stdout, one line at a time:
//!
//! ```text
//! VERSION 1
//! CMETHOD obfs3 socks4 127.0.0.1:34521
//! CMETHODS DONE
//! ```
//!
//! The reader drives this exchange to exactly one outcome: ready with the
//! advertised methods, or failed (version mismatch, stream ending before
//! `CMETHODS DONE`). Unrecognized lines are ignored.

use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, trace};

use super::{MethodSpec, PtError};

/// Everything a child advertised before `CMETHODS DONE`.
#[derive(Debug, Default)]
pub struct ChildMethods {
    /// Method name → advertised SOCKS endpoint.
    pub methods: HashMap<String, MethodSpec>,
    /// Method name → reason, for `CMETHOD-ERROR` lines.
    pub rejected: HashMap<String, String>,
}

/// Consume a child's status stream until it is ready or has failed.
///
/// Returns the advertised methods on `CMETHODS DONE`. Fails on an
/// unsupported `VERSION` or on end-of-stream before `CMETHODS DONE`.
/// Output after `CMETHODS DONE` is never read.
pub async fn read_methods<R>(stream: &mut R) -> Result<ChildMethods, PtError>
where
    R: AsyncBufRead + Unpin,
{
    let mut out = ChildMethods::default();
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Err(PtError::EarlyEof);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        trace!("child: {trimmed}");
        let mut fields = trimmed.split_whitespace();
        match fields.next() {
            Some("VERSION") => {
                let version = fields.next().unwrap_or_default();
                if version != "1" {
                    return Err(PtError::UnsupportedVersion(version.to_string()));
                }
            }
            Some("CMETHOD") => {
                let rest: Vec<&str> = fields.collect();
                match MethodSpec::from_fields(&rest) {
                    Ok(spec) => {
                        out.methods.insert(spec.name.clone(), spec);
                    }
                    Err(err) => debug!("ignoring malformed CMETHOD line: {err}"),
                }
            }
            Some("CMETHOD-ERROR") => {
                if let Some(name) = fields.next() {
                    let reason: Vec<&str> = fields.collect();
                    out.rejected.insert(name.to_string(), reason.join(" "));
                }
            }
            Some("CMETHODS") if fields.next() == Some("DONE") => return Ok(out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt::SocksProtocol;
    use tokio::io::BufReader;

    async fn read(input: &str) -> Result<ChildMethods, PtError> {
        let mut reader = BufReader::new(input.as_bytes());
        read_methods(&mut reader).await
    }

    #[tokio::test]
    async fn ready_with_methods() {
        let out = read(
            "VERSION 1\n\
             CMETHOD obfs3 socks4 127.0.0.1:34521\n\
             CMETHOD websocket socks5 127.0.0.1:40123 ARGS=key,mode\n\
             CMETHODS DONE\n\
             CMETHOD late socks4 127.0.0.1:1\n",
        )
        .await
        .unwrap();
        assert_eq!(out.methods.len(), 2);
        assert_eq!(out.methods["obfs3"].protocol, SocksProtocol::Socks4);
        assert_eq!(out.methods["websocket"].args, vec!["key", "mode"]);
        assert!(out.rejected.is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_fails() {
        let err = read("VERSION 2\nCMETHODS DONE\n").await.unwrap_err();
        assert!(matches!(err, PtError::UnsupportedVersion(v) if v == "2"));
    }

    #[tokio::test]
    async fn eof_before_done_fails() {
        let err = read("VERSION 1\nCMETHOD obfs3 socks4 127.0.0.1:34521\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PtError::EarlyEof));
    }

    #[tokio::test]
    async fn unrecognized_lines_ignored() {
        let out = read(
            "VERSION 1\n\
             LOG something harmless\n\
             \n\
             CMETHOD b64 socks4 127.0.0.1:2000\n\
             CMETHODS DONE\n",
        )
        .await
        .unwrap();
        assert_eq!(out.methods.len(), 1);
    }

    #[tokio::test]
    async fn cmethod_error_recorded() {
        let out = read(
            "VERSION 1\n\
             CMETHOD-ERROR obfs2 no such transport is supported\n\
             CMETHOD b64 socks4 127.0.0.1:2000\n\
             CMETHODS DONE\n",
        )
        .await
        .unwrap();
        assert_eq!(out.rejected["obfs2"], "no such transport is supported");
        assert_eq!(out.methods.len(), 1);
    }

    #[tokio::test]
    async fn crlf_terminators_accepted() {
        let out = read("VERSION 1\r\nCMETHOD b64 socks4 127.0.0.1:2000\r\nCMETHODS DONE\r\n")
            .await
            .unwrap();
        assert!(out.methods.contains_key("b64"));
    }
}
