//! Transport catalog and chain alias configuration
//!
//! The configuration is a line-oriented text format with shell-style
//! quoting:
//!
//! ```text
//! # comment
//! ClientTransportPlugin obfs3,obfs4 /usr/bin/obfsproxy managed
//! Alias obfs3_websocket obfs3|websocket
//! ```
//!
//! `ClientTransportPlugin` binds one or more transport names to the command
//! line that provides them; transports listed together share one child
//! process. `Alias` names a chain of two or more transports. Unknown
//! directives are skipped with a warning.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use thiserror::Error;
use tracing::warn;

/// Configuration errors. All variants are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: unbalanced quoting")]
    Quoting { line: usize },

    #[error("line {line}: incomplete {directive} directive")]
    Truncated { line: usize, directive: String },

    #[error("line {line}: duplicate ClientTransportPlugin for transport {name:?}")]
    DuplicateTransport { line: usize, name: String },

    #[error("line {line}: duplicate Alias {name:?}")]
    DuplicateAlias { line: usize, name: String },

    #[error("line {line}: chain {chain:?} needs at least two transports")]
    ChainTooShort { line: usize, chain: String },

    #[error("line {line}: chain {chain:?} references unknown transport {transport:?}")]
    UnknownTransport {
        line: usize,
        chain: String,
        transport: String,
    },
}

/// Immutable transport catalog and chain aliases.
///
/// Constructed once at startup; never mutated afterwards, so it can be
/// shared freely between tasks.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport name → command line that launches it.
    transports: HashMap<String, Vec<String>>,
    /// Chain alias → ordered transport names (length ≥ 2).
    chains: HashMap<String, Vec<String>>,
    /// Command line → chain aliases containing any transport it provides.
    by_cmdline: HashMap<Vec<String>, BTreeSet<String>>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse a configuration blob.
    ///
    /// Alias references are validated against the complete transport catalog
    /// after all lines have been consumed, so directive order does not
    /// matter.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut transports: HashMap<String, Vec<String>> = HashMap::new();
        // (line, alias, transport names) pending catalog validation
        let mut aliases: Vec<(usize, String, Vec<String>)> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tokens = shell_words::split(line)
                .map_err(|_| ConfigError::Quoting { line: line_no })?;
            let Some(directive) = tokens.first() else {
                continue;
            };
            match directive.as_str() {
                "ClientTransportPlugin" => {
                    if tokens.len() < 3 {
                        return Err(ConfigError::Truncated {
                            line: line_no,
                            directive: directive.clone(),
                        });
                    }
                    let cmdline = tokens[2..].to_vec();
                    for name in tokens[1].split(',') {
                        if name.is_empty() {
                            return Err(ConfigError::Truncated {
                                line: line_no,
                                directive: directive.clone(),
                            });
                        }
                        if transports.insert(name.to_string(), cmdline.clone()).is_some() {
                            return Err(ConfigError::DuplicateTransport {
                                line: line_no,
                                name: name.to_string(),
                            });
                        }
                    }
                }
                "Alias" => {
                    if tokens.len() < 3 {
                        return Err(ConfigError::Truncated {
                            line: line_no,
                            directive: directive.clone(),
                        });
                    }
                    let name = tokens[1].clone();
                    if aliases.iter().any(|(_, existing, _)| *existing == name) {
                        return Err(ConfigError::DuplicateAlias {
                            line: line_no,
                            name,
                        });
                    }
                    let pts: Vec<String> = tokens[2].split('|').map(str::to_string).collect();
                    if pts.len() < 2 || pts.iter().any(String::is_empty) {
                        return Err(ConfigError::ChainTooShort {
                            line: line_no,
                            chain: name,
                        });
                    }
                    aliases.push((line_no, name, pts));
                }
                _ => {
                    warn!(line = line_no, "skipping unknown configuration directive {directive:?}");
                }
            }
        }

        let mut chains: HashMap<String, Vec<String>> = HashMap::new();
        for (line_no, name, pts) in aliases {
            for pt in &pts {
                if !transports.contains_key(pt) {
                    return Err(ConfigError::UnknownTransport {
                        line: line_no,
                        chain: name,
                        transport: pt.clone(),
                    });
                }
            }
            chains.insert(name, pts);
        }

        let mut by_cmdline: HashMap<Vec<String>, BTreeSet<String>> = HashMap::new();
        for (alias, pts) in &chains {
            for pt in pts {
                by_cmdline
                    .entry(transports[pt].clone())
                    .or_default()
                    .insert(alias.clone());
            }
        }

        Ok(Self {
            transports,
            chains,
            by_cmdline,
        })
    }

    /// Names of all configured chains.
    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    /// The ordered transport names of a chain.
    pub fn chain(&self, alias: &str) -> Option<&[String]> {
        self.chains.get(alias).map(Vec::as_slice)
    }

    /// The command line that launches a transport.
    pub fn cmdline(&self, transport: &str) -> Option<&[String]> {
        self.transports.get(transport).map(Vec::as_slice)
    }

    /// The chains that depend on a command line (any of the transports it
    /// provides appears in them).
    pub fn chains_for_cmdline(&self, cmdline: &[String]) -> Option<&BTreeSet<String>> {
        self.by_cmdline.get(cmdline)
    }

    /// Unique command lines needed to cover every transport referenced by
    /// the requested chains, in first-use order.
    pub fn cmdlines_for(&self, requested: &[String]) -> Vec<Vec<String>> {
        let mut seen: HashSet<&[String]> = HashSet::new();
        let mut out = Vec::new();
        for alias in requested {
            let Some(pts) = self.chains.get(alias) else {
                continue;
            };
            for pt in pts {
                let cmdline = &self.transports[pt];
                if seen.insert(cmdline) {
                    out.push(cmdline.clone());
                }
            }
        }
        out
    }

    /// Unique transport names launched by `cmdline` that appear in any of
    /// the requested chains, sorted.
    pub fn pts_for_cmdline(&self, cmdline: &[String], requested: &[String]) -> Vec<String> {
        let mut names: BTreeSet<&str> = BTreeSet::new();
        for alias in requested {
            let Some(pts) = self.chains.get(alias) else {
                continue;
            };
            for pt in pts {
                if self.transports[pt] == cmdline {
                    names.insert(pt);
                }
            }
        }
        names.into_iter().map(str::to_string).collect()
    }
}
