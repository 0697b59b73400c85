//! Fog client
//!
//! Combines pluggable transports into chains:
//! - Performs the managed-transport handshake with the controlling parent
//! - Launches one child per unique transport command line
//! - Builds a SOCKSv4 interceptor per requested chain and announces it
//! - Keeps serving until the parent shuts us down

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use fog::chain::Interceptor;
use fog::config::Config;
use fog::controller::{self, ControllerError, Reporter};
use fog::pt::{self, ChildPt, MethodSpec, PtError};

/// Fog client - chains pluggable transports behind a single SOCKS endpoint
#[derive(Parser, Debug)]
#[command(name = "fog-client")]
#[command(about = "Chains pluggable transports behind a single SOCKS endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults to fogrc beside the executable)
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout belongs to the parent protocol; all diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .with_writer(std::io::stderr)
        .init();

    let mut reporter = Reporter::new(tokio::io::stdout());

    let request = match controller::parent_request() {
        Ok(request) => request,
        Err(err) => {
            match &err {
                ControllerError::NoVersion(_) => reporter.version_error().await?,
                _ => reporter.env_error(&err.to_string()).await?,
            }
            return Err(err).context("managed-transport handshake failed");
        }
    };
    reporter.version().await?;

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path().context("cannot locate default configuration file")?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    info!(
        config = %config_path.display(),
        chains = config.chain_names().count(),
        "fog-client v{} starting",
        fog::VERSION
    );

    let (selected, unknown) = request.chains.select(config.chain_names());
    for alias in &unknown {
        warn!(chain = %alias, "parent requested a chain that is not configured");
        reporter
            .cmethod_error(alias, "no such chain configured")
            .await?;
    }
    if selected.is_empty() {
        reporter.cmethods_done().await?;
        bail!("no chains to serve");
    }

    // One child per unique command line across the requested chains. Spawn
    // failures are folded into the per-transport view so every dependent
    // chain reports them.
    let mut methods: HashMap<String, Result<MethodSpec, PtError>> = HashMap::new();
    let mut children: Vec<ChildPt> = Vec::new();
    for cmdline in config.cmdlines_for(&selected) {
        let names = config.pts_for_cmdline(&cmdline, &selected);
        match pt::spawn_child(&cmdline, &names, request.state_dir.as_deref()) {
            Ok(child) => children.push(child),
            Err(err) => {
                let affected = config.chains_for_cmdline(&cmdline);
                error!(command = ?cmdline, chains = ?affected, "failed to launch child: {err}");
                let reason = err.to_string();
                for name in names {
                    methods.insert(name, Err(PtError::ChildFailed(reason.clone())));
                }
            }
        }
    }
    for child in &mut children {
        methods.extend(child.wait_methods().await);
    }

    let mut served = 0usize;
    for alias in &selected {
        match chain_specs(&config, alias, &methods) {
            Ok(specs) => match Interceptor::bind(alias.clone(), specs).await {
                Ok(interceptor) => {
                    reporter.cmethod(alias, interceptor.port()).await?;
                    info!(chain = %alias, port = interceptor.port(), "chain ready");
                    tokio::spawn(interceptor.run());
                    served += 1;
                }
                Err(err) => {
                    warn!(chain = %alias, "interceptor bind failed: {err}");
                    reporter
                        .cmethod_error(alias, &format!("bind failed: {err}"))
                        .await?;
                }
            },
            Err(reason) => {
                warn!(chain = %alias, "chain unavailable: {reason}");
                reporter.cmethod_error(alias, &reason).await?;
            }
        }
    }
    reporter.cmethods_done().await?;

    if served == 0 {
        bail!("no chains could be served");
    }

    wait_for_shutdown(request.exit_on_stdin_close).await;
    info!("shutting down");
    // children are killed when their handles drop
    drop(children);
    Ok(())
}

/// Collect the method specs of a chain, head first, or a reason it cannot
/// be served.
fn chain_specs(
    config: &Config,
    alias: &str,
    methods: &HashMap<String, Result<MethodSpec, PtError>>,
) -> Result<Vec<MethodSpec>, String> {
    let Some(chain) = config.chain(alias) else {
        return Err("no such chain configured".to_string());
    };
    let mut specs = Vec::with_capacity(chain.len());
    for name in chain {
        match methods.get(name) {
            Some(Ok(spec)) => specs.push(spec.clone()),
            Some(Err(err)) => return Err(format!("transport {name}: {err}")),
            None => return Err(format!("transport {name} was never launched")),
        }
    }
    Ok(specs)
}

/// `fogrc` in the directory the executable lives in.
fn default_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("resolving executable path")?;
    let dir = exe
        .parent()
        .context("executable has no parent directory")?;
    Ok(dir.join("fogrc"))
}

async fn wait_for_shutdown(exit_on_stdin_close: bool) {
    if exit_on_stdin_close {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = stdin_eof() => info!("parent closed stdin"),
        }
    } else if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupted");
    }
}

/// Resolves when the parent closes our stdin.
async fn stdin_eof() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
