//! Child process supervision
//!
//! Spawns the minimal set of children covering the requested transports
//! (transports with byte-identical command lines share one child), wires
//! each child's stdout into the status reader, and makes sure no child
//! outlives the parent.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::reader::read_methods;
use super::{ChildMethods, MethodSpec, PtError};

/// Compute the environment for a transport child.
///
/// All `TOR_PT_*` variables are stripped from the parent environment, then
/// the managed-transport contract is re-established: the supported version,
/// the exact transports this child must provide, and the state directory
/// re-rooted into a `fog` subdirectory when the parent gave us one.
pub fn child_environment(
    parent: impl IntoIterator<Item = (String, String)>,
    pt_names: &[String],
    state_dir: Option<&Path>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = parent
        .into_iter()
        .filter(|(key, _)| !key.starts_with("TOR_PT_"))
        .collect();
    env.push(("TOR_PT_MANAGED_TRANSPORT_VER".into(), "1".into()));
    env.push(("TOR_PT_CLIENT_TRANSPORTS".into(), pt_names.join(",")));
    if let Some(dir) = state_dir {
        env.push((
            "TOR_PT_STATE_LOCATION".into(),
            dir.join("fog").to_string_lossy().into_owned(),
        ));
    }
    env
}

/// A spawned transport child and the transports it must provide.
///
/// The process handle stays owned here for the whole run: the child is
/// spawned with `kill_on_drop`, so dropping the handle terminates it, and on
/// Linux `PR_SET_PDEATHSIG` additionally terminates it if this process dies
/// without unwinding.
#[derive(Debug)]
pub struct ChildPt {
    names: Vec<String>,
    #[allow(dead_code)] // held for kill_on_drop
    child: Child,
    outcome: Option<oneshot::Receiver<Result<ChildMethods, PtError>>>,
}

/// Spawn one child covering `pt_names`, all of which share `cmdline`.
pub fn spawn_child(
    cmdline: &[String],
    pt_names: &[String],
    state_dir: Option<&Path>,
) -> Result<ChildPt, PtError> {
    let (program, args) = cmdline.split_first().ok_or(PtError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(child_environment(std::env::vars(), pt_names, state_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|source| PtError::Spawn {
        command: program.clone(),
        source,
    })?;
    debug!(command = %program, transports = ?pt_names, "launched transport child");

    let stdout = child.stdout.take().ok_or(PtError::NoStdout)?;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let outcome = read_methods(&mut reader).await;
        let ready = outcome.is_ok();
        if tx.send(outcome).is_err() {
            warn!("transport child outcome dropped before delivery");
        }
        if ready {
            // Keep draining so the child never blocks on a full stdout pipe.
            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
        }
    });

    Ok(ChildPt {
        names: pt_names.to_vec(),
        child,
        outcome: Some(rx),
    })
}

impl ChildPt {
    /// The transports this child is expected to provide.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Wait for the child to become ready or fail, and resolve one result
    /// per expected transport: its method spec, the child's rejection, or
    /// the child-wide failure.
    pub async fn wait_methods(&mut self) -> HashMap<String, Result<MethodSpec, PtError>> {
        let outcome = match self.outcome.take() {
            Some(rx) => rx.await.unwrap_or(Err(PtError::EarlyEof)),
            None => Err(PtError::ChildFailed("already waited on".into())),
        };
        let mut resolved = HashMap::with_capacity(self.names.len());
        match outcome {
            Ok(ready) => {
                for name in &self.names {
                    let result = match ready.methods.get(name) {
                        Some(spec) => Ok(spec.clone()),
                        None => match ready.rejected.get(name) {
                            Some(reason) => Err(PtError::MethodRejected(reason.clone())),
                            None => Err(PtError::MissingMethod),
                        },
                    };
                    resolved.insert(name.clone(), result);
                }
            }
            Err(err) => {
                let reason = err.to_string();
                for name in &self.names {
                    resolved.insert(name.clone(), Err(PtError::ChildFailed(reason.clone())));
                }
            }
        }
        resolved
    }
}
