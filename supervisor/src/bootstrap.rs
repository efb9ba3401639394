//! Wiring and the two-phase entry point.
//!
//! A program embedding the supervisor calls [`run`] from `main`. The first
//! invocation (phase 1) relaunches the same executable with the same
//! arguments as its supervised child; the child sees [`SUPERVISED_ENV`] and
//! runs the user program directly (phase 2) instead of recursing.

use std::ffi::OsString;
use std::future::Future;

use tracing::debug;

use crate::child::{ChildCommand, Launcher, ProcessLauncher, SUPERVISED_ENV};
use crate::commands::CommandDispatcher;
use crate::config::ReloadConfig;
use crate::error::SupervisorError;
use crate::event::SupervisorEvent;
use crate::orchestrator::Orchestrator;
use crate::service::{Connector, TcpConnector};
use crate::watcher::FileWatcher;

/// True inside a supervised child.
pub fn is_supervised() -> bool {
    supervised_from(std::env::var_os(SUPERVISED_ENV))
}

fn supervised_from(value: Option<OsString>) -> bool {
    matches!(value, Some(v) if !v.is_empty() && v != "0")
}

/// Starts the watcher and the command dispatcher around an orchestrator and
/// runs it to completion. Returns the supervisor's exit code; errors only
/// when the sources cannot be installed.
pub async fn supervise(
    config: &ReloadConfig,
    launcher: Box<dyn Launcher>,
    connector: Box<dyn Connector>,
) -> Result<i32, SupervisorError> {
    let mut orchestrator = Orchestrator::new(config, launcher, connector);

    let tx = orchestrator.sender();
    let watcher = FileWatcher::start(config, move |path| {
        // A full queue means a cycle is in flight; the change would be dropped anyway.
        if let Err(e) = tx.try_send(SupervisorEvent::FileChanged(path)) {
            debug!("change not queued: {e}");
        }
    })?;
    orchestrator.attach(Box::new(watcher));

    let dispatcher = CommandDispatcher::start(orchestrator.sender());
    orchestrator.attach(Box::new(dispatcher));

    Ok(orchestrator.run().await)
}

/// Supervises the current executable, or runs `program` when this process is
/// already the supervised child.
pub async fn run<F, Fut>(config: &ReloadConfig, program: F) -> anyhow::Result<i32>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<i32>>,
{
    run_phase(is_supervised(), config, program).await
}

async fn run_phase<F, Fut>(supervised: bool, config: &ReloadConfig, program: F) -> anyhow::Result<i32>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<i32>>,
{
    if supervised {
        return program().await;
    }

    let command = ChildCommand::relaunch()?;
    debug!(command = %command.display(), "relaunching under supervision");
    let launcher = ProcessLauncher::new(command);
    let connector = TcpConnector::new(config.connect_timeout(), config.reload_timeout());
    Ok(supervise(config, Box::new(launcher), Box::new(connector)).await?)
}
