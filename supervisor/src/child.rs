//! Child process lifecycle: spawn, output forwarding, exit monitoring and
//! escalating termination.
//!
//! A spawned child is tagged with a `generation`. Its stdout/stderr lines are
//! echoed to the supervisor's own streams and scanned for the live-patch
//! announcement; its exit is reported as [`SupervisorEvent::ChildExited`].
//! On Unix the child leads its own process group, so terminal Ctrl+C reaches
//! only the supervisor and termination signals reach the child's whole tree.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::event::SupervisorEvent;
use crate::service::discover_address;

/// Set on every supervised child. A process that sees it runs the user
/// program instead of starting another supervisor.
pub const SUPERVISED_ENV: &str = "LIVERELOAD_SUPERVISED";

/// Longest run of child output forwarded in one piece. A longer line is
/// passed through in several chunks.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// What to run as the supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl ChildCommand {
    /// Builds a command from an argv-style list; the first item is the program.
    pub fn from_argv<I, S>(argv: I) -> Result<Self, SupervisorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next().ok_or(SupervisorError::EmptyCommand)?;
        if program.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        Ok(Self {
            program,
            args: argv.collect(),
            envs: Vec::new(),
        })
    }

    /// The running executable with the current arguments, for self-relaunch.
    pub fn relaunch() -> anyhow::Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| anyhow::anyhow!("Failed to locate current executable: {e}"))?;
        Ok(Self {
            program: exe.into_os_string(),
            args: std::env::args_os().skip(1).collect(),
            envs: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts children. The orchestrator owns the only instance.
#[async_trait]
pub trait Launcher: Send {
    async fn spawn(
        &mut self,
        generation: u64,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Box<dyn ChildHandle>, SupervisorError>;
}

/// A running child. Only its owner (the orchestrator) may terminate it.
#[async_trait]
pub trait ChildHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Asks the child to stop, escalating to a forceful kill after `grace`,
    /// and waits for the exit code. Returns `None` only if the child could not
    /// be confirmed gone.
    async fn terminate(&mut self, grace: Duration) -> Option<i32>;
}

pub struct ProcessLauncher {
    command: ChildCommand,
}

impl ProcessLauncher {
    pub fn new(command: ChildCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn spawn(
        &mut self,
        generation: u64,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Box<dyn ChildHandle>, SupervisorError> {
        let child = ChildProcess::spawn(&self.command, generation, events)?;
        Ok(Box::new(child))
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

pub struct ChildProcess {
    pid: Option<u32>,
    /// Filled by the monitor task once the process has been reaped.
    exit: watch::Receiver<Option<i32>>,
    /// Asks the monitor task to kill the process. Dropping it does the same.
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ChildProcess {
    pub fn spawn(
        command: &ChildCommand,
        generation: u64,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .env(SUPERVISED_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: command.display(),
            source,
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, generation, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, generation, events.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(child, generation, exit_tx, kill_rx, events));

        info!(pid = ?pid, generation, command = %command.display(), "child started");
        Ok(Self {
            pid,
            exit: exit_rx,
            kill_tx: Some(kill_tx),
        })
    }

    /// The exit code, if the child has already been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    async fn wait(&mut self) -> Option<i32> {
        self.exit.wait_for(|code| code.is_some()).await.ok().and_then(|code| *code)
    }

    /// The monitor task kills the whole process group.
    fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, ?signal, "signalled child process group"),
        // Already gone.
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, "failed to signal child: {e}"),
    }
}

#[async_trait]
impl ChildHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }

        #[cfg(unix)]
        {
            signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);
            if let Ok(code) = tokio::time::timeout(grace, self.wait()).await {
                return code;
            }
            warn!(pid = ?self.pid, "child ignored SIGTERM for {grace:?}; killing");
        }

        self.force_kill();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(code) => code,
            Err(_) => {
                error!(pid = ?self.pid, "child still running after kill");
                None
            }
        }
    }
}

/// Owns the OS handle: reaps the process, publishes its exit code and reports
/// the exit to the orchestrator.
async fn monitor(
    mut child: Child,
    generation: u64,
    exit_tx: watch::Sender<Option<i32>>,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<SupervisorEvent>,
) {
    // Read before the wait: the id is gone once the process is reaped.
    let pid = child.id();
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        // Fires on an explicit kill request and when the handle is dropped.
        _ = &mut kill_rx => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            // The leader is not reaped yet, so the group id is still ours.
            #[cfg(unix)]
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(generation, "failed to reap child: {e}");
            -1
        }
    };
    exit_tx.send_replace(Some(code));
    debug!(generation, code, "child exited");
    let _ = events
        .send(SupervisorEvent::ChildExited { generation, code })
        .await;
}

/// The process exit code, or `128 + signal` for a signal death.
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

/// Echoes each line to our own stream and reports live-patch announcements.
/// Invalid UTF-8 is forwarded lossily rather than ending the stream, and a
/// line longer than [`MAX_LINE_BYTES`] is forwarded in pieces.
async fn forward_lines<R>(
    reader: R,
    stream: Stream,
    generation: u64,
    events: mpsc::Sender<SupervisorEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match next_chunk(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(generation, ?stream, "child stream closed: {e}");
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        match (stream, text.ends_with('\n')) {
            (Stream::Stdout, true) => println!("{line}"),
            (Stream::Stderr, true) => eprintln!("{line}"),
            // A piece of a longer line, or the unterminated tail.
            (Stream::Stdout, false) => print!("{text}"),
            (Stream::Stderr, false) => eprint!("{text}"),
        }
        if let Some(address) = discover_address(line) {
            debug!(generation, %address, "live-patch endpoint announced");
            let announced = SupervisorEvent::ServiceAnnounced {
                generation,
                address,
            };
            if events.send(announced).await.is_err() {
                break;
            }
        }
    }
}

/// Reads up to and including the next newline, but never more than `limit`
/// bytes. Returns 0 at end of stream.
async fn next_chunk<R>(reader: &mut R, buf: &mut Vec<u8>, limit: u64) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    (&mut *reader).take(limit).read_until(b'\n', buf).await
}
