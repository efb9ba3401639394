//! Interactive commands and OS signals, delivered as [`SupervisorEvent::Command`].
//!
//! At start the dispatcher negotiates an input strategy: character mode (Unix
//! terminal with canonical mode and echo switched off) or line mode (any other
//! stdin). Both map input to the same three commands:
//!
//! | input                              | command   |
//! |------------------------------------|-----------|
//! | `r`                                | reload    |
//! | `R`                                | restart   |
//! | `q`, `Q`, `quit`, `exit` (any case) | quit      |
//!
//! `SIGINT`/`SIGTERM` (Ctrl-C elsewhere) and the terminal's interrupt byte are
//! sent through the same channel, so every shutdown trigger takes one path.

use std::io::{self, BufRead, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{Command, QuitSource, SupervisorEvent};
use crate::orchestrator::EventSource;
use crate::signals::ShutdownSignals;
use crate::terminal::TerminalGuard;

/// ASCII ETX, the usual `VINTR` character.
pub const DEFAULT_INTERRUPT_BYTE: u8 = 0x03;

/// Maps one keystroke in character mode.
pub fn parse_key(byte: u8, interrupt: u8) -> Option<Command> {
    if byte == interrupt {
        return Some(Command::Quit(QuitSource::Interrupt));
    }
    match byte {
        b'r' => Some(Command::Reload),
        b'R' => Some(Command::Restart),
        b'q' | b'Q' => Some(Command::Quit(QuitSource::Keyboard)),
        _ => None,
    }
}

/// Maps one line in line mode. Reload and restart are case-sensitive; quit
/// words are not.
pub fn parse_line(line: &str) -> Option<Command> {
    let word = line.trim();
    match word {
        "r" => Some(Command::Reload),
        "R" => Some(Command::Restart),
        _ if matches!(word.to_lowercase().as_str(), "q" | "quit" | "exit") => {
            Some(Command::Quit(QuitSource::Keyboard))
        }
        _ => None,
    }
}

/// A blocking source of commands. Runs on a dedicated thread.
pub trait InputStrategy: Send + 'static {
    fn name(&self) -> &'static str;

    /// Blocks until the next recognised command. `Ok(None)` means end of input.
    fn next_command(&mut self) -> io::Result<Option<Command>>;
}

pub struct CharacterInput<R> {
    input: R,
    interrupt: u8,
}

impl<R: Read + Send + 'static> CharacterInput<R> {
    pub fn new(input: R, interrupt: u8) -> Self {
        Self { input, interrupt }
    }
}

impl<R: Read + Send + 'static> InputStrategy for CharacterInput<R> {
    fn name(&self) -> &'static str {
        "character"
    }

    fn next_command(&mut self) -> io::Result<Option<Command>> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if let Some(command) = parse_key(byte[0], self.interrupt) {
                        return Ok(Some(command));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct LineInput<R> {
    input: R,
}

impl<R: BufRead + Send + 'static> LineInput<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead + Send + 'static> InputStrategy for LineInput<R> {
    fn name(&self) -> &'static str {
        "line"
    }

    fn next_command(&mut self) -> io::Result<Option<Command>> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.input.read_line(&mut line) {
                Ok(0) => return Ok(None),
                Ok(_) => match parse_line(&line) {
                    Some(command) => return Ok(Some(command)),
                    None if line.trim().is_empty() => {}
                    None => info!("unknown command {:?} (r = reload, R = restart, q = quit)", line.trim()),
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Owns the controlling terminal for the lifetime of the supervisor.
pub struct CommandDispatcher {
    mode: &'static str,
    terminal: Option<TerminalGuard>,
    stopped: Arc<AtomicBool>,
    signal_task: Option<JoinHandle<()>>,
}

impl CommandDispatcher {
    /// Negotiates the input strategy, starts reading stdin and listens for
    /// shutdown signals. Must be called from within a Tokio runtime.
    pub fn start(tx: mpsc::Sender<SupervisorEvent>) -> Self {
        let (input, terminal): (Box<dyn InputStrategy>, Option<TerminalGuard>) =
            match TerminalGuard::enter_character_mode() {
                Ok(guard) => {
                    let interrupt = guard.interrupt_byte();
                    (Box::new(CharacterInput::new(io::stdin(), interrupt)), Some(guard))
                }
                Err(e) => {
                    debug!("falling back to line mode: {e}");
                    (Box::new(LineInput::new(io::BufReader::new(io::stdin()))), None)
                }
            };

        let signal_task = match ShutdownSignals::new() {
            Ok(signals) => Some(spawn_signal_listener(signals, tx.clone())),
            Err(e) => {
                warn!("failed to install signal handlers: {e}");
                None
            }
        };

        let dispatcher = Self::with_input(input, terminal, signal_task, tx);
        info!("press r to reload, R to restart, q to quit");
        dispatcher
    }

    /// Runs `input` on its own thread, forwarding commands to `tx`.
    pub fn with_input(
        input: Box<dyn InputStrategy>,
        terminal: Option<TerminalGuard>,
        signal_task: Option<JoinHandle<()>>,
        tx: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let mode = input.name();
        let stopped = Arc::new(AtomicBool::new(false));
        {
            let stopped = Arc::clone(&stopped);
            // Detached: a blocked stdin read cannot be cancelled, and the
            // thread must not hold up runtime shutdown.
            let spawned = std::thread::Builder::new()
                .name("command-input".into())
                .spawn(move || pump(input, tx, stopped));
            if let Err(e) = spawned {
                warn!("failed to start command input thread: {e}");
            }
        }
        debug!(mode, "command dispatcher started");

        Self {
            mode,
            terminal,
            stopped,
            signal_task,
        }
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    /// Stops dispatching and restores the terminal settings captured at
    /// start. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        if let Some(mut terminal) = self.terminal.take() {
            terminal.restore();
        }
        debug!("command dispatcher stopped");
    }
}

impl EventSource for CommandDispatcher {
    fn name(&self) -> &'static str {
        "command dispatcher"
    }

    fn stop(&mut self) {
        CommandDispatcher::stop(self);
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_signal_listener(
    mut signals: ShutdownSignals,
    tx: mpsc::Sender<SupervisorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let source = signals.recv().await;
            debug!(?source, "shutdown signal received");
            if tx
                .send(SupervisorEvent::Command(Command::Quit(source)))
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

fn pump(
    mut input: Box<dyn InputStrategy>,
    tx: mpsc::Sender<SupervisorEvent>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        match input.next_command() {
            Ok(Some(command)) => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                if tx.blocking_send(SupervisorEvent::Command(command)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("stdin closed; no more interactive commands");
                break;
            }
            Err(e) => {
                warn!("failed to read stdin: {e}");
                break;
            }
        }
    }
}
