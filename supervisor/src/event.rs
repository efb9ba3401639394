use std::path::PathBuf;

/// Everything the orchestrator reacts to. Produced by the file watcher, the
/// command dispatcher and the child-process monitor; consumed serially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A debounced burst of accepted file changes. Carries the last path seen.
    FileChanged(PathBuf),
    /// An interactive command or an OS signal routed through the dispatcher.
    Command(Command),
    /// The child with this generation printed its live-patch endpoint.
    ServiceAnnounced { generation: u64, address: String },
    /// The child with this generation exited with `code`.
    ChildExited { generation: u64, code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Live patch, falling back to a restart.
    Reload,
    /// Full restart, skipping the live-patch attempt.
    Restart,
    Quit(QuitSource),
}

/// Where a quit request came from. Every source shuts down the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitSource {
    Keyboard,
    /// SIGINT, Ctrl+C, or the interrupt byte read in character mode.
    Interrupt,
    /// SIGTERM / SIGQUIT.
    Terminate,
}

impl SupervisorEvent {
    /// File changes and reload/restart commands: the events that start a cycle.
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            SupervisorEvent::FileChanged(_)
                | SupervisorEvent::Command(Command::Reload)
                | SupervisorEvent::Command(Command::Restart)
        )
    }
}
