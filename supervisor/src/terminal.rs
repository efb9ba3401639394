//! Raw-ish terminal mode for single-keystroke commands.
//!
//! Canonical mode and echo are switched off; `ISIG` is left alone so the line
//! discipline still turns Ctrl-C into `SIGINT` for the whole foreground group.

use crate::error::SupervisorError;

#[cfg(unix)]
pub struct TerminalGuard {
    original: Option<nix::sys::termios::Termios>,
    interrupt: u8,
}

#[cfg(unix)]
impl TerminalGuard {
    /// Fails when stdin is not a terminal or its attributes cannot be changed;
    /// callers fall back to line mode.
    pub fn enter_character_mode() -> Result<Self, SupervisorError> {
        use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices};
        use std::io::IsTerminal;

        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Err(SupervisorError::Terminal("stdin is not a terminal".into()));
        }

        let original = tcgetattr(&stdin)
            .map_err(|e| SupervisorError::Terminal(format!("tcgetattr: {e}")))?;
        let interrupt = original.control_chars[SpecialCharacterIndices::VINTR as usize];

        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)
            .map_err(|e| SupervisorError::Terminal(format!("tcsetattr: {e}")))?;

        Ok(Self {
            original: Some(original),
            interrupt,
        })
    }

    /// The byte the terminal maps to `SIGINT` (usually 0x03).
    pub fn interrupt_byte(&self) -> u8 {
        self.interrupt
    }

    /// Puts back the attributes captured on entry. Idempotent.
    pub fn restore(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};

        if let Some(original) = self.original.take() {
            if let Err(e) = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &original) {
                tracing::warn!("failed to restore terminal settings: {e}");
            }
        }
    }
}

#[cfg(not(unix))]
pub struct TerminalGuard;

#[cfg(not(unix))]
impl TerminalGuard {
    pub fn enter_character_mode() -> Result<Self, SupervisorError> {
        Err(SupervisorError::Terminal(
            "character mode is only supported on Unix".into(),
        ))
    }

    pub fn interrupt_byte(&self) -> u8 {
        crate::commands::DEFAULT_INTERRUPT_BYTE
    }

    pub fn restore(&mut self) {}
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.restore();
    }
}
