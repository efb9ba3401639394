//! OS shutdown signals.
//!
//! **Unix:** `SIGINT`, `SIGTERM` and `SIGQUIT`.
//! **Other platforms:** Ctrl-C via [`tokio::signal::ctrl_c`].
//!
//! Listeners are registered when [`ShutdownSignals::new`] returns, so a signal
//! raised afterwards is never lost to the default handler.

use crate::event::QuitSource;

#[cfg(unix)]
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the next shutdown signal.
    pub async fn recv(&mut self) -> QuitSource {
        tokio::select! {
            _ = self.sigint.recv()  => QuitSource::Interrupt,
            _ = self.sigterm.recv() => QuitSource::Terminate,
            _ = self.sigquit.recv() => QuitSource::Terminate,
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> QuitSource {
        if tokio::signal::ctrl_c().await.is_err() {
            // No Ctrl-C support: never resolve.
            std::future::pending::<()>().await;
        }
        QuitSource::Interrupt
    }
}
