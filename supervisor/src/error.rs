use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop the supervisor from starting or keep it from continuing.
///
/// Live-patch failures are deliberately absent: they are recovered by a
/// restart and reported as [`crate::service::ReloadOutcome::Failure`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// None of the configured watch roots exist on disk.
    #[error("no watch path exists (configured: {})", display_paths(.paths))]
    NoWatchRoots { paths: Vec<PathBuf> },

    #[error("failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child command line was empty.
    #[error("no command to supervise")]
    EmptyCommand,

    #[error("terminal mode unavailable: {0}")]
    Terminal(String),

    /// Every producer of supervisor events has gone away.
    #[error("event queue closed")]
    EventQueueClosed,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
