//! Recursive source watching with a single shared debounce timer.
//!
//! One notify subscription is installed per existing watch root. Every raw
//! event passes through the [`WatchFilter`]; accepted paths feed one debounce
//! task, so a save touching many files produces one `on_changed` call carrying
//! the last accepted path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReloadConfig;
use crate::error::SupervisorError;
use crate::filter::WatchFilter;
use crate::orchestrator::EventSource;

/// A single accepted filesystem change. Lives only until the debounce task
/// has folded it into the pending trigger.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub at: DateTime<Local>,
}

impl WatchEvent {
    fn now(path: PathBuf) -> Self {
        Self {
            path,
            at: Local::now(),
        }
    }
}

pub struct FileWatcher {
    /// Dropping a watcher removes its subscription.
    watchers: Vec<RecommendedWatcher>,
    cancel: CancellationToken,
    debounce_task: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Subscribes to every configured root that exists and starts the
    /// debounce task. Fails with [`SupervisorError::NoWatchRoots`] when none do.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(config: &ReloadConfig, on_changed: F) -> Result<Self, SupervisorError>
    where
        F: Fn(PathBuf) + Send + Sync + 'static,
    {
        let roots = config.existing_watch_paths();
        if roots.is_empty() {
            return Err(SupervisorError::NoWatchRoots {
                paths: config.watch_paths.clone(),
            });
        }
        for missing in config.watch_paths.iter().filter(|p| !roots.contains(p)) {
            warn!(path = %missing.display(), "watch path does not exist; skipping");
        }

        let filter = Arc::new(WatchFilter::new(
            &roots,
            &config.normalized_extensions(),
            &config.ignore_patterns,
        ));
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<WatchEvent>();

        let mut watchers = Vec::with_capacity(roots.len());
        for root in &roots {
            let filter = Arc::clone(&filter);
            let tx = raw_tx.clone();
            let mut watcher = RecommendedWatcher::new(
                move |res: notify::Result<notify::Event>| match res {
                    Ok(event) => {
                        if !is_content_change(&event.kind) {
                            return;
                        }
                        for path in event.paths {
                            if filter.should_process(&path) {
                                let _ = tx.send(WatchEvent::now(path));
                            }
                        }
                    }
                    Err(e) => warn!("file watcher error: {e}"),
                },
                NotifyConfig::default(),
            )
            .map_err(|source| SupervisorError::Watch {
                path: root.clone(),
                source,
            })?;

            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|source| SupervisorError::Watch {
                    path: root.clone(),
                    source,
                })?;
            info!(root = %root.display(), "watching for changes");
            watchers.push(watcher);
        }

        let cancel = CancellationToken::new();
        let debounce_task = tokio::spawn(debounce(
            raw_rx,
            config.debounce(),
            cancel.clone(),
            on_changed,
        ));

        Ok(Self {
            watchers,
            cancel,
            debounce_task: Some(debounce_task),
        })
    }

    /// Cancels the pending debounce timer and drops every subscription.
    /// Safe to call any number of times.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.debounce_task.take() {
            task.abort();
            debug!("file watcher stopped");
        }
        self.watchers.clear();
    }
}

impl EventSource for FileWatcher {
    fn name(&self) -> &'static str {
        "file watcher"
    }

    fn stop(&mut self) {
        FileWatcher::stop(self);
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Collapses bursts of accepted events: every event restarts the same timer,
/// and `on_changed` fires once the stream has been quiet for `window`.
async fn debounce<F>(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    window: Duration,
    cancel: CancellationToken,
    on_changed: F,
) where
    F: Fn(PathBuf),
{
    loop {
        let mut last = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => last = event,
                    None => return,
                },
                _ = tokio::time::sleep(window) => {
                    debug!(path = %last.path.display(), at = %last.at.to_rfc3339(), "change settled");
                    on_changed(last.path);
                    break;
                }
            }
        }
    }
}
