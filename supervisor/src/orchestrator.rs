//! The reload state machine.
//!
//! Every producer (file watcher, command dispatcher, signal listener, child
//! monitors) delivers into one queue, and a single task owns all state. While
//! a reload or restart cycle is in flight the queue is still drained:
//! triggers are dropped, a quit preempts the cycle, and anything else waits
//! until the cycle ends. Connecting to a newly announced service is
//! preemptible the same way, except that triggers wait instead of being
//! dropped.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::child::{ChildHandle, Launcher};
use crate::config::ReloadConfig;
use crate::error::SupervisorError;
use crate::event::{Command, QuitSource, SupervisorEvent};
use crate::service::{Connector, LivePatch, ReloadOutcome};

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Something that feeds the event queue and must be stopped on shutdown.
pub trait EventSource: Send {
    fn name(&self) -> &'static str;

    /// Must be idempotent.
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Starting,
    /// A child is up and no cycle is in flight.
    Running,
    /// A live patch is in flight.
    Reloading,
    /// The child is being replaced.
    Restarting,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Reloading => "reloading",
            SupervisorState::Restarting => "restarting",
            SupervisorState::ShuttingDown => "shutting down",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Quit(QuitSource),
    /// The current child exited on its own with this code.
    ChildLost(i32),
    /// The supervisor could not keep a child running.
    Fatal,
}

impl ShutdownReason {
    /// The supervisor's own exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Quit(_) => 0,
            ShutdownReason::ChildLost(code) => *code,
            ShutdownReason::Fatal => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// Live patch first, restart on any failure.
    Auto,
    Restart,
}

pub struct Orchestrator {
    core: Core,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
}

/// All mutable supervisor state. Only the task running [`Orchestrator::run`]
/// touches it.
struct Core {
    state_tx: watch::Sender<SupervisorState>,
    launcher: Box<dyn Launcher>,
    connector: Box<dyn Connector>,
    child: Option<Box<dyn ChildHandle>>,
    /// Generation of `child`; events carrying any other value are stale.
    generation: u64,
    connection: Option<Box<dyn LivePatch>>,
    sources: Vec<Box<dyn EventSource>>,
    /// Weak so that the queue closes once every producer is gone.
    events: mpsc::WeakSender<SupervisorEvent>,
    termination_timeout: Duration,
    reload_timeout: Duration,
    exit_code: Option<i32>,
}

impl Orchestrator {
    pub fn new(
        config: &ReloadConfig,
        launcher: Box<dyn Launcher>,
        connector: Box<dyn Connector>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (state_tx, _) = watch::channel(SupervisorState::Starting);
        let core = Core {
            state_tx,
            launcher,
            connector,
            child: None,
            generation: 0,
            connection: None,
            sources: Vec::new(),
            events: events_tx.downgrade(),
            termination_timeout: config.termination_timeout(),
            reload_timeout: config.reload_timeout(),
            exit_code: None,
        };
        Self {
            core,
            events_tx,
            events_rx,
        }
    }

    /// A producer handle for the event queue. Handles must be taken before
    /// [`run`](Self::run); the queue closes when the last one is dropped.
    pub fn sender(&self) -> mpsc::Sender<SupervisorEvent> {
        self.events_tx.clone()
    }

    /// Registers a producer to be stopped on shutdown.
    pub fn attach(&mut self, source: Box<dyn EventSource>) {
        self.core.sources.push(source);
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.core.state_tx.subscribe()
    }

    /// Spawns the first child and processes events until shutdown. Returns
    /// the exit code for the supervisor process.
    pub async fn run(self) -> i32 {
        let Orchestrator {
            mut core,
            events_tx,
            mut events_rx,
        } = self;

        if let Err(e) = core.spawn_child().await {
            error!("failed to start child: {e}");
            return core.shutdown(ShutdownReason::Fatal).await;
        }
        drop(events_tx);
        core.set_state(SupervisorState::Running);

        let mut deferred = VecDeque::new();
        loop {
            let event = match deferred.pop_front() {
                Some(event) => event,
                None => match events_rx.recv().await {
                    Some(event) => event,
                    None => {
                        info!("all event sources closed");
                        return core.shutdown(ShutdownReason::Quit(QuitSource::Terminate)).await;
                    }
                },
            };

            let cycle = match event {
                SupervisorEvent::FileChanged(path) => {
                    info!(path = %path.display(), "change detected");
                    Cycle::Auto
                }
                SupervisorEvent::Command(Command::Reload) => Cycle::Auto,
                SupervisorEvent::Command(Command::Restart) => Cycle::Restart,
                SupervisorEvent::Command(Command::Quit(source)) => {
                    return core.shutdown(ShutdownReason::Quit(source)).await;
                }
                SupervisorEvent::ServiceAnnounced { generation, address } => {
                    let connect = core.on_announced(generation, address);
                    match preemptible(connect, &mut events_rx, &mut deferred, Triggers::Defer).await {
                        Ok(()) => continue,
                        Err(source) => {
                            info!(?source, "quit requested while connecting");
                            return core.shutdown(ShutdownReason::Quit(source)).await;
                        }
                    }
                }
                SupervisorEvent::ChildExited { generation, code } => {
                    match core.on_child_exited(generation, code) {
                        Some(reason) => return core.shutdown(reason).await,
                        None => continue,
                    }
                }
            };

            let work = core.run_cycle(cycle);
            match preemptible(work, &mut events_rx, &mut deferred, Triggers::Drop).await {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => return core.shutdown(reason).await,
                Err(source) => {
                    info!(?source, "quit requested during {cycle:?} cycle");
                    return core.shutdown(ShutdownReason::Quit(source)).await;
                }
            }
        }
    }
}

/// What happens to a trigger that arrives while [`preemptible`] work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Triggers {
    /// A cycle is in flight: coalesce.
    Drop,
    Defer,
}

/// Polls `work` to completion while draining the queue. A quit cancels the
/// work and comes back as `Err`; other events wait in `deferred`.
async fn preemptible<F: Future>(
    work: F,
    events_rx: &mut mpsc::Receiver<SupervisorEvent>,
    deferred: &mut VecDeque<SupervisorEvent>,
    triggers: Triggers,
) -> Result<F::Output, QuitSource> {
    tokio::pin!(work);

    loop {
        tokio::select! {
            biased;
            output = &mut work => return Ok(output),
            Some(event) = events_rx.recv() => match event {
                SupervisorEvent::Command(Command::Quit(source)) => return Err(source),
                event if triggers == Triggers::Drop && event.is_trigger() => {
                    debug!(?event, "cycle in flight; trigger dropped")
                }
                event => deferred.push_back(event),
            },
        }
    }
}

impl Core {
    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "state changed");
        }
    }

    async fn run_cycle(&mut self, cycle: Cycle) -> Result<(), ShutdownReason> {
        if cycle == Cycle::Auto {
            self.set_state(SupervisorState::Reloading);
            let outcome = self.live_patch().await;
            if outcome.is_success() {
                info!("live patch applied");
                self.set_state(SupervisorState::Running);
                return Ok(());
            }
            if let ReloadOutcome::Failure(reason) = outcome {
                info!("live patch failed ({reason}); restarting");
            }
        } else {
            info!("restart requested");
        }

        self.set_state(SupervisorState::Restarting);
        self.release_connection().await;
        self.stop_child().await;
        if let Err(e) = self.spawn_child().await {
            error!("failed to restart child: {e}");
            return Err(ShutdownReason::Fatal);
        }
        self.set_state(SupervisorState::Running);
        Ok(())
    }

    async fn live_patch(&mut self) -> ReloadOutcome {
        let Some(connection) = self.connection.as_mut() else {
            return ReloadOutcome::Failure("no live-patch connection".into());
        };
        match tokio::time::timeout(self.reload_timeout, connection.reload()).await {
            Ok(outcome) => outcome,
            Err(_) => ReloadOutcome::Failure(format!("no reply within {:?}", self.reload_timeout)),
        }
    }

    async fn spawn_child(&mut self) -> Result<(), SupervisorError> {
        let events = self.events.upgrade().ok_or(SupervisorError::EventQueueClosed)?;
        self.generation += 1;
        let child = self.launcher.spawn(self.generation, events).await?;
        debug!(generation = self.generation, pid = ?child.pid(), "child registered");
        self.child = Some(child);
        Ok(())
    }

    async fn stop_child(&mut self) {
        // The handle stays in place until terminate returns, so a cancelled
        // termination is finished by shutdown.
        let Some(child) = self.child.as_mut() else { return };
        let pid = child.pid();
        let exited = child.terminate(self.termination_timeout).await;
        self.child = None;
        match exited {
            Some(code) => debug!(pid = ?pid, code, "child stopped"),
            None => warn!(pid = ?pid, "could not confirm child exit"),
        }
    }

    async fn release_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.dispose().await;
        }
    }

    async fn on_announced(&mut self, generation: u64, address: String) {
        if generation != self.generation {
            debug!(generation, %address, "announcement from a previous child ignored");
            return;
        }
        if self.connection.is_some() {
            debug!(%address, "already connected; announcement ignored");
            return;
        }
        match self.connector.connect(&address).await {
            Ok(connection) => {
                info!(%address, "connected to live-patch service");
                self.connection = Some(connection);
            }
            Err(e) => warn!(%address, "failed to connect to live-patch service: {e:#}"),
        }
    }

    fn on_child_exited(&mut self, generation: u64, code: i32) -> Option<ShutdownReason> {
        if generation != self.generation || self.child.is_none() {
            debug!(generation, code, "exit of a previous child ignored");
            return None;
        }
        warn!(generation, code, "child exited unexpectedly");
        Some(ShutdownReason::ChildLost(code))
    }

    /// Stops every source, releases the connection and terminates the child.
    /// Only the first call does any work; later calls return the same code.
    async fn shutdown(&mut self, reason: ShutdownReason) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        self.set_state(SupervisorState::ShuttingDown);
        info!(?reason, "shutting down");

        for source in &mut self.sources {
            debug!(source = source.name(), "stopping");
            source.stop();
        }
        self.release_connection().await;
        self.stop_child().await;
        self.sources.clear();

        let code = reason.exit_code();
        self.exit_code = Some(code);
        self.set_state(SupervisorState::Stopped);
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::task::JoinHandle;

    // ── Fakes ─────────────────────────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, entry: &str) -> usize {
            self.entries().iter().filter(|e| e.as_str() == entry).count()
        }

        fn position(&self, entry: &str) -> Option<usize> {
            self.entries().iter().position(|e| e.as_str() == entry)
        }

        fn lifecycle(&self) -> Vec<String> {
            self.entries()
                .into_iter()
                .filter(|e| e.starts_with("spawn") || e.starts_with("terminate"))
                .collect()
        }
    }

    struct FakeLauncher {
        journal: Journal,
        announce: bool,
        fail_on: Option<u64>,
        terminate_delay: Duration,
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn spawn(
            &mut self,
            generation: u64,
            events: mpsc::Sender<SupervisorEvent>,
        ) -> Result<Box<dyn ChildHandle>, SupervisorError> {
            self.journal.push(format!("spawn {generation}"));
            if self.fail_on == Some(generation) {
                return Err(SupervisorError::Spawn {
                    program: "fake".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
                });
            }
            if self.announce {
                let _ = events.try_send(SupervisorEvent::ServiceAnnounced {
                    generation,
                    address: format!("fake:{generation}"),
                });
            }
            Ok(Box::new(FakeChild {
                generation,
                journal: self.journal.clone(),
                terminate_delay: self.terminate_delay,
            }))
        }
    }

    struct FakeChild {
        generation: u64,
        journal: Journal,
        /// Time between the stop request and the confirmed exit.
        terminate_delay: Duration,
    }

    #[async_trait]
    impl ChildHandle for FakeChild {
        fn pid(&self) -> Option<u32> {
            Some(1000 + self.generation as u32)
        }

        async fn terminate(&mut self, _grace: Duration) -> Option<i32> {
            self.journal.push(format!("terminate {}", self.generation));
            tokio::time::sleep(self.terminate_delay).await;
            self.journal.push(format!("exited {}", self.generation));
            Some(143)
        }
    }

    #[derive(Clone)]
    struct FakeConnector {
        journal: Journal,
        /// Popped per reload; empty means success.
        outcomes: Arc<Mutex<VecDeque<ReloadOutcome>>>,
        reload_delay: Duration,
        connect_delay: Duration,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, address: &str) -> anyhow::Result<Box<dyn LivePatch>> {
            self.journal.push(format!("connect {address}"));
            tokio::time::sleep(self.connect_delay).await;
            Ok(Box::new(FakePatch {
                connector: self.clone(),
            }))
        }
    }

    struct FakePatch {
        connector: FakeConnector,
    }

    #[async_trait]
    impl LivePatch for FakePatch {
        async fn reload(&mut self) -> ReloadOutcome {
            self.connector.journal.push("reload");
            tokio::time::sleep(self.connector.reload_delay).await;
            self.connector
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ReloadOutcome::Success)
        }

        async fn dispose(&mut self) {
            self.connector.journal.push("dispose");
        }
    }

    struct FakeSource {
        stops: Arc<AtomicUsize>,
    }

    impl EventSource for FakeSource {
        fn name(&self) -> &'static str {
            "fake source"
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Setup {
        announce: bool,
        fail_on: Option<u64>,
        outcomes: Vec<ReloadOutcome>,
        reload_delay: Duration,
        connect_delay: Duration,
        terminate_delay: Duration,
        config: ReloadConfig,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                announce: true,
                fail_on: None,
                outcomes: Vec::new(),
                reload_delay: Duration::ZERO,
                connect_delay: Duration::ZERO,
                terminate_delay: Duration::ZERO,
                config: ReloadConfig::default(),
            }
        }
    }

    struct Harness {
        journal: Journal,
        tx: mpsc::Sender<SupervisorEvent>,
        state: watch::Receiver<SupervisorState>,
        stops: Arc<AtomicUsize>,
        task: JoinHandle<i32>,
    }

    impl Harness {
        async fn send(&self, event: SupervisorEvent) {
            self.tx.send(event).await.unwrap();
        }

        fn current(&self) -> SupervisorState {
            *self.state.borrow()
        }
    }

    fn build(setup: Setup) -> (Orchestrator, Journal, Arc<AtomicUsize>) {
        let journal = Journal::default();
        let launcher = FakeLauncher {
            journal: journal.clone(),
            announce: setup.announce,
            fail_on: setup.fail_on,
            terminate_delay: setup.terminate_delay,
        };
        let connector = FakeConnector {
            journal: journal.clone(),
            outcomes: Arc::new(Mutex::new(setup.outcomes.into())),
            reload_delay: setup.reload_delay,
            connect_delay: setup.connect_delay,
        };
        let mut orchestrator =
            Orchestrator::new(&setup.config, Box::new(launcher), Box::new(connector));
        let stops = Arc::new(AtomicUsize::new(0));
        orchestrator.attach(Box::new(FakeSource {
            stops: Arc::clone(&stops),
        }));
        (orchestrator, journal, stops)
    }

    fn start(setup: Setup) -> Harness {
        let (orchestrator, journal, stops) = build(setup);
        let tx = orchestrator.sender();
        let state = orchestrator.state();
        let task = tokio::spawn(orchestrator.run());
        Harness {
            journal,
            tx,
            state,
            stops,
            task,
        }
    }

    /// Lets the orchestrator drain its queue. Time is paused, so this only
    /// advances the clock once every task is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn changed() -> SupervisorEvent {
        SupervisorEvent::FileChanged("src/app.src".into())
    }

    fn quit() -> SupervisorEvent {
        SupervisorEvent::Command(Command::Quit(QuitSource::Keyboard))
    }

    // ── Auto mode ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn successful_live_patch_keeps_the_child() {
        let h = start(Setup::default());
        settle().await;
        assert_eq!(h.current(), SupervisorState::Running);

        h.send(changed()).await;
        settle().await;
        assert_eq!(h.current(), SupervisorState::Running);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(
            h.journal.entries(),
            vec!["spawn 1", "connect fake:1", "reload", "dispose", "terminate 1", "exited 1"]
        );
        assert_eq!(*h.state.borrow(), SupervisorState::Stopped);
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_live_patch_falls_back_to_restart() {
        let h = start(Setup {
            outcomes: vec![ReloadOutcome::Failure("rejected".into())],
            ..Setup::default()
        });
        settle().await;
        h.send(changed()).await;
        settle().await;
        assert_eq!(h.current(), SupervisorState::Running);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(
            h.journal.entries(),
            vec![
                "spawn 1",
                "connect fake:1",
                "reload",
                "dispose",
                "terminate 1",
                "exited 1",
                "spawn 2",
                "connect fake:2",
                "dispose",
                "terminate 2",
                "exited 2",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_connection_restarts_directly() {
        let h = start(Setup {
            announce: false,
            ..Setup::default()
        });
        settle().await;
        h.send(changed()).await;
        settle().await;
        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(
            h.journal.entries(),
            vec!["spawn 1", "terminate 1", "exited 1", "spawn 2", "terminate 2", "exited 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reload_timeout_counts_as_failure() {
        let h = start(Setup {
            reload_delay: Duration::from_secs(60),
            config: ReloadConfig {
                reload_timeout_ms: 1_000,
                ..ReloadConfig::default()
            },
            ..Setup::default()
        });
        settle().await;
        h.send(changed()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.journal.lifecycle(), vec!["spawn 1", "terminate 1", "spawn 2"]);
        assert_eq!(h.current(), SupervisorState::Running);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_restart_in_order() {
        let h = start(Setup {
            outcomes: vec![
                ReloadOutcome::Failure("one".into()),
                ReloadOutcome::Failure("two".into()),
                ReloadOutcome::Failure("three".into()),
            ],
            ..Setup::default()
        });
        settle().await;
        for _ in 0..3 {
            h.send(changed()).await;
            settle().await;
        }
        assert_eq!(
            h.journal.lifecycle(),
            vec!["spawn 1", "terminate 1", "spawn 2", "terminate 2", "spawn 3", "terminate 3", "spawn 4"]
        );
        assert_eq!(h.journal.count("reload"), 3);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
    }

    // ── Coalescing and preemption ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn triggers_during_a_cycle_are_dropped() {
        let h = start(Setup {
            reload_delay: Duration::from_millis(100),
            ..Setup::default()
        });
        settle().await;

        for _ in 0..5 {
            h.send(changed()).await;
        }
        h.send(SupervisorEvent::Command(Command::Reload)).await;
        h.send(SupervisorEvent::Command(Command::Restart)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.journal.count("reload"), 1);
        assert_eq!(h.journal.lifecycle(), vec!["spawn 1"]);

        // The next change after the cycle starts a fresh one.
        h.send(changed()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.journal.count("reload"), 2);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_preempts_an_in_flight_reload() {
        let h = start(Setup {
            reload_delay: Duration::from_secs(60),
            ..Setup::default()
        });
        settle().await;
        h.send(changed()).await;
        settle().await;
        assert_eq!(h.current(), SupervisorState::Reloading);

        h.send(SupervisorEvent::Command(Command::Quit(QuitSource::Interrupt))).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(
            h.journal.entries(),
            vec!["spawn 1", "connect fake:1", "reload", "dispose", "terminate 1", "exited 1"]
        );
        assert_eq!(*h.state.borrow(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_interrupts_a_slow_connect() {
        let h = start(Setup {
            connect_delay: Duration::from_secs(7),
            ..Setup::default()
        });
        settle().await;
        let asked = tokio::time::Instant::now();

        h.send(SupervisorEvent::Command(Command::Quit(QuitSource::Interrupt))).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert!(asked.elapsed() < Duration::from_secs(1));
        assert_eq!(
            h.journal.entries(),
            vec!["spawn 1", "connect fake:1", "terminate 1", "exited 1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_connect_waits_for_it() {
        let h = start(Setup {
            connect_delay: Duration::from_secs(1),
            ..Setup::default()
        });
        settle().await;
        h.send(changed()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.journal.count("reload"), 1);
        assert_eq!(h.journal.lifecycle(), vec!["spawn 1"]);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
    }

    // ── Restart command ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn restart_command_skips_live_patch() {
        let h = start(Setup::default());
        settle().await;
        h.send(SupervisorEvent::Command(Command::Restart)).await;
        settle().await;
        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(h.journal.count("reload"), 0);
        assert_eq!(
            h.journal.entries(),
            vec![
                "spawn 1",
                "connect fake:1",
                "dispose",
                "terminate 1",
                "exited 1",
                "spawn 2",
                "connect fake:2",
                "dispose",
                "terminate 2",
                "exited 2",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn old_child_exits_before_replacement_spawns() {
        let h = start(Setup {
            terminate_delay: Duration::from_millis(500),
            ..Setup::default()
        });
        settle().await;
        h.send(SupervisorEvent::Command(Command::Restart)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.current(), SupervisorState::Running);

        let exited = h.journal.position("exited 1").unwrap();
        let spawned = h.journal.position("spawn 2").unwrap();
        assert!(exited < spawned);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_during_restart_finishes_terminating_old_child() {
        let h = start(Setup {
            terminate_delay: Duration::from_secs(1),
            ..Setup::default()
        });
        settle().await;
        h.send(SupervisorEvent::Command(Command::Restart)).await;
        settle().await;
        assert_eq!(h.current(), SupervisorState::Restarting);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(
            h.journal.entries(),
            vec![
                "spawn 1",
                "connect fake:1",
                "dispose",
                "terminate 1",
                "terminate 1",
                "exited 1",
            ]
        );
        assert_eq!(*h.state.borrow(), SupervisorState::Stopped);
    }

    // ── Child lifecycle ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn unexpected_exit_shuts_down_with_child_code() {
        let h = start(Setup::default());
        settle().await;
        h.send(SupervisorEvent::ChildExited {
            generation: 1,
            code: 3,
        })
        .await;
        assert_eq!(h.task.await.unwrap(), 3);
        assert_eq!(*h.state.borrow(), SupervisorState::Stopped);
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_of_a_replaced_child_is_ignored() {
        let h = start(Setup::default());
        settle().await;
        h.send(SupervisorEvent::Command(Command::Restart)).await;
        settle().await;

        h.send(SupervisorEvent::ChildExited {
            generation: 1,
            code: 143,
        })
        .await;
        settle().await;
        assert!(!h.task.is_finished());
        assert_eq!(h.current(), SupervisorState::Running);

        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_announcement_is_ignored() {
        let h = start(Setup::default());
        settle().await;
        h.send(SupervisorEvent::ServiceAnnounced {
            generation: 1,
            address: "fake:other".into(),
        })
        .await;
        h.send(SupervisorEvent::ServiceAnnounced {
            generation: 7,
            address: "fake:stale".into(),
        })
        .await;
        settle().await;
        h.send(quit()).await;
        assert_eq!(h.task.await.unwrap(), 0);
        assert_eq!(h.journal.count("connect fake:1"), 1);
        assert_eq!(h.journal.count("connect fake:other"), 0);
        assert_eq!(h.journal.count("connect fake:stale"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_spawn_is_fatal() {
        let h = start(Setup {
            fail_on: Some(1),
            ..Setup::default()
        });
        assert_eq!(h.task.await.unwrap(), 1);
        assert_eq!(h.journal.entries(), vec!["spawn 1"]);
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_respawn_is_fatal() {
        let h = start(Setup {
            fail_on: Some(2),
            ..Setup::default()
        });
        settle().await;
        h.send(SupervisorEvent::Command(Command::Restart)).await;
        assert_eq!(h.task.await.unwrap(), 1);
        assert_eq!(h.journal.lifecycle(), vec!["spawn 1", "terminate 1", "spawn 2"]);
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn closed_queue_is_a_graceful_quit() {
        let h = start(Setup::default());
        settle().await;
        let Harness {
            journal, tx, task, ..
        } = h;
        drop(tx);
        assert_eq!(task.await.unwrap(), 0);
        assert_eq!(journal.lifecycle(), vec!["spawn 1", "terminate 1"]);
    }

    #[tokio::test]
    async fn shutdown_runs_once() {
        let (mut orchestrator, journal, stops) = build(Setup::default());
        orchestrator.core.child = Some(Box::new(FakeChild {
            generation: 1,
            journal: journal.clone(),
            terminate_delay: Duration::ZERO,
        }));

        let first = orchestrator.core.shutdown(ShutdownReason::Quit(QuitSource::Keyboard)).await;
        let second = orchestrator.core.shutdown(ShutdownReason::ChildLost(9)).await;
        assert_eq!((first, second), (0, 0));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(journal.entries(), vec!["terminate 1", "exited 1"]);
        assert_eq!(*orchestrator.state().borrow(), SupervisorState::Stopped);
    }

    #[test]
    fn exit_codes_per_reason() {
        assert_eq!(ShutdownReason::Quit(QuitSource::Terminate).exit_code(), 0);
        assert_eq!(ShutdownReason::ChildLost(42).exit_code(), 42);
        assert_eq!(ShutdownReason::Fatal.exit_code(), 1);
    }
}
