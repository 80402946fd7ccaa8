//! The engine runtime.
//!
//! One task owns the [`Engine`] and the [`Bridge`]. Everything else talks to
//! it through an unbounded command channel, so signal producers never block
//! and the engine only ever sees serialized input.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use dwell_core::{Clock, Engine, Envelope, Inbound, Message, RawSignal, StateStore, WireEnvelope};
use dwell_sync::{Bridge, Channel};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;

/// Input to the runtime task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Signal(RawSignal),
    Host(Envelope),
    Shutdown,
}

/// One line of `dwell run` input: a host envelope or a raw browser signal.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Host(WireEnvelope),
    Signal(RawSignal),
}

/// Parses one JSON input line.
pub fn parse_line(line: &str) -> Result<Command> {
    let input: InputLine = serde_json::from_str(line).context("not a signal or host envelope")?;
    match input {
        InputLine::Host(wire) => {
            let envelope = Envelope::try_from(wire).context("invalid host envelope")?;
            Ok(Command::Host(envelope))
        }
        InputLine::Signal(signal) => Ok(Command::Signal(signal)),
    }
}

/// Forwards JSON lines from `input` until EOF, then asks for shutdown.
///
/// Lines that fail to parse are logged and skipped.
pub async fn forward_lines<R>(input: R, commands: mpsc::UnboundedSender<Command>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(command) => {
                if commands.send(command).is_err() {
                    tracing::debug!("runtime stopped, no longer reading input");
                    return Ok(());
                }
            }
            Err(err) => tracing::warn!(error = ?err, "skipping input line"),
        }
    }
    let _ = commands.send(Command::Shutdown);
    Ok(())
}

pub struct Runtime<S: StateStore, C> {
    engine: Engine<S>,
    bridge: Bridge<C>,
    clock: Arc<dyn Clock>,
    next_heartbeat: DateTime<Utc>,
    next_self_check: DateTime<Utc>,
}

impl<S: StateStore, C> std::fmt::Debug for Runtime<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("bridge", &self.bridge)
            .field("next_heartbeat", &self.next_heartbeat)
            .finish_non_exhaustive()
    }
}

impl<S: StateStore, C: Channel> Runtime<S, C> {
    pub fn new(engine: Engine<S>, bridge: Bridge<C>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            next_heartbeat: now + engine.config().heartbeat_interval(),
            next_self_check: now + engine.config().self_check_interval(),
            engine,
            bridge,
            clock,
        }
    }

    pub const fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    pub const fn bridge(&self) -> &Bridge<C> {
        &self.bridge
    }

    /// Applies one command. Returns `false` once the runtime should stop.
    pub async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Signal(signal) => self.engine.submit(&signal),
            Command::Host(envelope) => self.handle_host(&envelope).await,
            Command::Shutdown => return false,
        }
        self.forward().await;
        true
    }

    async fn handle_host(&mut self, envelope: &Envelope) {
        match self.engine.handle_inbound(envelope) {
            Inbound::StatusQuery => {
                let report = self.engine.status_report(
                    self.bridge.circuit_state(),
                    self.bridge.queue_depth(),
                    self.bridge.is_degraded(),
                );
                let outcome = self.bridge.send(Envelope::new(Message::StatusReport(report))).await;
                tracing::debug!(?outcome, "answered status query");
            }
            Inbound::Settings { changed } => tracing::debug!(changed, "host settings message"),
            Inbound::Acknowledged(id) => tracing::debug!(session_id = %id, "host acknowledged session"),
            Inbound::Ignored(kind) => tracing::debug!(%kind, "host message ignored"),
        }
    }

    /// Runs whatever timers are due: debounced transitions, heartbeat,
    /// self-check, outbox and retries.
    pub async fn tick(&mut self) {
        let now = self.clock.now();
        self.engine.poll();
        if now >= self.next_heartbeat {
            self.engine.heartbeat();
            self.next_heartbeat = now + self.engine.config().heartbeat_interval();
        }
        if now >= self.next_self_check {
            let resolved = self.engine.self_check();
            if resolved > 0 {
                tracing::warn!(resolved, "self-check completed stray open sessions");
            }
            self.next_self_check = now + self.engine.config().self_check_interval();
        }
        self.forward().await;
    }

    /// The earliest moment something is due.
    pub fn next_wake(&self) -> DateTime<Utc> {
        [self.engine.next_deadline(), self.bridge.next_wake()]
            .into_iter()
            .flatten()
            .fold(self.next_heartbeat.min(self.next_self_check), Ord::min)
    }

    /// Hands queued engine messages to the bridge and sends what is due.
    async fn forward(&mut self) {
        for envelope in self.engine.take_outbound() {
            self.bridge.post(envelope);
        }
        let delivered = self.bridge.pump().await;
        self.acknowledge(&delivered);
    }

    fn acknowledge(&mut self, delivered: &[Envelope]) {
        for envelope in delivered {
            if let Message::SessionFinalized(session) = &envelope.message {
                self.engine.mark_synced(&session.id);
            }
        }
    }

    /// Drives the engine until a shutdown command or the channel closes.
    ///
    /// Returns the engine after persisting the current session and flushing
    /// the outbox.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Engine<S> {
        tracing::info!("engine runtime started");
        loop {
            let wait = (self.next_wake() - self.clock.now())
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command).await {
                        break;
                    }
                }
                () = tokio::time::sleep(wait) => self.tick().await,
            }
        }
        self.finish().await;
        self.engine
    }

    async fn finish(&mut self) {
        self.engine.shutdown();
        for envelope in self.engine.take_outbound() {
            self.bridge.post(envelope);
        }
        let delivered = self.bridge.flush().await;
        self.acknowledge(&delivered);
        let pending = self.bridge.queue_depth();
        if pending > 0 {
            tracing::warn!(pending, "stopping with undelivered host messages");
        }
        tracing::info!("engine runtime stopped");
    }
}

/// A running engine task.
#[derive(Debug)]
pub struct EngineHandle<S: StateStore> {
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<Engine<S>>>>,
}

impl<S: StateStore> EngineHandle<S> {
    /// Queues a command without waiting.
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("engine runtime is not running"))
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    /// Waits for the task to stop on its own and returns its engine.
    ///
    /// Only the first caller gets the engine; later calls return `None`.
    pub async fn join(&self) -> Result<Option<Engine<S>>> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(None);
        };
        let engine = task.await.context("engine runtime panicked")?;
        Ok(Some(engine))
    }

    /// Asks the task to stop, then waits for it.
    pub async fn shutdown(&self) -> Result<Option<Engine<S>>> {
        let _ = self.commands.send(Command::Shutdown);
        self.join().await
    }
}

/// Builds the runtime at most once.
///
/// Concurrent callers wait on the same initialization and share its handle.
#[derive(Debug)]
pub struct InitLock<S: StateStore> {
    cell: OnceCell<EngineHandle<S>>,
}

impl<S: StateStore> Default for InitLock<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StateStore> InitLock<S> {
    pub const fn new() -> Self {
        Self { cell: OnceCell::const_new() }
    }

    pub fn get(&self) -> Option<&EngineHandle<S>> {
        self.cell.get()
    }

    /// Returns the running engine, building and spawning it on first use.
    pub async fn get_or_init<C, F, Fut>(&self, build: F) -> Result<&EngineHandle<S>>
    where
        S: Send + 'static,
        C: Channel + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Runtime<S, C>>>,
    {
        self.cell
            .get_or_try_init(|| async {
                let runtime = build().await?;
                let (commands, receiver) = mpsc::unbounded_channel();
                let task = tokio::spawn(runtime.run(receiver));
                Ok(EngineHandle {
                    commands,
                    task: Mutex::new(Some(task)),
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;
    use dwell_core::{
        ActivityKey, EngineConfig, ManualClock, MemoryStore, MessageType, SessionStatus, SignalKind,
        TimezoneContext,
    };
    use dwell_sync::ChannelError;
    use tokio::io::BufReader;

    use super::*;

    /// Channel that accepts everything and keeps a copy.
    #[derive(Default)]
    struct Recorder {
        sent: std::sync::Mutex<Vec<Envelope>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }

        fn kinds(&self) -> Vec<MessageType> {
            self.sent().iter().map(Envelope::kind).collect()
        }
    }

    impl Channel for Recorder {
        async fn deliver(&self, envelope: &Envelope) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    type TestRuntime = Runtime<MemoryStore, Recorder>;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn runtime() -> (TestRuntime, ManualClock) {
        let clock = ManualClock::with_timezone(t0(), TimezoneContext::utc());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let config = EngineConfig::default();
        let engine = Engine::new(config.clone(), MemoryStore::new(), Arc::clone(&shared));
        let bridge = Bridge::new(Recorder::default(), &config, Arc::clone(&shared));
        (Runtime::new(engine, bridge, shared), clock)
    }

    fn activate(key: &str, at: DateTime<Utc>) -> Command {
        Command::Signal(RawSignal::new(SignalKind::Activate, Some(key), at))
    }

    #[test]
    fn parses_signals_and_envelopes() {
        let signal = parse_line(r#"{"kind":"activate","activityKey":"a.com","observedAt":"2025-06-01T10:00:00Z"}"#)
            .unwrap();
        assert_eq!(signal, activate("a.com", t0()));

        let host = parse_line(r#"{"type":"DISABLE","messageId":"m-1","payload":null}"#).unwrap();
        match host {
            Command::Host(envelope) => assert_eq!(envelope.message, Message::Disable),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_message_types() {
        let err = parse_line(r#"{"type":"REBOOT","messageId":"m-1"}"#).unwrap_err();
        assert!(format!("{err:#}").contains("REBOOT"), "{err:#}");
        assert!(parse_line("not json").is_err());
    }

    #[tokio::test]
    async fn debounced_activation_opens_one_session() {
        let (mut rt, clock) = runtime();
        for _ in 0..10 {
            assert!(rt.handle(activate("a.com", t0())).await);
        }
        assert!(rt.engine().current().is_none());
        assert_eq!(rt.next_wake(), t0() + Duration::milliseconds(200));

        clock.advance(Duration::milliseconds(200));
        rt.tick().await;
        let current = rt.engine().current().unwrap();
        assert_eq!(current.activity_key, ActivityKey::new("a.com").unwrap());
        assert_eq!(rt.engine().store().len(), 1);
    }

    #[tokio::test]
    async fn heartbeats_accrue_and_snapshots_reach_the_host() {
        let (mut rt, clock) = runtime();
        rt.handle(activate("a.com", t0())).await;
        clock.advance(Duration::milliseconds(200));
        rt.tick().await;

        for _ in 0..5 {
            clock.advance(Duration::seconds(1));
            rt.tick().await;
        }
        assert_eq!(rt.engine().current().unwrap().accumulated_ms, 5200);

        // One snapshot for the first heartbeat; the next is a minute away.
        assert_eq!(rt.bridge().channel().kinds(), vec![MessageType::SessionHeartbeatSnapshot]);
    }

    #[tokio::test]
    async fn delivered_finalization_marks_session_synced() {
        let (mut rt, clock) = runtime();
        rt.handle(activate("a.com", t0())).await;
        clock.advance(Duration::milliseconds(200));
        rt.tick().await;
        let first = rt.engine().current().unwrap().id.clone();

        rt.handle(activate("b.com", clock.now())).await;
        clock.advance(Duration::milliseconds(200));
        rt.tick().await;
        clock.advance(Duration::milliseconds(200));
        rt.tick().await;

        let stored = rt.engine().store().get(&first).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert!(stored.synced_at.is_some());
    }

    #[tokio::test]
    async fn status_query_is_answered_immediately() {
        let (mut rt, _clock) = runtime();
        let query = parse_line(r#"{"type":"STATUS_QUERY","messageId":"q-1"}"#).unwrap();
        rt.handle(query).await;

        let sent = rt.bridge().channel().sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].message {
            Message::StatusReport(report) => {
                assert_eq!(report.queue_depth, 0);
                assert!(report.current_session.is_none());
                assert!(!report.degraded);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_persists_open_session_on_shutdown() {
        let (rt, _clock) = runtime();
        let (commands, receiver) = mpsc::unbounded_channel();
        let input = concat!(
            r#"{"kind":"activate","activityKey":"a.com","observedAt":"2025-06-01T10:00:00Z"}"#,
            "\n\n",
            "garbage\n",
        );
        forward_lines(BufReader::new(input.as_bytes()), commands).await.unwrap();

        let engine = rt.run(receiver).await;
        let open = engine.store().list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn overlapping_init_builds_one_runtime() {
        let lock: Arc<InitLock<MemoryStore>> = Arc::new(InitLock::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let init = |lock: Arc<InitLock<MemoryStore>>, builds: Arc<AtomicUsize>| async move {
            lock.get_or_init(move || async move {
                builds.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                anyhow::Ok(runtime().0)
            })
            .await
            .map(|_| ())
        };
        let (a, b) = tokio::join!(
            init(Arc::clone(&lock), Arc::clone(&builds)),
            init(Arc::clone(&lock), Arc::clone(&builds)),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let handle = lock.get().unwrap();
        handle.send(activate("a.com", t0())).unwrap();
        let engine = handle.shutdown().await.unwrap().unwrap();
        assert_eq!(engine.store().len(), 1);
        assert!(handle.shutdown().await.unwrap().is_none());
        assert!(handle.send(Command::Shutdown).is_err());
    }
}
