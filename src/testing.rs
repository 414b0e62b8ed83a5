//! Shared test doubles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::RunnerConfig;
use crate::display::{ConnectionInfo, RemoteDisplay};
use crate::environment::{EnvState, Environment};
use crate::factory::CollaboratorFactory;
use crate::instrument::Recorder;
use crate::model::{
    Action, Directive, InterventionRequest, Note, NotificationEvent, NotificationLevel,
};
use crate::notes::{InMemoryNoteStore, NoteStore};
use crate::notify::Notifier;
use crate::planner::{Planner, PlannerContext, ScriptedPlanner};
use crate::portal::InterventionPortal;

/// Keeps every event it receives; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl CollectingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn last_message(&self) -> Option<String> {
        self.events().last().map(|e| e.message.clone())
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, event: &NotificationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Note store whose clones share contents, so tests can inspect it after the
/// orchestrator has taken ownership.
#[derive(Debug, Clone)]
pub struct SharedNotes {
    inner: Arc<Mutex<InMemoryNoteStore>>,
}

impl SharedNotes {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(InMemoryNoteStore::new(max_entries))),
        }
    }

    pub fn contents(&self) -> Vec<String> {
        self.entries()
            .unwrap()
            .into_iter()
            .map(|n| n.content)
            .collect()
    }
}

impl NoteStore for SharedNotes {
    fn add(&mut self, note: Note) -> Result<()> {
        self.inner.lock().unwrap().add(note)
    }

    fn entries(&self) -> Result<Vec<Note>> {
        self.inner.lock().unwrap().entries()
    }

    fn prune(&mut self, max_entries: usize) -> Result<()> {
        self.inner.lock().unwrap().prune(max_entries)
    }
}

#[derive(Debug, Default)]
struct GateState {
    entered: bool,
    released: bool,
}

/// Holds one action inside `execute` until the test releases it.
#[derive(Debug, Default)]
pub struct ActionGate {
    state: Mutex<GateState>,
    signal: Condvar,
}

impl ActionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until an action has reached the gate.
    pub fn wait_entered(&self) {
        let state = self.state.lock().unwrap();
        let _state = self.signal.wait_while(state, |s| !s.entered).unwrap();
    }

    pub fn release(&self) {
        self.state.lock().unwrap().released = true;
        self.signal.notify_all();
    }

    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.entered = true;
        self.signal.notify_all();
        let _state = self.signal.wait_while(state, |s| !s.released).unwrap();
    }
}

#[derive(Debug, Default)]
struct StubEnvLog {
    lifecycle: Vec<String>,
    executed: Vec<String>,
    state: EnvState,
}

/// Environment that accepts any action; clones share one log.
#[derive(Debug, Default, Clone)]
pub struct StubEnvironment {
    log: Arc<Mutex<StubEnvLog>>,
    fail_on: Option<String>,
    screenshot: Option<Vec<u8>>,
    screenshot_fails: bool,
    gate: Option<(String, Arc<ActionGate>)>,
}

impl StubEnvironment {
    pub fn gated_on(mut self, kind: &str, gate: Arc<ActionGate>) -> Self {
        self.gate = Some((kind.to_string(), gate));
        self
    }

    pub fn failing_on(mut self, kind: &str) -> Self {
        self.fail_on = Some(kind.to_string());
        self
    }

    pub fn failing_screenshots(mut self) -> Self {
        self.screenshot_fails = true;
        self
    }

    pub fn with_screenshot(mut self, bytes: Vec<u8>) -> Self {
        self.screenshot = Some(bytes);
        self
    }

    pub fn lifecycle(&self) -> Vec<String> {
        self.log.lock().unwrap().lifecycle.clone()
    }

    pub fn executed_kinds(&self) -> Vec<String> {
        self.log.lock().unwrap().executed.clone()
    }
}

impl Environment for StubEnvironment {
    fn start(&mut self) -> Result<()> {
        self.log.lock().unwrap().lifecycle.push("start".to_string());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.log.lock().unwrap().lifecycle.push("stop".to_string());
        Ok(())
    }

    fn execute(&mut self, action: &Action) -> Result<EnvState> {
        if self.fail_on.as_deref() == Some(action.kind.as_str()) {
            bail!("action '{}' rejected", action.kind);
        }
        if let Some((kind, gate)) = &self.gate
            && *kind == action.kind
        {
            gate.pass();
        }
        let mut log = self.log.lock().unwrap();
        log.executed.push(action.kind.clone());
        if let Some(url) = action.param_str("url") {
            log.state.location = Some(url.to_string());
        }
        log.state.last_action = Some(action.kind.clone());
        Ok(log.state.clone())
    }

    fn snapshot(&self) -> Result<EnvState> {
        Ok(self.log.lock().unwrap().state.clone())
    }

    fn screenshot(&self) -> Result<Option<Vec<u8>>> {
        if self.screenshot_fails {
            bail!("screenshot unavailable");
        }
        Ok(self.screenshot.clone())
    }
}

/// Portal that either releases every wait at once or never does.
#[derive(Debug, Default)]
pub struct ScriptedPortal {
    finishes: bool,
    requests: Mutex<Vec<InterventionRequest>>,
    connection: Mutex<Option<ConnectionInfo>>,
    stops: AtomicUsize,
}

impl ScriptedPortal {
    pub fn finishing() -> Self {
        Self {
            finishes: true,
            ..Self::default()
        }
    }

    pub fn never_finishing() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<InterventionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.connection.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl InterventionPortal for ScriptedPortal {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn update_connection_info(&self, info: Option<ConnectionInfo>) {
        *self.connection.lock().unwrap() = info;
    }

    fn request_intervention(&self, request: InterventionRequest) -> NotificationEvent {
        let event = NotificationEvent::new(
            crate::model::event_kind::USER_ACTION_REQUIRED,
            request.reason.clone(),
            NotificationLevel::Warning,
        );
        self.requests.lock().unwrap().push(request);
        event
    }

    fn wait_until_finished(&self, timeout: Option<Duration>) -> bool {
        if !self.finishes
            && let Some(timeout) = timeout
        {
            std::thread::sleep(timeout);
        }
        self.finishes
    }
}

/// Display that always reports a connection on `:99`.
#[derive(Debug, Default, Clone)]
pub struct StubDisplay {
    stopped: Arc<AtomicBool>,
}

impl StubDisplay {
    pub fn connected() -> Self {
        Self::default()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl RemoteDisplay for StubDisplay {
    fn start(&mut self) -> Result<Option<ConnectionInfo>> {
        Ok(Some(ConnectionInfo {
            host: "127.0.0.1".to_string(),
            port: 5900,
            display: ":99".to_string(),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct PanickingPlanner;

impl Planner for PanickingPlanner {
    fn complete(&mut self, _prompt: &str, _context: &PlannerContext<'_>) -> Result<Directive> {
        panic!("planner exploded");
    }
}

/// Recorder that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    actions: Mutex<Vec<(Action, EnvState, Option<Vec<u8>>)>>,
    notes: Mutex<Vec<String>>,
    notifications: Mutex<Vec<String>>,
}

impl MemoryRecorder {
    pub fn actions(&self) -> Vec<(Action, EnvState, Option<Vec<u8>>)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().unwrap().clone()
    }

    pub fn notification_kinds(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

impl Recorder for MemoryRecorder {
    fn on_action(&self, action: &Action, state: &EnvState, screenshot: Option<&[u8]>) {
        self.actions
            .lock()
            .unwrap()
            .push((action.clone(), state.clone(), screenshot.map(<[u8]>::to_vec)));
    }

    fn on_memory(&self, note: &Note) {
        self.notes.lock().unwrap().push(note.content.clone());
    }

    fn on_notification(&self, event: &NotificationEvent) {
        self.notifications.lock().unwrap().push(event.kind.clone());
    }
}

type PlannerBuilder = Box<dyn Fn() -> Box<dyn Planner> + Send + Sync>;

/// Factory handing out stubs, with a caller-chosen planner.
pub struct StubFactory {
    planner: PlannerBuilder,
    screenshot: Option<Vec<u8>>,
    gate: Option<(String, Arc<ActionGate>)>,
    display: bool,
    panic_on_build: bool,
}

impl StubFactory {
    pub fn with_planner<F>(build: F) -> Self
    where
        F: Fn() -> Box<dyn Planner> + Send + Sync + 'static,
    {
        Self {
            planner: Box::new(build),
            screenshot: None,
            gate: None,
            display: false,
            panic_on_build: false,
        }
    }

    pub fn scripted(directives: Vec<Directive>) -> Self {
        Self::with_planner(move || Box::new(ScriptedPlanner::new(directives.clone())))
    }

    pub fn panicking_build() -> Self {
        Self {
            panic_on_build: true,
            ..Self::scripted(Vec::new())
        }
    }

    pub fn with_screenshot(mut self, bytes: Vec<u8>) -> Self {
        self.screenshot = Some(bytes);
        self
    }

    pub fn with_gate(mut self, kind: &str, gate: Arc<ActionGate>) -> Self {
        self.gate = Some((kind.to_string(), gate));
        self
    }

    pub fn with_display(mut self) -> Self {
        self.display = true;
        self
    }
}

impl CollaboratorFactory for StubFactory {
    fn planner(&self, _config: &RunnerConfig) -> Result<Box<dyn Planner>> {
        if self.panic_on_build {
            panic!("factory exploded");
        }
        Ok((self.planner)())
    }

    fn environment(&self, _config: &RunnerConfig) -> Result<Box<dyn Environment>> {
        let mut env = StubEnvironment::default();
        if let Some(bytes) = &self.screenshot {
            env = env.with_screenshot(bytes.clone());
        }
        if let Some((kind, gate)) = &self.gate {
            env = env.gated_on(kind, Arc::clone(gate));
        }
        Ok(Box::new(env))
    }

    fn notifier(&self, _config: &RunnerConfig, _task_id: &str) -> Result<Box<dyn Notifier>> {
        Ok(Box::new(CollectingNotifier::default()))
    }

    fn display(&self, _config: &RunnerConfig) -> Result<Option<Box<dyn RemoteDisplay>>> {
        if self.display {
            return Ok(Some(Box::new(StubDisplay::connected())));
        }
        Ok(None)
    }
}
