use super::arbiter::{arbitrate, Candidate, Verdict};
use super::context::{LoopIo, Services, SessionState, SubDialogue};
use super::delegate::Delegate;
use super::error::{AgentError, Result};
use super::handler::{DialogueHandler, HandlerSet};
use super::queue::{Handshake, HandshakeObserver, IntentQueue};
use super::types::{AskSpecialKind, PlatformData, QueueItem, ReplyResult, UserInput};
use crate::format::Formatter;
use crate::handlers::skill::SkillHandler;
use crate::program::executor::Executor;
use crate::program::handler::{Notifier, ProgramHandler};
use crate::services::catalog::{DeviceEvent, SkillCatalog, DIALOGUE_HANDLER_KIND};
use crate::services::nlu::NluClient;
use crate::services::prefs::{keys, PreferenceStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Session-level configuration. Environment overrides follow the
/// `CONVERSE_*` convention.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub locale: String,
    /// Messaging identity of this principal, used when composing remote
    /// programs.
    pub own_identity: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { locale: "en-US".to_string(), own_identity: "self".to_string() }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(locale) = std::env::var("CONVERSE_LOCALE") {
            config.locale = locale;
        }
        if let Ok(identity) = std::env::var("CONVERSE_IDENTITY") {
            config.own_identity = identity;
        }
        config
    }
}

/// Wires the loop together and spawns it.
pub struct ConversationBuilder {
    delegate: Arc<dyn Delegate>,
    nlu: Arc<dyn NluClient>,
    catalog: Arc<dyn SkillCatalog>,
    executor: Arc<dyn Executor>,
    prefs: Arc<dyn PreferenceStore>,
    config: AgentConfig,
    extra_handlers: Vec<Box<dyn DialogueHandler>>,
}

impl ConversationBuilder {
    pub fn new(
        delegate: Arc<dyn Delegate>,
        nlu: Arc<dyn NluClient>,
        catalog: Arc<dyn SkillCatalog>,
        executor: Arc<dyn Executor>,
        prefs: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            delegate,
            nlu,
            catalog,
            executor,
            prefs,
            config: AgentConfig::default(),
            extra_handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an additional static handler (FAQ handlers go through
    /// here). The formal-program handler is always registered first.
    pub fn add_handler(mut self, handler: Box<dyn DialogueHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    /// Create the session and run the loop until `stop()`. Resolves once
    /// the loop has emitted its welcome and parked for the first command.
    pub async fn start(
        self,
        show_welcome: bool,
        initial_state: Option<serde_json::Value>,
    ) -> Conversation {
        let (handshake, observer) = Handshake::new();
        let io = Arc::new(LoopIo {
            user_queue: Arc::new(IntentQueue::new()),
            notify_queue: Arc::new(IntentQueue::new()),
            delegate: self.delegate,
            handshake,
        });

        let temperature_unit = self
            .prefs
            .get(keys::PREFERRED_TEMPERATURE)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "C".to_string());
        let formatter = Formatter::new(self.config.locale.clone(), temperature_unit);

        let services = Services {
            nlu: self.nlu.clone(),
            catalog: self.catalog.clone(),
            executor: self.executor.clone(),
            prefs: self.prefs.clone(),
            formatter: formatter.clone(),
        };

        let mut handlers = HandlerSet::new();
        handlers.add(Box::new(ProgramHandler::new(
            self.nlu,
            self.catalog.clone(),
            self.executor,
            self.prefs,
            self.config.own_identity.clone(),
        )));
        for handler in self.extra_handlers {
            handlers.add(handler);
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(serde_json::json!({}));
        let device_events = self.catalog.subscribe();

        let dialogue_loop = DialogueLoop {
            io: io.clone(),
            services,
            handlers,
            session: SessionState::default(),
            notifier: Notifier::new(self.catalog, formatter),
            device_events,
            stopped: stopped.clone(),
            state_tx,
        };

        let task = tokio::spawn(dialogue_loop.run(show_welcome, initial_state));
        let conversation = Conversation {
            io,
            observer,
            stopped,
            task: Mutex::new(Some(task)),
            state_rx,
        };
        // Welcome has been emitted once the loop first parks.
        let _ = conversation.observer.wait_ready().await;
        conversation
    }
}

/// The shell-facing handle. All methods respect the handshake: nothing
/// touches the queues while the loop is mid-turn.
pub struct Conversation {
    io: Arc<LoopIo>,
    observer: HandshakeObserver,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<serde_json::Value>,
}

impl Conversation {
    /// Deliver one user turn and resolve when the loop is ready for the
    /// next one.
    pub async fn handle_command(&self, input: UserInput) -> Result<()> {
        self.push_routed(input).await?;
        self.observer.wait_next_turn().await
    }

    /// Fire-and-forget variant of `handle_command`.
    pub fn push_command(&self, input: UserInput) {
        let io = self.io.clone();
        let observer = self.observer.clone();
        tokio::spawn(async move {
            let _ = route_push(&io, &observer, input).await;
        });
    }

    /// Queue an out-of-band result from a running program. Drained only
    /// when the loop is back in its default state.
    pub fn dispatch_notify(
        &self,
        app_id: impl Into<String>,
        app_name: impl Into<String>,
        output_type: Option<String>,
        output_value: serde_json::Value,
    ) {
        self.io.notify_queue.push(QueueItem::Notification {
            app_id: app_id.into(),
            app_name: app_name.into(),
            output_type,
            output_value,
        });
    }

    pub fn dispatch_notify_error(
        &self,
        app_id: impl Into<String>,
        app_name: impl Into<String>,
        error: impl Into<String>,
    ) {
        self.io.notify_queue.push(QueueItem::Error {
            app_id: app_id.into(),
            app_name: app_name.into(),
            error: error.into(),
        });
    }

    /// Ask the user to approve a program another principal wants to run
    /// here. Resolves to the granted program, or `None` on refusal or
    /// cancellation.
    pub async fn ask_for_permission(
        &self,
        principal: impl Into<String>,
        identity: impl Into<String>,
        program: crate::program::ast::Program,
    ) -> Option<crate::program::ast::Program> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.io.notify_queue.push(QueueItem::PermissionRequest {
            principal: principal.into(),
            identity: identity.into(),
            program,
            response: tx,
        });
        rx.await.unwrap_or(None)
    }

    /// Cancel whatever is in progress and reset session state, without
    /// tearing anything down. Used by inactivity timers.
    pub async fn reset(&self) -> Result<()> {
        self.observer.wait_ready().await?;
        self.cancel_parked_waiter();
        self.observer.wait_next_turn().await
    }

    /// Graceful stop: cancels the parked waiter and joins the loop task.
    /// Unserved queue items are discarded.
    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        // A loop that already exited reports closed here; that's fine, we
        // only need the join below.
        if self.observer.wait_ready().await.is_ok() {
            self.cancel_parked_waiter();
        }
        let task = self.task.lock().expect("conversation poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Snapshot of session and handler state, suitable for a later
    /// `start(show_welcome, Some(state))`.
    pub fn get_state(&self) -> serde_json::Value {
        self.state_rx.borrow().clone()
    }

    async fn push_routed(&self, input: UserInput) -> Result<()> {
        route_push(&self.io, &self.observer, input).await
    }

    fn cancel_parked_waiter(&self) {
        if self.io.user_queue.has_waiter() {
            self.io.user_queue.cancel_wait(AgentError::Cancelled);
        } else {
            self.io.notify_queue.cancel_wait(AgentError::Cancelled);
        }
    }
}

/// Route a command to whichever queue the loop is parked on: the user-input
/// queue while a sub-dialogue is expecting, the notify queue in the default
/// state. Retries if the loop woke up in between.
async fn route_push(io: &LoopIo, observer: &HandshakeObserver, input: UserInput) -> Result<()> {
    loop {
        observer.wait_ready().await?;
        if io.user_queue.has_waiter() {
            io.user_queue.push(input);
            return Ok(());
        }
        if io.notify_queue.has_waiter() {
            io.notify_queue.push(QueueItem::UserInput { command: input });
            return Ok(());
        }
        // Ready flag observed before the waiter was installed; give the
        // loop task a chance to finish parking.
        tokio::task::yield_now().await;
    }
}

struct DialogueLoop {
    io: Arc<LoopIo>,
    services: Services,
    handlers: HandlerSet,
    session: SessionState,
    notifier: Notifier,
    device_events: mpsc::UnboundedReceiver<DeviceEvent>,
    stopped: Arc<AtomicBool>,
    state_tx: watch::Sender<serde_json::Value>,
}

impl DialogueLoop {
    async fn run(mut self, show_welcome: bool, initial_state: Option<serde_json::Value>) {
        self.drain_device_events();
        self.initialize(show_welcome, initial_state.as_ref()).await;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.drain_device_events();
            self.publish_state();

            self.io.handshake.enter_wait();
            let popped = self.io.notify_queue.pop().await;
            self.io.handshake.leave_wait();

            let item = match popped {
                Ok(item) => item,
                Err(e) if e.is_cancelled() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    // External reset: silent to the user.
                    self.reset_session();
                    continue;
                }
                Err(_) => break,
            };

            let outcome = match item {
                QueueItem::UserInput { command } => self.handle_user_input(command).await,
                QueueItem::PermissionRequest { principal, identity, program, response } => {
                    self.handle_permission_request(principal, identity, program, response).await
                }
                api_item => {
                    self.notifier.dispatch(&*self.io.delegate, &api_item).await;
                    self.io.delegate.send_ask_special(AskSpecialKind::Null).await;
                    Ok(())
                }
            };

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    self.reset_session();
                    self.io.delegate.send_ask_special(AskSpecialKind::Null).await;
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(AgentError::QueueClosed) => break,
                Err(AgentError::ServiceUnavailable(message)) => {
                    warn!("service outage: {}", message);
                    self.io
                        .delegate
                        .send("Sorry, I cannot contact the service right now. Try again later.", None)
                        .await;
                    self.reset_session();
                    self.io.delegate.send_ask_special(AskSpecialKind::Null).await;
                }
                Err(e) => {
                    error!("error processing turn: {}", e);
                    self.io
                        .delegate
                        .send(
                            &format!("Sorry, I had an error processing your command: {}.", e),
                            None,
                        )
                        .await;
                    self.io.delegate.send_ask_special(AskSpecialKind::Null).await;
                }
            }
        }
        self.publish_state();
        self.io.handshake.close();
        info!("dialogue loop stopped");
    }

    /// Run `initialize` across every handler and emit the winner's welcome:
    /// highest priority, registration order on ties.
    async fn initialize(&mut self, show_welcome: bool, initial_state: Option<&serde_json::Value>) {
        let handler_states = initial_state.and_then(|s| s.get("handlers"));
        let mut best: Option<(i32, ReplyResult)> = None;
        for handler in self.handlers.iter_mut() {
            let prev = handler_states.and_then(|s| s.get(handler.unique_id()));
            if let Some(reply) = handler.initialize(prev, show_welcome).await {
                let priority = handler.priority();
                let better = match &best {
                    Some((p, _)) => priority > *p,
                    None => true,
                };
                if better {
                    best = Some((priority, reply));
                }
            }
        }
        if let Some(current) = initial_state
            .and_then(|s| s.get("current_handler"))
            .and_then(|v| v.as_str())
        {
            self.session.current_handler = Some(current.to_string());
        }
        if let Some((_, reply)) = best {
            self.emit_reply(&reply).await;
        }
    }

    /// Inner loop of a user turn: analyze, arbitrate, dispatch. While the
    /// winning reply leaves `expecting` set, keep consuming user inputs
    /// only, so notifications never interleave with a sub-dialogue.
    async fn handle_user_input(&mut self, command: UserInput) -> Result<()> {
        let mut command = command;
        loop {
            if command.platform_data != PlatformData::default() {
                self.session.platform_data = command.platform_data.clone();
            }

            let mut candidates = Vec::with_capacity(self.handlers.len());
            for (handler_idx, handler) in self.handlers.iter_mut().enumerate() {
                let analysis = handler.analyze(&command).await;
                candidates.push(Candidate {
                    handler_idx,
                    priority: handler.priority(),
                    analysis,
                });
            }
            let current_idx = self
                .session
                .current_handler
                .as_deref()
                .and_then(|id| self.handlers.index_of(id));

            match arbitrate(candidates, current_idx) {
                Verdict::Stop => return Err(AgentError::Cancelled),
                Verdict::Debug => {
                    let dump = serde_json::to_string_pretty(&self.state_snapshot())
                        .unwrap_or_else(|e| format!("state dump failed: {}", e));
                    self.io.delegate.send(&dump, None).await;
                    let kind = self
                        .session
                        .expecting
                        .map(|c| c.ask_special())
                        .unwrap_or(AskSpecialKind::Null);
                    self.io.delegate.send_ask_special(kind).await;
                    return Ok(());
                }
                Verdict::NotUnderstood => {
                    info!(utterance = %command.utterance(), "no handler claimed the turn");
                    self.session.expecting = None;
                    self.session.raw = false;
                    self.io
                        .delegate
                        .send("Sorry, I did not understand that. Can you rephrase it?", None)
                        .await;
                    self.io.delegate.send_ask_special(AskSpecialKind::Null).await;
                    return Ok(());
                }
                Verdict::Winner { handler_idx, analysis } => {
                    info!(
                        utterance = %analysis.utterance,
                        target = %analysis.user_target,
                        handler = handler_idx,
                        "turn dispatched"
                    );
                    let reply = {
                        let DialogueLoop {
                            ref mut handlers,
                            ref io,
                            ref services,
                            ref mut session,
                            ..
                        } = *self;
                        let handler =
                            handlers.get_mut(handler_idx).expect("winner index out of range");
                        session.icon = handler.icon();
                        let mut dlg = SubDialogue::new(io, services, session);
                        handler.get_reply(analysis, &mut dlg).await?
                    };
                    let unique_id = self
                        .handlers
                        .get_mut(handler_idx)
                        .expect("winner index out of range")
                        .unique_id()
                        .to_string();
                    self.session.current_handler = Some(unique_id);
                    self.emit_reply(&reply).await;
                    if reply.end {
                        self.session.current_handler = None;
                        self.session.expecting = None;
                        self.session.raw = false;
                    }
                    if self.session.expecting.is_none() {
                        return Ok(());
                    }
                    command = self.next_user_command().await?;
                }
            }
        }
    }

    /// Emit one reply: its messages in order, then exactly one ask-special
    /// frame derived from `expecting`.
    async fn emit_reply(&mut self, reply: &ReplyResult) {
        for message in &reply.messages {
            self.io
                .delegate
                .send_reply_message(message, self.session.icon.as_deref())
                .await;
        }
        self.session.expecting = reply.expecting;
        self.session.raw = reply.expecting.map(|c| c.is_raw()).unwrap_or(false);
        let kind = reply.expecting.map(|c| c.ask_special()).unwrap_or(AskSpecialKind::Null);
        self.io.delegate.send_ask_special(kind).await;
    }

    /// Consent flow for a program another principal wants to run here. The
    /// decision is delivered on the response channel, best-effort: a
    /// cancelled card reports refusal rather than failing the loop.
    async fn handle_permission_request(
        &mut self,
        principal: String,
        identity: String,
        program: crate::program::ast::Program,
        response: tokio::sync::oneshot::Sender<Option<crate::program::ast::Program>>,
    ) -> Result<()> {
        let description =
            crate::program::handler::describe_program(&*self.services.catalog, &program).await;
        let outcome = {
            let DialogueLoop { ref io, ref services, ref mut session, .. } = *self;
            let mut dlg = SubDialogue::new(io, services, session);
            crate::program::permission::ask_for_permission(
                &mut dlg,
                &principal,
                &identity,
                &program,
                &description,
            )
            .await
        };
        match outcome {
            Ok(granted) => {
                let _ = response.send(granted);
                self.io.delegate.send_ask_special(AskSpecialKind::Null).await;
                Ok(())
            }
            Err(e) => {
                let _ = response.send(None);
                Err(e)
            }
        }
    }

    async fn next_user_command(&mut self) -> Result<UserInput> {
        self.io.handshake.enter_wait();
        let result = self.io.user_queue.pop().await;
        self.io.handshake.leave_wait();
        result
    }

    fn reset_session(&mut self) {
        for handler in self.handlers.iter_mut() {
            handler.reset();
        }
        self.session.reset();
        info!("session reset");
    }

    /// Attach and detach dynamic skill handlers from the device view.
    fn drain_device_events(&mut self) {
        while let Ok(event) = self.device_events.try_recv() {
            match event {
                DeviceEvent::Added(device) if device.kind == DIALOGUE_HANDLER_KIND => {
                    if self.handlers.index_of(&device.id).is_some() {
                        continue;
                    }
                    match self.services.catalog.dialogue_plugin(&device.id) {
                        Some(plugin) => {
                            info!(device = %device.id, "attaching dialogue handler");
                            self.handlers.add(Box::new(SkillHandler::new(&device.id, plugin)));
                        }
                        None => warn!(device = %device.id, "dialogue-handler device has no plugin"),
                    }
                }
                DeviceEvent::Added(_) => {}
                DeviceEvent::Removed(id) => {
                    if self.handlers.remove(&id).is_some() {
                        info!(device = %id, "detached dialogue handler");
                        if self.session.current_handler.as_deref() == Some(id.as_str()) {
                            self.session.current_handler = None;
                        }
                    }
                }
            }
        }
    }

    fn state_snapshot(&self) -> serde_json::Value {
        let mut handler_states = serde_json::Map::new();
        for handler in self.handlers.iter() {
            handler_states.insert(handler.unique_id().to_string(), handler.state());
        }
        serde_json::json!({
            "handlers": handler_states,
            "current_handler": self.session.current_handler,
            "expecting": self.session.expecting,
        })
    }

    fn publish_state(&self) {
        let _ = self.state_tx.send_replace(self.state_snapshot());
    }
}
