use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::analysis::{AnalysisRequest, AnalysisService};
use super::decision::{decide, Action, Trigger};
use super::frame::{classify_inbound, post_reset, post_story_state, BoardFrame, Inbound, PostOutcome};
use super::session::SidePanelSession;
use super::{
    PanelNotice, TOAST_FORCED, TOAST_RESET, TOAST_RESTORED, TOAST_SELECTION_FAILED, TOAST_UPDATED,
};
use crate::config::{board_frame_src, Config, ServerEnv};
use crate::error::{Result, VisualboardError, CONTEXT_INVALIDATED_NOTICE, GENERIC_ANALYSIS_FAILURE};
use crate::model::cast::hints_from_previous_state;
use crate::model::{
    calculate_turn_id, now_millis, CastHint, CastStore, ChatId, ChatSite, LastSuccessRecord,
    ScenarioKey, StoryState, TurnId,
};
use crate::protocol::iframe::InboundFrameMessage;
use crate::protocol::runtime::{
    AutoUpdateError, FailureReason, NewTurn, RouterLink, RuntimeMessage, PROVIDER_ROFAN_AI,
};
use crate::storage::{BoardStore, ChatLogStore, KeyValueStore};

const FRAME_POST_FAILED: &str = "Failed to post state to iframe";

#[derive(Debug, Clone)]
pub struct PanelSettings {
    pub provider: String,
    pub site: ChatSite,
    /// Window this panel belongs to. Turns from other windows are ignored.
    pub window_id: Option<i64>,
    pub min_post_interval: Duration,
    pub mount_restore_delay: Duration,
    pub auto_update: bool,
    pub selection_mode: bool,
}

impl PanelSettings {
    pub fn from_config(config: &Config, window_id: Option<i64>) -> Self {
        Self {
            provider: config.content.provider.clone(),
            site: ChatSite::new(config.content.host.clone()),
            window_id,
            min_post_interval: config.min_post_interval(),
            mount_restore_delay: config.mount_restore_delay(),
            auto_update: config.sidepanel.auto_update,
            selection_mode: config.content.selection_mode,
        }
    }
}

/// One candidate turn.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub text: String,
    pub scenario_key: Option<ScenarioKey>,
    pub message_id: Option<String>,
    pub chat_id: Option<ChatId>,
}

impl TurnInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_scenario_key(mut self, key: Option<ScenarioKey>) -> Self {
        self.scenario_key = key;
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    fn from_new_turn(turn: &NewTurn) -> Self {
        Self {
            text: turn.text.clone(),
            scenario_key: turn.scenario_key.clone(),
            message_id: None,
            chat_id: turn.chat_id.clone().map(ChatId::new),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Cached state pushed, no remote call.
    Restored,
    /// Board already shows this turn.
    Skipped,
    /// Fresh analysis. `post` is `None` when the panel moved to another
    /// scenario while the call was in flight.
    Analyzed { post: Option<PostOutcome> },
}

type FlightResult = Option<Result<TurnOutcome>>;
type FlightKey = (ScenarioKey, TurnId);
type Flights = std::sync::Mutex<HashMap<FlightKey, watch::Receiver<FlightResult>>>;

fn lock_flights(flights: &Flights) -> std::sync::MutexGuard<'_, HashMap<FlightKey, watch::Receiver<FlightResult>>> {
    match flights.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registration of the leading call for one turn. Dropping it, including
/// when the leader future is cancelled, frees the turn for new triggers.
struct FlightGuard<'a> {
    flights: &'a Flights,
    key: FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock_flights(self.flights).remove(&self.key);
    }
}

/// Busy flag of the analyze button.
struct ManualTriggerGuard<'a>(&'a AtomicBool);

impl<'a> ManualTriggerGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ManualTriggerGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SidePanelController {
    config: Config,
    settings: PanelSettings,
    board: BoardStore,
    chat_logs: ChatLogStore,
    analysis: Arc<dyn AnalysisService>,
    router: Arc<dyn RouterLink>,
    frame: Arc<dyn BoardFrame>,
    session: Mutex<SidePanelSession>,
    base_url: RwLock<String>,
    auto_update: AtomicBool,
    busy: AtomicBool,
    in_flight: Flights,
    notices: mpsc::UnboundedSender<PanelNotice>,
    unmounted: CancellationToken,
}

impl SidePanelController {
    pub fn new(
        config: Config,
        settings: PanelSettings,
        store: Arc<dyn KeyValueStore>,
        analysis: Arc<dyn AnalysisService>,
        router: Arc<dyn RouterLink>,
        frame: Arc<dyn BoardFrame>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PanelNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let base_url = config.base_url();
        let auto_update = settings.auto_update;
        let controller = Arc::new(Self {
            config,
            settings,
            board: BoardStore::new(store.clone()),
            chat_logs: ChatLogStore::new(store),
            analysis,
            router,
            frame,
            session: Mutex::new(SidePanelSession::new()),
            base_url: RwLock::new(base_url),
            auto_update: AtomicBool::new(auto_update),
            busy: AtomicBool::new(false),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            notices,
            unmounted: CancellationToken::new(),
        });
        (controller, notice_rx)
    }

    pub fn board_store(&self) -> &BoardStore {
        &self.board
    }

    pub async fn base_url(&self) -> String {
        self.base_url.read().await.clone()
    }

    pub fn auto_update(&self) -> bool {
        self.auto_update.load(Ordering::SeqCst)
    }

    pub fn set_auto_update(&self, enabled: bool) {
        self.auto_update.store(enabled, Ordering::SeqCst);
        tracing::info!("Auto update {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub async fn scenario_key(&self) -> Option<ScenarioKey> {
        self.session.lock().await.scenario_key().cloned()
    }

    pub async fn story_state(&self) -> Option<StoryState> {
        self.session.lock().await.story_state().cloned()
    }

    pub async fn turn_id(&self) -> Option<TurnId> {
        self.session.lock().await.turn_id().cloned()
    }

    fn notify(&self, notice: PanelNotice) {
        if self.notices.send(notice).is_err() {
            tracing::debug!("No notice listener");
        }
    }

    pub async fn handle_scenario_change(&self, next: Option<&ScenarioKey>) -> bool {
        self.session.lock().await.handle_scenario_change(next)
    }

    /// Re-read the server environment and point the board at it.
    /// The persisted setting wins over the config file.
    pub async fn reload_environment(&self, env: Option<ServerEnv>) -> String {
        let env = match env {
            Some(env) => env,
            None => match self.board.server_env().await {
                Ok(Some(env)) => env,
                Ok(None) => self.config.server.env,
                Err(e) => {
                    tracing::warn!("Failed to read server env: {}", e);
                    self.config.server.env
                }
            },
        };
        let base_url = self.config.base_url_for(env);
        *self.base_url.write().await = base_url.clone();
        self.frame.load(&board_frame_src(&base_url));
        tracing::info!("Server environment {} ({})", env, base_url);
        base_url
    }

    async fn resolve_scenario_key(&self, explicit: Option<ScenarioKey>) -> Result<ScenarioKey> {
        if let Some(key) = explicit {
            return Ok(key);
        }
        if let Some(key) = self.scenario_key().await {
            return Ok(key);
        }
        let url = self.router.active_tab_url().await.unwrap_or_else(|e| {
            tracing::warn!("Active tab lookup failed: {}", e);
            None
        });
        url.and_then(|u| self.settings.site.scenario_key(&u))
            .ok_or(VisualboardError::ScenarioKeyUnresolved)
    }

    async fn load_record(&self, key: &ScenarioKey) -> Option<LastSuccessRecord> {
        self.board.last_success(key).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to load last success record: {}", e);
            None
        })
    }

    async fn load_cast(&self, key: &ScenarioKey) -> CastStore {
        self.board.cast(key).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to load cast store: {}", e);
            CastStore::default()
        })
    }

    /// Run one candidate turn through the decision table.
    pub async fn process_turn(&self, input: TurnInput, trigger: Trigger) -> Result<TurnOutcome> {
        let text = input.text.trim();
        if text.is_empty() {
            return Err(VisualboardError::EmptyText);
        }
        let key = self.resolve_scenario_key(input.scenario_key.clone()).await?;
        {
            let mut session = self.session.lock().await;
            session.handle_scenario_change(Some(&key));
        }

        let turn_id = calculate_turn_id(text, input.message_id.as_deref());
        let record = self.load_record(&key).await;
        let board = self.session.lock().await.board();
        let action = decide(&trigger, &board, &turn_id, record.as_ref());
        tracing::info!(
            scenario = %key,
            turn = %short(turn_id.as_str()),
            ?action,
            kind = ?trigger.kind,
            force = trigger.force,
            "Turn decision"
        );

        match action {
            Action::Skip => return Ok(TurnOutcome::Skipped),
            Action::Restore => {
                if let Some(record) = &record {
                    if self.restore(record).await? {
                        self.persist_restore(record).await;
                        return Ok(TurnOutcome::Restored);
                    }
                }
                tracing::info!("Restore failed, analyzing instead");
            }
            Action::Retry | Action::Analyze => {}
        }

        self.analyze_once(key, turn_id, text, input.chat_id, record).await
    }

    /// Collapse concurrent triggers for the same turn into one remote call.
    async fn analyze_once(
        &self,
        key: ScenarioKey,
        turn_id: TurnId,
        text: &str,
        chat_id: Option<ChatId>,
        record: Option<LastSuccessRecord>,
    ) -> Result<TurnOutcome> {
        let flight_key = (key.clone(), turn_id.clone());
        let leader = {
            let mut flights = lock_flights(&self.in_flight);
            if let Some(rx) = flights.get(&flight_key).cloned() {
                drop(flights);
                Err(rx)
            } else {
                let (tx, rx) = watch::channel(None);
                flights.insert(flight_key.clone(), rx);
                let guard = FlightGuard {
                    flights: &self.in_flight,
                    key: flight_key,
                };
                Ok((tx, guard))
            }
        };
        let (tx, guard) = match leader {
            Ok(leader) => leader,
            Err(rx) => {
                tracing::info!("Analysis already in flight for this turn, waiting");
                return join_flight(rx).await;
            }
        };

        let result = self.run_analysis(&key, &turn_id, text, chat_id, record).await;

        drop(guard);
        let shared = match &result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(share_error(e)),
        };
        let _ = tx.send(Some(shared));
        result
    }

    /// Analyze, then persist the outcome whatever it was.
    async fn run_analysis(
        &self,
        key: &ScenarioKey,
        turn_id: &TurnId,
        text: &str,
        chat_id: Option<ChatId>,
        record: Option<LastSuccessRecord>,
    ) -> Result<TurnOutcome> {
        let result = self
            .call_and_apply(key, turn_id, text, chat_id, record.as_ref())
            .await;

        match &result {
            Ok((_, state, cast)) => {
                let record = LastSuccessRecord::success(
                    key.clone(),
                    turn_id.clone(),
                    state.clone(),
                    cast.clone(),
                    now_millis(),
                );
                if let Err(e) = self.board.save_last_success(&record).await {
                    tracing::error!("Failed to save last success record: {}", e);
                }
            }
            Err(e) => self.persist_failure(key, turn_id, e).await,
        }
        result.map(|(outcome, _, _)| outcome)
    }

    async fn call_and_apply(
        &self,
        key: &ScenarioKey,
        turn_id: &TurnId,
        text: &str,
        chat_id: Option<ChatId>,
        record: Option<&LastSuccessRecord>,
    ) -> Result<(TurnOutcome, StoryState, CastStore)> {
        let previous = self.session.lock().await.story_state().cloned();
        let mut cast = self.load_cast(key).await;
        let hints = select_cast_hints(&cast, record, previous.as_ref());

        let chat_id = chat_id.or_else(|| self.settings.site.chat_id(key.as_str()));
        let bot_context = match &chat_id {
            Some(chat_id) => self
                .chat_logs
                .analysis_bot_context(chat_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!("Bot context unavailable: {}", e);
                    None
                }),
            None => None,
        };

        let request = AnalysisRequest::new(text, previous)
            .with_cast_hints(hints)
            .with_bot_context(bot_context);
        let base_url = self.base_url().await;
        let raw = self.analysis.analyze(&base_url, &request).await?;

        let mut state = StoryState::from_value(raw)?.normalized();
        cast.match_characters(&mut state);
        if let Err(e) = self.board.save_cast(key, &cast).await {
            tracing::warn!("Failed to save cast store after matching: {}", e);
        }

        let mut session = self.session.lock().await;
        if session.scenario_key() != Some(key) {
            tracing::info!(scenario = %key, "Scenario changed during analysis, not adopting");
            return Ok((TurnOutcome::Analyzed { post: None }, state, cast));
        }
        session.adopt(key, turn_id.clone(), state.clone());
        let post = post_story_state(
            self.frame.as_ref(),
            &mut session,
            &state,
            key,
            self.settings.min_post_interval,
            now_millis(),
        )?;
        if !post.is_delivered() {
            return Err(VisualboardError::Other(FRAME_POST_FAILED.to_string()));
        }
        Ok((TurnOutcome::Analyzed { post: Some(post) }, state, cast))
    }

    async fn persist_failure(&self, key: &ScenarioKey, turn_id: &TurnId, err: &VisualboardError) {
        let previous = self.load_record(key).await;
        let cast = self.load_cast(key).await;
        let record = LastSuccessRecord::failure(
            previous,
            key.clone(),
            turn_id.clone(),
            cast,
            error_text(err),
            now_millis(),
        );
        match self.board.save_last_success(&record).await {
            Ok(()) => tracing::info!(turn = %short(turn_id.as_str()), "Saved last error"),
            Err(e) => tracing::error!("Failed to save last error: {}", e),
        }
    }

    async fn persist_restore(&self, record: &LastSuccessRecord) {
        let Some(state) = record.state.clone() else {
            return;
        };
        let cast = self.load_cast(&record.scenario_key).await;
        let refreshed = LastSuccessRecord::success(
            record.scenario_key.clone(),
            record.turn_id.clone(),
            state,
            cast,
            now_millis(),
        );
        if let Err(e) = self.board.save_last_success(&refreshed).await {
            tracing::warn!("Failed to refresh last success record: {}", e);
        }
    }

    /// Push a cached record to the board and adopt it. False when the
    /// board did not take it.
    pub async fn restore(&self, record: &LastSuccessRecord) -> Result<bool> {
        let Some(state) = record.state.clone() else {
            return Ok(false);
        };
        let mut session = self.session.lock().await;
        let post = post_story_state(
            self.frame.as_ref(),
            &mut session,
            &state,
            &record.scenario_key,
            self.settings.min_post_interval,
            now_millis(),
        )?;
        if !post.is_delivered() {
            tracing::warn!(?post, "Restore push not delivered");
            return Ok(false);
        }
        session.adopt(&record.scenario_key, record.turn_id.clone(), state);
        tracing::info!(
            scenario = %record.scenario_key,
            turn = %short(record.turn_id.as_str()),
            "Restored board from last success record"
        );
        Ok(true)
    }

    /// One-shot reconciliation after mount or iframe load: restore the
    /// active tab's scenario if the board is still empty.
    pub async fn mount_restore(&self) -> bool {
        if !self.session.lock().await.is_board_empty() {
            return false;
        }
        let reply = match self.router.request_last_ai_message(&self.settings.provider).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Mount restore skipped: {}", e);
                return false;
            }
        };
        let key = match reply.scenario_key.clone() {
            Some(key) => Some(key),
            None => self
                .router
                .active_tab_url()
                .await
                .ok()
                .flatten()
                .and_then(|url| self.settings.site.scenario_key(&url)),
        };
        let Some(key) = key else {
            tracing::debug!("Mount restore skipped: no scenario key");
            return false;
        };
        self.handle_scenario_change(Some(&key)).await;

        let Some(record) = self.load_record(&key).await.filter(|r| r.state.is_some()) else {
            return false;
        };
        if !self.session.lock().await.is_board_empty() {
            return false;
        }
        match self.restore(&record).await {
            Ok(restored) => restored,
            Err(e) => {
                tracing::debug!("Mount restore failed: {}", e);
                false
            }
        }
    }

    /// Panel opened: load the environment and schedule the delayed restore.
    pub async fn mount(self: &Arc<Self>) -> JoinHandle<bool> {
        self.reload_environment(None).await;
        let controller = self.clone();
        let delay = self.settings.mount_restore_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.unmounted.cancelled() => false,
                _ = tokio::time::sleep(delay) => controller.mount_restore().await,
            }
        })
    }

    /// The iframe finished (re)loading.
    pub async fn on_frame_loaded(&self) -> bool {
        self.mount_restore().await
    }

    pub fn unmount(&self) {
        self.unmounted.cancel();
    }

    /// The analyze button. `shift` forces a fresh analysis.
    pub async fn on_manual_click(&self, shift: bool) -> Option<Result<TurnOutcome>> {
        let Some(_guard) = ManualTriggerGuard::acquire(&self.busy) else {
            tracing::debug!("Analyze already running, click ignored");
            return None;
        };

        let reply = self.router.request_last_ai_message(&self.settings.provider).await;
        let (text, key) = match &reply {
            Ok(reply) => match reply.usable_text() {
                Some(text) => (text.to_string(), reply.scenario_key.clone()),
                None => {
                    tracing::warn!(reason = ?reply.reason, "Last AI message unavailable");
                    self.notify(PanelNotice::error(GENERIC_ANALYSIS_FAILURE));
                    return Some(Err(VisualboardError::Forward {
                        reason: reply
                            .reason
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "not_found".to_string()),
                        message: reply.error.clone().unwrap_or_default(),
                    }));
                }
            },
            Err(e) => {
                tracing::warn!("Last AI message request failed: {}", e);
                self.notify(PanelNotice::error(GENERIC_ANALYSIS_FAILURE));
                return Some(Err(share_error(e)));
            }
        };
        self.handle_scenario_change(key.as_ref()).await;

        let result = self
            .process_turn(TurnInput::new(text).with_scenario_key(key), Trigger::manual(shift))
            .await;
        match &result {
            Ok(TurnOutcome::Restored) => self.notify(PanelNotice::success(TOAST_RESTORED)),
            Ok(_) if shift => self.notify(PanelNotice::success(TOAST_FORCED)),
            Ok(_) => self.notify(PanelNotice::success(TOAST_UPDATED)),
            Err(e) => self.report_error(e),
        }
        Some(result)
    }

    /// The reset button: clear the board without touching storage.
    pub async fn reset_board(&self) -> Result<()> {
        self.session.lock().await.reset_board();
        post_reset(self.frame.as_ref(), now_millis())?;
        tracing::info!("Board reset");
        self.notify(PanelNotice::success(TOAST_RESET));
        Ok(())
    }

    fn report_error(&self, err: &VisualboardError) {
        if err.is_context_invalidated() {
            self.notify(PanelNotice::Persistent(CONTEXT_INVALIDATED_NOTICE.to_string()));
        } else {
            self.notify(PanelNotice::error(err.user_message()));
        }
    }

    async fn on_new_turn(&self, turn: NewTurn) -> Option<Result<TurnOutcome>> {
        let Some(source_window) = turn.source_window_id else {
            tracing::debug!("Ignoring first-hop NEW_LAST_AI_TURN");
            return None;
        };
        self.handle_scenario_change(turn.scenario_key.as_ref()).await;

        if turn.provider != PROVIDER_ROFAN_AI {
            return None;
        }
        if !self.auto_update() {
            tracing::debug!("Auto update off, turn ignored");
            return None;
        }
        if let Some(window_id) = self.settings.window_id {
            if window_id != source_window {
                tracing::debug!(window_id, source_window, "Turn from another window ignored");
                return None;
            }
        }

        let result = self
            .process_turn(TurnInput::from_new_turn(&turn), Trigger::auto())
            .await;
        if let Err(e) = &result {
            if e.is_context_invalidated() {
                self.report_error(e);
            } else {
                tracing::warn!("Auto update failed: {}", e);
            }
        }
        Some(result)
    }

    fn on_auto_update_error(&self, err: AutoUpdateError) {
        tracing::warn!(reason = %err.reason, "AUTO_UPDATE_ERROR: {}", err.message);
        self.set_auto_update(false);
        if err.reason == FailureReason::ContextInvalidated {
            self.notify(PanelNotice::Persistent(err.message));
        } else {
            self.notify(PanelNotice::AutoUpdateDisabled(err.message));
        }
    }

    async fn on_text_selected(&self, text: String) -> Option<Result<TurnOutcome>> {
        if !self.settings.selection_mode || text.trim().is_empty() {
            return None;
        }
        let result = self.process_turn(TurnInput::new(text), Trigger::selection()).await;
        match &result {
            Ok(_) => self.notify(PanelNotice::success(TOAST_UPDATED)),
            Err(e) if e.is_context_invalidated() => self.report_error(e),
            Err(_) => self.notify(PanelNotice::error(TOAST_SELECTION_FAILED)),
        }
        Some(result)
    }

    /// Entry point for extension-wide runtime messages. Returns the reply,
    /// if the message expects one.
    pub async fn dispatch(&self, message: RuntimeMessage) -> Option<Value> {
        tracing::debug!("Runtime message {}", message.kind());
        match message {
            RuntimeMessage::NewLastAiTurn(turn) => {
                self.on_new_turn(turn).await;
                None
            }
            RuntimeMessage::AutoUpdateError(err) => {
                self.on_auto_update_error(err);
                None
            }
            RuntimeMessage::TextSelected(selected) => {
                self.on_text_selected(selected.text).await;
                None
            }
            RuntimeMessage::EnvChanged(changed) => {
                let env = ServerEnv::from_setting(Some(changed.server_env.as_str()));
                self.reload_environment(Some(env)).await;
                Some(json!({ "success": true }))
            }
            RuntimeMessage::RequestLastAiMessage(_) => None,
        }
    }

    /// Entry point for window messages from the board iframe.
    pub async fn handle_frame_message(&self, message: InboundFrameMessage) -> Inbound {
        let origin = self.base_url().await;
        let mut session = self.session.lock().await;
        let inbound = classify_inbound(&message, &origin, &session);
        match &inbound {
            Inbound::Ignore(why) => tracing::debug!("Ignoring board message: {}", why),
            Inbound::AbsorbState(state) => {
                session.absorb(state.clone());
                tracing::debug!("Absorbed board state");
            }
            Inbound::SaveCast { scenario_key, cast } => {
                drop(session);
                match self.board.save_cast(scenario_key, cast).await {
                    Ok(()) => tracing::info!(
                        scenario = %scenario_key,
                        characters = cast.len(),
                        "Cast store synced from board"
                    ),
                    Err(e) => tracing::warn!("Failed to save cast store: {}", e),
                }
            }
        }
        inbound
    }

    /// Listen on both inboxes until unmounted. Runtime messages are handled
    /// on their own tasks so concurrent triggers can overlap.
    pub fn run(
        self: &Arc<Self>,
        mut runtime: broadcast::Receiver<RuntimeMessage>,
        mut frame: mpsc::UnboundedReceiver<InboundFrameMessage>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = controller.unmounted.cancelled() => break,
                    msg = runtime.recv() => match msg {
                        Ok(msg) => {
                            let c = controller.clone();
                            tokio::spawn(async move { c.dispatch(msg).await });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Side panel lagged {} runtime messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    Some(msg) = frame.recv() => {
                        controller.handle_frame_message(msg).await;
                    }
                }
            }
            tracing::debug!("Side panel stopped");
        })
    }
}

/// Live cast store, then the cached record's cast, then names pulled from
/// the board state.
fn select_cast_hints(
    cast: &CastStore,
    record: Option<&LastSuccessRecord>,
    previous: Option<&StoryState>,
) -> Vec<CastHint> {
    if !cast.is_empty() {
        return cast.cast_hints();
    }
    if let Some(record) = record.filter(|r| !r.cast.is_empty()) {
        return record.cast.cast_hints();
    }
    previous.map(hints_from_previous_state).unwrap_or_default()
}

async fn join_flight(mut rx: watch::Receiver<FlightResult>) -> Result<TurnOutcome> {
    match rx.wait_for(Option::is_some).await {
        Ok(done) => match &*done {
            Some(Ok(outcome)) => Ok(outcome.clone()),
            Some(Err(e)) => Err(share_error(e)),
            None => Err(VisualboardError::Other("analysis abandoned".to_string())),
        },
        Err(_) => Err(VisualboardError::Other("analysis abandoned".to_string())),
    }
}

/// Copy of an error for a second waiter, keeping the variants callers
/// branch on.
fn share_error(err: &VisualboardError) -> VisualboardError {
    match err {
        VisualboardError::ContextInvalidated => VisualboardError::ContextInvalidated,
        VisualboardError::ScenarioKeyUnresolved => VisualboardError::ScenarioKeyUnresolved,
        VisualboardError::EmptyText => VisualboardError::EmptyText,
        VisualboardError::Analysis { code, message } => VisualboardError::Analysis {
            code: *code,
            message: message.clone(),
        },
        VisualboardError::ChannelClosed(msg) => VisualboardError::ChannelClosed(msg.clone()),
        other => VisualboardError::Other(other.to_string()),
    }
}

/// Text stored in `lastError`.
fn error_text(err: &VisualboardError) -> String {
    match err {
        VisualboardError::Analysis { message, code } if message.is_empty() => code.to_string(),
        VisualboardError::Analysis { message, .. } => message.clone(),
        VisualboardError::Other(message) => message.clone(),
        other => other.to_string(),
    }
}

fn short(id: &str) -> String {
    id.chars().take(24).collect()
}
