use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_llm::{
    ProviderEventStream, StreamEvent, StreamEventPayload, StreamRequest, StreamTarget,
    StreamingTransport,
};
use parley_storage::KeyValueStore;
use tokio::sync::mpsc;

use super::ids::{IdGenerator, MessageId, SessionId, UuidV7Ids};
use super::message::{Attachment, Message, provider_history};
use super::persistence::SessionPersistence;
use super::session::{Session, SessionStore};
use super::settings::{GenerationSettings, SettingsPatch};
use super::title::{TitleResult, derive_title};

pub const CANCELLED_NOTICE: &str = "Generation stopped by user";
pub const DELETE_ALL_PROMPT: &str =
    "Are you sure you want to delete ALL chat history? This cannot be undone.";
const STREAM_CLOSED_EARLY: &str = "provider stream ended before a terminal event";
/// Minimum gap between saves while fragments stream in.
const FRAGMENT_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Observable result of one step of the event pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    Fragment {
        session_id: SessionId,
        message_id: MessageId,
        text: String,
    },
    Completed {
        session_id: SessionId,
        message_id: MessageId,
    },
    Failed {
        session_id: SessionId,
        message_id: MessageId,
        error: String,
    },
    Cancelled {
        session_id: SessionId,
        message_id: MessageId,
    },
    TitleDerived {
        session_id: SessionId,
        title: String,
    },
    TitleFailed {
        session_id: SessionId,
        error: String,
    },
}

/// What `send_message` did with the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input or no active session.
    Ignored,
    Streaming {
        session_id: SessionId,
        message_id: MessageId,
    },
    /// The transport refused the request before streaming.
    Refused { error: String },
}

/// The single in-flight generation.
struct ActiveGeneration {
    target: StreamTarget,
    session_id: SessionId,
    bot_message_id: MessageId,
    history: Vec<Message>,
    stream: ProviderEventStream,
    saved_at: Instant,
}

struct TitleOutcome {
    session_id: SessionId,
    result: TitleResult<String>,
}

enum PumpSignal {
    Stream {
        target: StreamTarget,
        event: Option<StreamEvent>,
    },
    Title(TitleOutcome),
    Idle,
}

/// Owns the sessions and drives at most one streamed generation.
///
/// Every mutation persists the sessions. Spawning transport workers and title
/// derivations requires a running tokio runtime.
pub struct ChatController {
    transport: Arc<dyn StreamingTransport>,
    persistence: SessionPersistence,
    ids: Arc<dyn IdGenerator>,
    default_settings: GenerationSettings,
    store: SessionStore,
    active: Option<ActiveGeneration>,
    error: Option<String>,
    next_target: u64,
    title_tx: mpsc::UnboundedSender<TitleOutcome>,
    title_rx: mpsc::UnboundedReceiver<TitleOutcome>,
    titles_in_flight: HashSet<SessionId>,
}

impl ChatController {
    pub fn new(transport: Arc<dyn StreamingTransport>, store: Arc<dyn KeyValueStore>) -> Self {
        let (title_tx, title_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            persistence: SessionPersistence::new(store),
            ids: Arc::new(UuidV7Ids),
            default_settings: GenerationSettings::default(),
            store: SessionStore::new(),
            active: None,
            error: None,
            next_target: 0,
            title_tx,
            title_rx,
            titles_in_flight: HashSet::new(),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_default_settings(mut self, settings: GenerationSettings) -> Self {
        self.default_settings = settings;
        self
    }

    /// Restores persisted sessions, or starts a fresh chat when there are
    /// none or they cannot be read.
    pub fn bootstrap(&mut self) {
        match self.persistence.load() {
            Ok(Some(state)) => {
                tracing::info!(
                    session_count = state.sessions.len(),
                    "restored chat sessions"
                );
                self.store = SessionStore::restore(state.sessions, state.active_id);
                self.persist();
            }
            Ok(None) => {
                self.start_new_chat();
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to load chat sessions, starting fresh");
                self.start_new_chat();
            }
        }
    }

    pub fn sessions(&self) -> &[Session] {
        self.store.sessions()
    }

    pub fn active_session_id(&self) -> Option<&SessionId> {
        self.store.active_id()
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.store.active()
    }

    pub fn messages(&self) -> &[Message] {
        self.store
            .active()
            .map(|session| session.messages.as_slice())
            .unwrap_or_default()
    }

    /// Settings of the active session, or the defaults before bootstrap.
    pub fn settings(&self) -> &GenerationSettings {
        self.store
            .active()
            .map_or(&self.default_settings, |session| &session.settings)
    }

    pub fn default_settings(&self) -> &GenerationSettings {
        &self.default_settings
    }

    pub fn is_loading(&self) -> bool {
        self.active.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True while a stream or a title derivation can still produce updates.
    pub fn has_pending_work(&self) -> bool {
        self.active.is_some() || !self.titles_in_flight.is_empty()
    }

    pub fn send_message(&mut self, text: &str, attachments: Vec<Attachment>) -> SendOutcome {
        if text.trim().is_empty() && attachments.is_empty() {
            return SendOutcome::Ignored;
        }
        let Some(session_id) = self.store.active_id().cloned() else {
            tracing::warn!("ignoring message sent before any session exists");
            return SendOutcome::Ignored;
        };

        // One generation at a time: a new message supersedes the live one.
        self.abort_generation();

        let user_message_id = MessageId::generate(self.ids.as_ref());
        let bot_message_id = MessageId::generate(self.ids.as_ref());
        let Some(session) = self.store.get_mut(&session_id) else {
            return SendOutcome::Ignored;
        };
        session.messages.push(Message::user(
            user_message_id.clone(),
            text,
            attachments,
        ));
        let history = session.messages.clone();
        session.messages.push(Message::bot_placeholder(
            bot_message_id.clone(),
            user_message_id,
        ));
        let settings = session.settings.clone();
        self.error = None;

        let target = self.allocate_target();
        let mut request = StreamRequest::new(
            target,
            settings.provider,
            settings.model.clone(),
            provider_history(&history),
        )
        .with_temperature(settings.temperature.value());
        if !settings.system_prompt.trim().is_empty() {
            request = request.with_preamble(settings.system_prompt.clone());
        }

        match self.transport.stream_chat(request) {
            Ok(handle) => {
                tracing::debug!(
                    target = ?target,
                    session_id = %session_id,
                    provider = %settings.provider,
                    model = %settings.model,
                    history_len = history.len(),
                    "started generation"
                );
                tokio::spawn(handle.worker);
                self.active = Some(ActiveGeneration {
                    target,
                    session_id: session_id.clone(),
                    bot_message_id: bot_message_id.clone(),
                    history,
                    stream: handle.stream,
                    saved_at: Instant::now(),
                });
                self.persist();
                SendOutcome::Streaming {
                    session_id,
                    message_id: bot_message_id,
                }
            }
            Err(error) => {
                let error = error.to_string();
                tracing::warn!(
                    session_id = %session_id,
                    transport = %self.transport.id(),
                    error = %error,
                    "transport refused generation"
                );
                self.mark_failed(&session_id, &bot_message_id, &error);
                self.persist();
                SendOutcome::Refused { error }
            }
        }
    }

    /// Cancels the live generation. Returns `false` when idle.
    pub fn stop_generation(&mut self) -> bool {
        if self.abort_generation().is_none() {
            return false;
        }
        self.persist();
        true
    }

    pub fn start_new_chat(&mut self) -> SessionId {
        self.abort_generation();
        let session_id = self.insert_new_session();
        self.persist();
        session_id
    }

    /// Activates `session_id`. Unknown ids leave everything unchanged and
    /// return `false`.
    pub fn switch_chat(&mut self, session_id: &SessionId) -> bool {
        if !self.store.switch_to(session_id) {
            return false;
        }
        self.persist();
        true
    }

    pub fn delete_chat(&mut self, session_id: &SessionId) -> bool {
        if !self.store.contains(session_id) {
            return false;
        }
        if self.generation_targets(session_id) {
            self.abort_generation();
        }

        self.store.remove(session_id);
        tracing::info!(session_id = %session_id, "deleted chat session");
        if self.store.is_empty() {
            self.insert_new_session();
        }
        self.persist();
        true
    }

    /// Deletes every session once `confirm` accepts [`DELETE_ALL_PROMPT`].
    ///
    /// Both persisted keys stay removed until the next mutation writes the
    /// fresh session.
    pub fn delete_all_sessions(&mut self, confirm: impl FnOnce(&str) -> bool) -> bool {
        if !confirm(DELETE_ALL_PROMPT) {
            return false;
        }

        self.abort_generation();
        let deleted = self.store.len();
        self.store.clear();
        if let Err(error) = self.persistence.clear() {
            tracing::error!(error = %error, "failed to clear persisted chat sessions");
        }
        self.insert_new_session();
        tracing::info!(deleted, "deleted all chat sessions");
        true
    }

    pub fn clear_chat(&mut self) -> bool {
        let Some(session_id) = self.store.active_id().cloned() else {
            return false;
        };
        if self.generation_targets(&session_id) {
            self.abort_generation();
        }
        let Some(session) = self.store.get_mut(&session_id) else {
            return false;
        };
        session.messages.clear();
        self.persist();
        true
    }

    pub fn update_settings(&mut self, patch: SettingsPatch) -> bool {
        let Some(session) = self.store.active_mut() else {
            return false;
        };
        session.settings.apply(patch);
        self.persist();
        true
    }

    pub fn rename_chat(&mut self, session_id: &SessionId, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            tracing::warn!(session_id = %session_id, "ignoring blank session title");
            return false;
        }
        let Some(session) = self.store.get_mut(session_id) else {
            return false;
        };
        session.title = title.to_string();
        self.persist();
        true
    }

    /// Re-sends the last user message of the active session. A failed or
    /// missing reply is removed together with its question first.
    pub fn retry_last_message(&mut self) -> SendOutcome {
        let Some(last_user) = self
            .store
            .active()
            .and_then(Session::last_user_message)
            .cloned()
        else {
            return SendOutcome::Ignored;
        };

        self.abort_generation();

        if let Some(session) = self.store.active_mut() {
            let reply_position = session.reply_position(&last_user.id);
            let reply_failed = reply_position.is_none_or(|position| session.messages[position].error);
            if reply_failed {
                session.messages.retain(|message| {
                    message.id != last_user.id && message.responds_to.as_ref() != Some(&last_user.id)
                });
            }
        }

        self.send_message(&last_user.text, last_user.attachments)
    }

    /// Waits for the next stream event or title outcome and applies it.
    ///
    /// Returns `None` at once when nothing is outstanding. Cancel-safe.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        loop {
            let stream_live = self.active.is_some();
            let titles_pending = !self.titles_in_flight.is_empty();
            if !stream_live && !titles_pending {
                return None;
            }

            // Both arms are cancel-safe, so a caller dropping this future
            // between events loses nothing.
            let signal = tokio::select! {
                next = next_stream_event(&mut self.active), if stream_live => match next {
                    Some((target, event)) => PumpSignal::Stream { target, event },
                    None => PumpSignal::Idle,
                },
                outcome = self.title_rx.recv(), if titles_pending => match outcome {
                    Some(outcome) => PumpSignal::Title(outcome),
                    None => PumpSignal::Idle,
                },
            };

            let update = match signal {
                PumpSignal::Stream { target, event } => self.apply_stream_event(target, event),
                PumpSignal::Title(outcome) => self.apply_title_outcome(outcome),
                PumpSignal::Idle => None,
            };
            if update.is_some() {
                return update;
            }
        }
    }

    fn apply_stream_event(
        &mut self,
        target: StreamTarget,
        event: Option<StreamEvent>,
    ) -> Option<ChatUpdate> {
        // A closed channel without a terminal payload means the worker died.
        let Some(event) = event else {
            let generation = self.take_generation(target)?;
            tracing::warn!(target = ?target, "provider stream closed without a terminal event");
            return Some(self.finish_failed(generation, STREAM_CLOSED_EARLY.to_string()));
        };
        if event.target != target {
            tracing::debug!(
                expected = ?target,
                received = ?event.target,
                "dropping event for a superseded generation"
            );
            return None;
        }

        match event.payload {
            StreamEventPayload::Delta(fragment) => {
                let generation = self.active.as_mut()?;
                let save_due = generation.saved_at.elapsed() >= FRAGMENT_SAVE_INTERVAL;
                if save_due {
                    generation.saved_at = Instant::now();
                }
                let session_id = generation.session_id.clone();
                let message_id = generation.bot_message_id.clone();
                let Some(message) = self
                    .store
                    .get_mut(&session_id)
                    .and_then(|session| session.message_mut(&message_id))
                else {
                    tracing::warn!(
                        session_id = %session_id,
                        message_id = %message_id,
                        "dropping fragment for a missing message"
                    );
                    return None;
                };
                // Partial text is saved at most once per interval; the terminal
                // event always saves.
                message.text.push_str(&fragment);
                if save_due {
                    self.persist();
                }
                Some(ChatUpdate::Fragment {
                    session_id,
                    message_id,
                    text: fragment,
                })
            }
            StreamEventPayload::Done => {
                let generation = self.take_generation(target)?;
                Some(self.finish_completed(generation))
            }
            StreamEventPayload::Error(error) => {
                let generation = self.take_generation(target)?;
                tracing::warn!(
                    target = ?target,
                    session_id = %generation.session_id,
                    error = %error,
                    "generation failed"
                );
                Some(self.finish_failed(generation, error))
            }
            StreamEventPayload::Cancelled => {
                let generation = self.take_generation(target)?;
                let update = ChatUpdate::Cancelled {
                    session_id: generation.session_id.clone(),
                    message_id: generation.bot_message_id.clone(),
                };
                self.mark_cancelled(generation);
                self.persist();
                Some(update)
            }
        }
    }

    fn apply_title_outcome(&mut self, outcome: TitleOutcome) -> Option<ChatUpdate> {
        let TitleOutcome { session_id, result } = outcome;
        self.titles_in_flight.remove(&session_id);

        match result {
            Ok(title) => {
                let Some(session) = self.store.get_mut(&session_id) else {
                    tracing::debug!(session_id = %session_id, "title derived for a deleted session");
                    return None;
                };
                // A manual rename while deriving wins.
                if !session.has_default_title() {
                    tracing::debug!(
                        session_id = %session_id,
                        "keeping title that changed while deriving"
                    );
                    return None;
                }
                session.title = title.clone();
                tracing::info!(session_id = %session_id, title = %title, "derived session title");
                self.persist();
                Some(ChatUpdate::TitleDerived { session_id, title })
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "auto-title failed");
                Some(ChatUpdate::TitleFailed {
                    session_id,
                    error: error.to_string(),
                })
            }
        }
    }

    fn finish_completed(&mut self, generation: ActiveGeneration) -> ChatUpdate {
        let ActiveGeneration {
            target,
            session_id,
            bot_message_id,
            mut history,
            ..
        } = generation;
        tracing::debug!(target = ?target, session_id = %session_id, "generation completed");
        self.persist();

        let reply = self
            .store
            .get(&session_id)
            .and_then(|session| {
                session
                    .messages
                    .iter()
                    .find(|message| message.id == bot_message_id)
            })
            .cloned();
        if let Some(reply) = reply
            && !history.is_empty()
        {
            history.push(reply);
            self.spawn_title_derivation(&session_id, history);
        }

        ChatUpdate::Completed {
            session_id,
            message_id: bot_message_id,
        }
    }

    fn finish_failed(&mut self, generation: ActiveGeneration, error: String) -> ChatUpdate {
        self.mark_failed(&generation.session_id, &generation.bot_message_id, &error);
        self.persist();
        ChatUpdate::Failed {
            session_id: generation.session_id,
            message_id: generation.bot_message_id,
            error,
        }
    }

    fn spawn_title_derivation(&mut self, session_id: &SessionId, exchange: Vec<Message>) {
        let Some(session) = self.store.get(session_id) else {
            return;
        };
        if !session.has_default_title() || self.titles_in_flight.contains(session_id) {
            return;
        }

        let settings = session.settings.clone();
        let target = self.allocate_target();
        let transport = Arc::clone(&self.transport);
        let title_tx = self.title_tx.clone();
        let session_id = session_id.clone();
        self.titles_in_flight.insert(session_id.clone());

        tokio::spawn(async move {
            let result = derive_title(transport.as_ref(), target, &exchange, &settings).await;
            let _ = title_tx.send(TitleOutcome { session_id, result });
        });
    }

    /// Cancels and discards the live generation, leaving the cancellation
    /// notice on its placeholder. The caller persists.
    fn abort_generation(&mut self) -> Option<SessionId> {
        let mut generation = self.active.take()?;
        // The worker stops upstream; anything it already queued is dropped
        // with the stream.
        generation.stream.cancel();
        tracing::info!(
            target = ?generation.target,
            session_id = %generation.session_id,
            "generation cancelled"
        );
        let session_id = generation.session_id.clone();
        self.mark_cancelled(generation);
        Some(session_id)
    }

    fn mark_cancelled(&mut self, generation: ActiveGeneration) {
        self.error = Some(CANCELLED_NOTICE.to_string());
        if let Some(message) = self
            .store
            .get_mut(&generation.session_id)
            .and_then(|session| session.message_mut(&generation.bot_message_id))
        {
            message.mark_failed(CANCELLED_NOTICE);
        }
    }

    fn mark_failed(&mut self, session_id: &SessionId, message_id: &MessageId, error: &str) {
        self.error = Some(error.to_string());
        if let Some(message) = self
            .store
            .get_mut(session_id)
            .and_then(|session| session.message_mut(message_id))
        {
            message.mark_failed(format!("Error: {error}"));
        }
    }

    fn take_generation(&mut self, target: StreamTarget) -> Option<ActiveGeneration> {
        if self.active.as_ref()?.target != target {
            return None;
        }
        self.active.take()
    }

    fn generation_targets(&self, session_id: &SessionId) -> bool {
        self.active
            .as_ref()
            .is_some_and(|generation| &generation.session_id == session_id)
    }

    fn insert_new_session(&mut self) -> SessionId {
        let session_id = SessionId::generate(self.ids.as_ref());
        self.store.start_new(Session::new(
            session_id.clone(),
            self.default_settings.clone(),
        ));
        tracing::debug!(session_id = %session_id, "started new chat session");
        session_id
    }

    fn allocate_target(&mut self) -> StreamTarget {
        self.next_target += 1;
        StreamTarget::new(self.next_target)
    }

    /// Write failures are logged and never abort the operation that caused
    /// them.
    fn persist(&self) {
        if self.store.is_empty() {
            return;
        }
        if let Err(error) = self
            .persistence
            .save(self.store.sessions(), self.store.active_id())
        {
            tracing::error!(error = %error, "failed to persist chat sessions");
        }
    }
}

async fn next_stream_event(
    active: &mut Option<ActiveGeneration>,
) -> Option<(StreamTarget, Option<StreamEvent>)> {
    let generation = active.as_mut()?;
    let target = generation.target;
    Some((target, generation.stream.recv().await))
}
