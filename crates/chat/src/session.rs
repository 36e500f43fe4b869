use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ids::{MessageId, SessionId};
use super::message::Message;
use super::settings::GenerationSettings;

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub settings: GenerationSettings,
}

impl Session {
    pub fn new(id: SessionId, settings: GenerationSettings) -> Self {
        Self {
            id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            settings,
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_SESSION_TITLE
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|message| message.is_user())
    }

    /// Position of the bot reply answering `user_message_id`.
    pub fn reply_position(&self, user_message_id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.responds_to.as_ref() == Some(user_message_id))
    }
}

/// Ordered sessions (most recent first) plus the active selection.
///
/// After the first session is inserted the active id always names a stored
/// session, unless the last one is removed.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    sessions: Vec<Session>,
    active: Option<SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from persisted parts. Only the first session with a
    /// given id is kept. An active id that names no session falls back to the
    /// first one.
    pub fn restore(mut sessions: Vec<Session>, active: Option<SessionId>) -> Self {
        let mut seen = HashSet::new();
        sessions.retain(|session| {
            let first = seen.insert(session.id.clone());
            if !first {
                tracing::warn!(session_id = %session.id, "dropping duplicate stored session");
            }
            first
        });

        let active = active
            .filter(|id| sessions.iter().any(|session| &session.id == id))
            .or_else(|| sessions.first().map(|session| session.id.clone()));
        Self { sessions, active }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_id(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref().and_then(|id| self.get(id))
    }

    pub fn active_mut(&mut self) -> Option<&mut Session> {
        let id = self.active.clone()?;
        self.get_mut(&id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| &session.id == id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|session| &session.id == id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.get(id).is_some()
    }

    /// Inserts `session` at the front and activates it, pruning the departing
    /// session if it has no messages.
    pub fn start_new(&mut self, session: Session) {
        self.prune_active_if_empty();
        self.active = Some(session.id.clone());
        self.sessions.insert(0, session);
    }

    /// Activates `target`. Returns `false` and leaves the store untouched when
    /// `target` is unknown.
    pub fn switch_to(&mut self, target: &SessionId) -> bool {
        if !self.contains(target) {
            tracing::warn!(session_id = %target, "ignoring switch to unknown session");
            return false;
        }
        if self.active.as_ref() == Some(target) {
            return true;
        }

        self.prune_active_if_empty();
        self.active = Some(target.clone());
        true
    }

    /// Removes a session. When it was active the first remaining session is
    /// activated, or none if the store is now empty.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let position = self.sessions.iter().position(|session| &session.id == id)?;
        let removed = self.sessions.remove(position);

        if self.active.as_ref() == Some(id) {
            self.active = self.sessions.first().map(|session| session.id.clone());
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.active = None;
    }

    fn prune_active_if_empty(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if self.get(&active).is_some_and(Session::is_empty) {
            tracing::debug!(session_id = %active, "pruning empty session");
            self.sessions.retain(|session| session.id != active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;

    fn session(id: &str) -> Session {
        Session::new(SessionId::from(id), GenerationSettings::default())
    }

    fn with_message(mut session: Session) -> Session {
        session
            .messages
            .push(Message::user(MessageId::from("1"), "hi", Vec::new()));
        session
    }

    #[test]
    fn new_sessions_go_first_and_become_active() {
        let mut store = SessionStore::new();
        store.start_new(with_message(session("a")));
        store.start_new(session("b"));

        let ids = store
            .sessions()
            .iter()
            .map(|session| session.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(store.active_id().map(SessionId::as_str), Some("b"));
        assert_eq!(store.active().unwrap().title, DEFAULT_SESSION_TITLE);
    }

    #[test]
    fn starting_a_new_chat_prunes_an_empty_active_session() {
        let mut store = SessionStore::new();
        store.start_new(session("a"));
        store.start_new(session("b"));

        assert_eq!(store.len(), 1);
        assert!(!store.contains(&SessionId::from("a")));
    }

    #[test]
    fn switching_away_prunes_only_empty_sessions() {
        let mut store = SessionStore::new();
        store.start_new(with_message(session("a")));
        store.start_new(session("b"));

        assert!(store.switch_to(&SessionId::from("a")));
        assert!(!store.contains(&SessionId::from("b")));

        store.start_new(with_message(session("c")));
        assert!(store.switch_to(&SessionId::from("a")));
        assert!(store.contains(&SessionId::from("c")));
    }

    #[test]
    fn switching_to_an_unknown_session_changes_nothing() {
        let mut store = SessionStore::new();
        store.start_new(session("a"));

        assert!(!store.switch_to(&SessionId::from("missing")));
        assert_eq!(store.active_id().map(SessionId::as_str), Some("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn switching_to_the_active_session_keeps_it_even_when_empty() {
        let mut store = SessionStore::new();
        store.start_new(session("a"));

        assert!(store.switch_to(&SessionId::from("a")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn removing_the_active_session_activates_the_first_remaining() {
        let mut store = SessionStore::new();
        store.start_new(with_message(session("a")));
        store.start_new(with_message(session("b")));
        store.start_new(with_message(session("c")));
        store.switch_to(&SessionId::from("b"));

        store.remove(&SessionId::from("b")).unwrap();
        assert_eq!(store.active_id().map(SessionId::as_str), Some("c"));

        store.remove(&SessionId::from("a")).unwrap();
        assert_eq!(store.active_id().map(SessionId::as_str), Some("c"));

        store.remove(&SessionId::from("c")).unwrap();
        assert!(store.active_id().is_none());
        assert!(store.remove(&SessionId::from("c")).is_none());
    }

    #[test]
    fn restore_falls_back_to_the_first_session() {
        let store = SessionStore::restore(
            vec![with_message(session("a")), with_message(session("b"))],
            Some(SessionId::from("gone")),
        );
        assert_eq!(store.active_id().map(SessionId::as_str), Some("a"));

        let store = SessionStore::restore(
            vec![with_message(session("a")), with_message(session("b"))],
            Some(SessionId::from("b")),
        );
        assert_eq!(store.active_id().map(SessionId::as_str), Some("b"));
    }

    #[test]
    fn restore_keeps_the_first_session_per_id() {
        let mut duplicate = with_message(session("a"));
        duplicate.title = "Later copy".to_string();
        let mut store = SessionStore::restore(
            vec![with_message(session("a")), with_message(session("b")), duplicate],
            Some(SessionId::from("a")),
        );

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&SessionId::from("a")).unwrap().title, DEFAULT_SESSION_TITLE);

        store.remove(&SessionId::from("a"));
        assert!(!store.contains(&SessionId::from("a")));
        assert_eq!(store.active_id().map(SessionId::as_str), Some("b"));
    }

    #[test]
    fn finds_the_reply_for_a_user_message() {
        let mut session = session("a");
        session
            .messages
            .push(Message::user(MessageId::from("1"), "hi", Vec::new()));
        session.messages.push(Message::bot_placeholder(
            MessageId::from("2"),
            MessageId::from("1"),
        ));

        assert_eq!(session.reply_position(&MessageId::from("1")), Some(1));
        assert_eq!(session.last_user_message().unwrap().text, "hi");
    }
}
