//! In-process transport whose streams are driven by the test body, plus a
//! key-value store that can be switched into failing.

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parley_llm::{
    ChatProvider, ProviderEventStream, Role, StreamEvent, StreamEventPayload, StreamRequest,
    StreamingTransport, TransportError, TransportResult, TransportStreamHandle, event_channel,
};
use parley_storage::{KeyValueStore, MemoryStore, StorageError, StorageResult};
use tokio::sync::{mpsc, oneshot};

use crate::title::TITLE_PROMPT;

enum TitleScript {
    Reply(Vec<String>),
    Fail(String),
}

struct ScriptedCall {
    request: StreamRequest,
    events: Option<mpsc::UnboundedSender<StreamEvent>>,
    cancel_rx: oneshot::Receiver<()>,
    cancelled: bool,
}

pub(crate) struct ScriptedTransport {
    calls: Mutex<Vec<ScriptedCall>>,
    title_requests: Mutex<Vec<StreamRequest>>,
    title_script: TitleScript,
    refuse: bool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            title_requests: Mutex::new(Vec::new()),
            title_script: TitleScript::Reply(vec!["Scripted Title".to_string()]),
            refuse: false,
        }
    }

    pub(crate) fn with_title_reply<const N: usize>(mut self, fragments: [&str; N]) -> Self {
        self.title_script =
            TitleScript::Reply(fragments.iter().map(|fragment| fragment.to_string()).collect());
        self
    }

    pub(crate) fn with_title_failure(mut self, message: &str) -> Self {
        self.title_script = TitleScript::Fail(message.to_string());
        self
    }

    pub(crate) fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn request(&self, index: usize) -> StreamRequest {
        self.calls.lock().unwrap()[index].request.clone()
    }

    pub(crate) fn title_requests(&self) -> Vec<StreamRequest> {
        self.title_requests.lock().unwrap().clone()
    }

    /// Delivers `payload` on call `index`. Returns `false` once the consumer
    /// is gone.
    pub(crate) fn emit(&self, index: usize, payload: StreamEventPayload) -> bool {
        let target = self.request(index).target;
        self.emit_raw(index, StreamEvent::new(target, payload))
    }

    pub(crate) fn emit_raw(&self, index: usize, event: StreamEvent) -> bool {
        let calls = self.calls.lock().unwrap();
        calls[index]
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Ends call `index` without a terminal event.
    pub(crate) fn close(&self, index: usize) {
        self.calls.lock().unwrap()[index].events = None;
    }

    pub(crate) fn was_cancelled(&self, index: usize) -> bool {
        let mut calls = self.calls.lock().unwrap();
        let call = &mut calls[index];
        if !call.cancelled {
            call.cancelled = call.cancel_rx.try_recv().is_ok();
        }
        call.cancelled
    }

    fn title_stream(&self, request: StreamRequest) -> ProviderEventStream {
        let target = request.target;
        let (event_tx, stream, _cancel_rx) = event_channel(target);
        let payloads = match &self.title_script {
            TitleScript::Reply(fragments) => fragments
                .iter()
                .map(|fragment| StreamEventPayload::Delta(fragment.clone()))
                .chain([StreamEventPayload::Done])
                .collect::<Vec<_>>(),
            TitleScript::Fail(message) => vec![StreamEventPayload::Error(message.clone())],
        };
        for payload in payloads {
            let _ = event_tx.send(StreamEvent::new(target, payload));
        }
        self.title_requests.lock().unwrap().push(request);
        stream
    }
}

impl StreamingTransport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn stream_chat(&self, request: StreamRequest) -> TransportResult<TransportStreamHandle> {
        if self.refuse {
            return Err(TransportError::MissingApiKey {
                stage: "scripted-stream-chat",
                provider: ChatProvider::OpenAI,
            });
        }

        let is_title_request = request
            .messages
            .last()
            .is_some_and(|message| message.role == Role::User && message.content == TITLE_PROMPT);
        if is_title_request {
            return Ok(TransportStreamHandle {
                stream: self.title_stream(request),
                worker: Box::pin(async {}),
            });
        }

        let (event_tx, stream, cancel_rx) = event_channel(request.target);
        self.calls.lock().unwrap().push(ScriptedCall {
            request,
            events: Some(event_tx),
            cancel_rx,
            cancelled: false,
        });

        Ok(TransportStreamHandle {
            stream,
            worker: Box::pin(async {}),
        })
    }
}

/// Memory-backed store that counts successful writes and fails every call
/// while `failing` is set.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        let store = Self::new();
        store.set_failing(true);
        store
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, key: &str) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::WriteValue {
                stage: "flaky-store",
                key: key.to_string(),
                path: "memory".to_string(),
                source: io::Error::other("disk full"),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.check(key)?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check(key)?;
        self.inner.set(key, value)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check(key)?;
        self.inner.remove(key)
    }
}
