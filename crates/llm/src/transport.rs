use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::provider::ChatProvider;

/// Routing key for one streamed generation.
///
/// Every request gets a fresh value so events from a superseded generation can
/// be recognized and dropped by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget(pub u64);

impl StreamTarget {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Speaker role at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<ProviderAttachment>,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<ProviderAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub provider: ChatProvider,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        provider: ChatProvider,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            provider,
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Provider-agnostic stream payload.
///
/// A well-behaved worker sends zero or more `Delta`s followed by exactly one
/// terminal payload, and sends nothing once it has been cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
    Cancelled,
}

impl StreamEventPayload {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn new(target: StreamTarget, payload: StreamEventPayload) -> Self {
        Self { target, payload }
    }
}

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("missing API key for provider '{provider}'"))]
    MissingApiKey {
        stage: &'static str,
        provider: ChatProvider,
    },
    #[snafu(display("provider '{provider}' is not supported by this transport"))]
    UnsupportedProvider {
        stage: &'static str,
        provider: ChatProvider,
    },
    #[snafu(display("stream request {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Consumer side of one generation: incoming events plus the cancellation
/// signal. Dropping it cancels the generation.
#[derive(Debug)]
pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TransportStreamHandle {
    pub stream: ProviderEventStream,
    /// Producer future; the caller is responsible for spawning it.
    pub worker: TransportWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Waits for the next event. Cancel-safe.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Signals cancellation to the worker. Returns `false` if it was already
    /// signalled or the worker is gone.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .is_some_and(|cancel_tx| cancel_tx.send(()).is_ok())
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Turns a message history into a cancellable stream of text fragments.
pub trait StreamingTransport: Send + Sync {
    fn id(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> TransportResult<TransportStreamHandle>;
}

/// Builds the channel pair shared by a worker and its [`ProviderEventStream`].
///
/// Returned in worker order: event sender, consumer stream, cancel receiver.
pub fn event_channel(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
