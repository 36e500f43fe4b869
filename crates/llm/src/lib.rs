mod provider;
mod rig_adapter;
mod transport;

pub use provider::{ChatProvider, GEMINI_OPENAI_COMPAT_ENDPOINT, ProviderConfig};
pub use rig_adapter::{RIG_TRANSPORT_ID, RigTransport};
pub use transport::{
    ProviderAttachment, ProviderEventStream, ProviderMessage, Role, StreamEvent,
    StreamEventPayload, StreamRequest, StreamTarget, StreamingTransport, TransportError,
    TransportResult, TransportStreamHandle, TransportWorker, event_channel,
};
