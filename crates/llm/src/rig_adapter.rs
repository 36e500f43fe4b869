use std::collections::HashMap;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{ChatProvider, ProviderConfig};
use super::transport::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderMessage, Role, StreamEvent, StreamEventPayload, StreamRequest, StreamTarget,
    StreamingTransport, TransportError, TransportResult, TransportStreamHandle, TransportWorker,
    UnsupportedProviderSnafu, event_channel,
};

pub const RIG_TRANSPORT_ID: &str = "rig-openai-compatible";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Streaming transport over OpenAI-compatible chat endpoints.
///
/// Gemini is reached through its OpenAI-compatible endpoint. Dialogflow has no
/// such surface and is refused up front.
pub struct RigTransport {
    providers: HashMap<ChatProvider, ProviderConfig>,
}

impl RigTransport {
    pub fn new(providers: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|config| (config.provider, config))
                .collect(),
        }
    }

    pub fn configured_providers(&self) -> impl Iterator<Item = ChatProvider> + '_ {
        self.providers
            .values()
            .filter(|config| !config.api_key.is_empty())
            .map(|config| config.provider)
    }

    fn config_for(&self, provider: ChatProvider) -> TransportResult<ProviderConfig> {
        ensure!(
            provider != ChatProvider::Dialogflow,
            UnsupportedProviderSnafu {
                stage: "rig-config-for",
                provider,
            }
        );

        self.providers
            .get(&provider)
            .filter(|config| !config.api_key.is_empty())
            .cloned()
            .context(MissingApiKeySnafu {
                stage: "rig-config-for",
                provider,
            })
    }

    fn build_client(config: &ProviderConfig) -> TransportResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if let Some(base_url) = config.resolved_base_url() {
            builder = builder.base_url(base_url);
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(Self::content_with_attachments(message))),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    // Attachment payloads stay local; the model sees which files were attached.
    fn content_with_attachments(message: &ProviderMessage) -> String {
        if message.attachments.is_empty() {
            return message.content.clone();
        }

        let mut content = message.content.clone();
        for attachment in &message.attachments {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&format!(
                "[Attachment: {} ({})]",
                attachment.name, attachment.mime_type
            ));
        }
        content
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        // Rig takes a single preamble, so system-role messages are folded into
        // it after the session prompt.
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> TransportResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                target = ?request.target,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: request.target,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEvent>,
        target: StreamTarget,
        error: TransportError,
    ) {
        let _ = event_tx.send(StreamEvent::new(
            target,
            StreamEventPayload::Error(error.to_string()),
        ));
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => Some(
                StreamEvent::new(target, StreamEventPayload::Delta(text.text)),
            ),
            // Reasoning and tool traffic never reaches the transcript.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        // Opening the stream can take a full round trip; honour a cancel that
        // arrives in the meantime.
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "provider stream cancelled before it opened");
                return;
            }
            opened = Self::open_stream(&config, &request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider = %config.provider,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    // Stop the upstream Rig stream so provider IO ends promptly.
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = TransportError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // Cancelled and failed streams already ended on the consumer side.
        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEvent::new(target, StreamEventPayload::Done));
        }
    }
}

impl StreamingTransport for RigTransport {
    fn id(&self) -> &str {
        RIG_TRANSPORT_ID
    }

    fn stream_chat(&self, request: StreamRequest) -> TransportResult<TransportStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );
        let config = self.config_for(request.provider)?;

        let (event_tx, stream, cancel_rx) = event_channel(request.target);
        let worker: TransportWorker =
            Box::pin(Self::run_stream_worker(config, request, event_tx, cancel_rx));

        Ok(TransportStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ProviderAttachment;

    fn request(provider: ChatProvider) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(1),
            provider,
            provider.default_model(),
            vec![ProviderMessage::new(Role::User, "hi")],
        )
    }

    #[test]
    fn refuses_dialogflow() {
        let transport = RigTransport::new([ProviderConfig::new(
            ChatProvider::Dialogflow,
            "key",
            "",
        )]);

        let result = transport.stream_chat(request(ChatProvider::Dialogflow));
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn refuses_providers_without_a_key() {
        let transport = RigTransport::new([ProviderConfig::new(ChatProvider::OpenAI, "  ", "")]);

        assert!(matches!(
            transport.stream_chat(request(ChatProvider::OpenAI)),
            Err(TransportError::MissingApiKey { .. })
        ));
        assert!(matches!(
            transport.stream_chat(request(ChatProvider::Gemini)),
            Err(TransportError::MissingApiKey { .. })
        ));
        assert_eq!(transport.configured_providers().count(), 0);
    }

    #[test]
    fn refuses_empty_message_sets() {
        let transport = RigTransport::new([ProviderConfig::new(ChatProvider::OpenAI, "key", "")]);
        let mut empty = request(ChatProvider::OpenAI);
        empty.messages.clear();

        assert!(matches!(
            transport.stream_chat(empty),
            Err(TransportError::EmptyMessageSet { .. })
        ));
    }

    #[test]
    fn folds_system_messages_into_the_preamble() {
        let mut request = request(ChatProvider::OpenAI).with_preamble("Be brief.");
        request
            .messages
            .insert(0, ProviderMessage::new(Role::System, "Answer in French."));

        assert_eq!(
            RigTransport::merged_preamble(&request).as_deref(),
            Some("Be brief.\n\nAnswer in French.")
        );
    }

    #[test]
    fn names_attachments_in_user_content() {
        let message = ProviderMessage::new(Role::User, "see file").with_attachments(vec![
            ProviderAttachment {
                name: "notes.txt".into(),
                mime_type: "text/plain".into(),
                data: "data:text/plain;base64,aGk=".into(),
            },
        ]);

        assert_eq!(
            RigTransport::content_with_attachments(&message),
            "see file\n\n[Attachment: notes.txt (text/plain)]"
        );
    }
}
