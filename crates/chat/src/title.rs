use parley_llm::{
    ProviderMessage, Role, StreamEventPayload, StreamRequest, StreamTarget, StreamingTransport,
    TransportError,
};
use snafu::{ResultExt, Snafu, ensure};

use super::message::{Message, provider_history};
use super::settings::GenerationSettings;

pub const TITLE_PROMPT: &str = "Generate a short, concise title (max 5 words) for this conversation based on the user's first message. Do not use quotes.";

const QUOTE_CHARACTERS: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TitleError {
    #[snafu(display("title request was refused on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("title stream failed on `{stage}`: {message}"))]
    Stream {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("title stream was cancelled on `{stage}`"))]
    Cancelled { stage: &'static str },
    #[snafu(display("title stream ended before completing on `{stage}`"))]
    StreamClosed { stage: &'static str },
    #[snafu(display("derived title was empty on `{stage}`"))]
    EmptyTitle { stage: &'static str },
}

pub type TitleResult<T> = Result<T, TitleError>;

/// Builds the one-shot request asking the backend to name a conversation.
pub fn title_request(
    target: StreamTarget,
    exchange: &[Message],
    settings: &GenerationSettings,
) -> StreamRequest {
    let mut messages = provider_history(exchange);
    messages.push(ProviderMessage::new(Role::User, TITLE_PROMPT));

    let request = StreamRequest::new(target, settings.provider, settings.model.clone(), messages)
        .with_temperature(settings.temperature.value());
    if settings.system_prompt.trim().is_empty() {
        request
    } else {
        request.with_preamble(settings.system_prompt.clone())
    }
}

/// Asks the transport for a short title for `exchange`.
///
/// Never retried; the caller decides whether to apply the result.
pub async fn derive_title(
    transport: &dyn StreamingTransport,
    target: StreamTarget,
    exchange: &[Message],
    settings: &GenerationSettings,
) -> TitleResult<String> {
    let handle = transport
        .stream_chat(title_request(target, exchange, settings))
        .context(TransportSnafu {
            stage: "title-open-stream",
        })?;
    let mut stream = handle.stream;
    tokio::spawn(handle.worker);

    let mut raw_title = String::new();
    loop {
        let Some(event) = stream.recv().await else {
            return StreamClosedSnafu {
                stage: "title-collect",
            }
            .fail();
        };
        match event.payload {
            StreamEventPayload::Delta(fragment) => raw_title.push_str(&fragment),
            StreamEventPayload::Done => break,
            StreamEventPayload::Error(message) => {
                return StreamSnafu {
                    stage: "title-collect",
                    message,
                }
                .fail();
            }
            StreamEventPayload::Cancelled => {
                return CancelledSnafu {
                    stage: "title-collect",
                }
                .fail();
            }
        }
    }

    let title = clean_title(&raw_title);
    ensure!(
        !title.is_empty(),
        EmptyTitleSnafu {
            stage: "title-clean",
        }
    );
    Ok(title)
}

/// Strips surrounding whitespace and quote characters.
pub fn clean_title(raw: &str) -> String {
    raw.trim()
        .trim_matches(|character: char| character.is_whitespace() || QUOTE_CHARACTERS.contains(&character))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::testing::ScriptedTransport;

    fn exchange() -> Vec<Message> {
        let mut reply = Message::bot_placeholder(MessageId::from("2"), MessageId::from("1"));
        reply.text = "Rust is a systems language.".into();
        vec![
            Message::user(MessageId::from("1"), "What is Rust?", Vec::new()),
            reply,
        ]
    }

    #[test]
    fn strips_quotes_and_whitespace() {
        assert_eq!(clean_title("  \"Rust Basics\"\n"), "Rust Basics");
        assert_eq!(clean_title("'Intro to Rust'"), "Intro to Rust");
        assert_eq!(clean_title("\u{201c}Smart quotes\u{201d}"), "Smart quotes");
        assert_eq!(clean_title("Don't panic"), "Don't panic");
        assert_eq!(clean_title(" \"\" "), "");
    }

    #[test]
    fn request_appends_the_title_instruction() {
        let request = title_request(StreamTarget::new(5), &exchange(), &GenerationSettings::default());

        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[2].role, Role::User);
        assert_eq!(request.messages[2].content, TITLE_PROMPT);
        assert_eq!(request.model_id, "gemini-1.5-flash");
        assert_eq!(request.preamble.as_deref(), Some(crate::settings::DEFAULT_SYSTEM_PROMPT));
    }

    #[test]
    fn blank_system_prompt_sends_no_preamble() {
        let settings = GenerationSettings {
            system_prompt: "   ".into(),
            ..GenerationSettings::default()
        };

        let request = title_request(StreamTarget::new(5), &exchange(), &settings);
        assert_eq!(request.preamble, None);
    }

    #[tokio::test]
    async fn concatenates_fragments_into_a_clean_title() {
        let transport = ScriptedTransport::new().with_title_reply(["\"Rust ", "Basics\""]);

        let title = derive_title(
            &transport,
            StreamTarget::new(1),
            &exchange(),
            &GenerationSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(title, "Rust Basics");
    }

    #[tokio::test]
    async fn blank_titles_are_errors() {
        let transport = ScriptedTransport::new().with_title_reply(["  ", "\"\""]);

        let result = derive_title(
            &transport,
            StreamTarget::new(1),
            &exchange(),
            &GenerationSettings::default(),
        )
        .await;

        assert!(matches!(result, Err(TitleError::EmptyTitle { .. })));
    }

    #[tokio::test]
    async fn stream_errors_are_reported() {
        let transport = ScriptedTransport::new().with_title_failure("quota exceeded");

        let result = derive_title(
            &transport,
            StreamTarget::new(1),
            &exchange(),
            &GenerationSettings::default(),
        )
        .await;

        assert!(matches!(result, Err(TitleError::Stream { message, .. }) if message == "quota exceeded"));
    }

    #[tokio::test]
    async fn refusals_are_reported() {
        let transport = ScriptedTransport::new().refusing();

        let result = derive_title(
            &transport,
            StreamTarget::new(1),
            &exchange(),
            &GenerationSettings::default(),
        )
        .await;

        assert!(matches!(result, Err(TitleError::Transport { .. })));
    }
}
