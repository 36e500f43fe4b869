use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend family a session is configured to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatProvider {
    OpenAI,
    #[default]
    Gemini,
    Dialogflow,
}

const OPENAI_MODELS: &[&str] = &["gpt-4", "gpt-3.5-turbo"];
const GEMINI_MODELS: &[&str] = &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-1.5-flash-latest"];
const DIALOGFLOW_MODELS: &[&str] = &["dialogflow-es", "dialogflow-cx"];

pub const GEMINI_OPENAI_COMPAT_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/";

impl ChatProvider {
    pub const ALL: [Self; 3] = [Self::OpenAI, Self::Gemini, Self::Dialogflow];

    pub fn label(self) -> &'static str {
        match self {
            Self::OpenAI => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Dialogflow => "Dialogflow",
        }
    }

    /// Models offered for this provider, first entry is the default.
    pub fn available_models(self) -> &'static [&'static str] {
        match self {
            Self::OpenAI => OPENAI_MODELS,
            Self::Gemini => GEMINI_MODELS,
            Self::Dialogflow => DIALOGFLOW_MODELS,
        }
    }

    pub fn default_model(self) -> &'static str {
        self.available_models()[0]
    }

    /// Case-insensitive lookup by label.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|provider| provider.label().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for ChatProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Credentials and endpoint for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ChatProvider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
}

impl ProviderConfig {
    pub fn new(
        provider: ChatProvider,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
        }
    }

    /// Endpoint to use, falling back to the provider's OpenAI-compatible
    /// default when none is configured.
    pub fn resolved_base_url(&self) -> Option<&str> {
        if !self.base_url.trim().is_empty() {
            return Some(self.base_url.trim());
        }
        match self.provider {
            ChatProvider::Gemini => Some(GEMINI_OPENAI_COMPAT_ENDPOINT),
            ChatProvider::OpenAI | ChatProvider::Dialogflow => None,
        }
    }
}
