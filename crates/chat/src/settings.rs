use std::fmt;

use parley_llm::ChatProvider;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and friendly AI assistant.";

/// Sampling temperature presets. Persisted as the bare float.
///
/// Stored values snap to the nearest preset when read back; user input goes
/// through [`Temperature::parse`], which only accepts exact presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "f64")]
pub enum Temperature {
    Precise,
    #[default]
    Balanced,
    Creative,
}

#[derive(Debug, Snafu)]
#[snafu(display("temperature {value} is not one of the presets (0.5, 0.7, 1.0)"))]
pub struct InvalidTemperature {
    value: f64,
}

impl Temperature {
    pub const ALL: [Self; 3] = [Self::Precise, Self::Balanced, Self::Creative];

    pub fn value(self) -> f64 {
        match self {
            Self::Precise => 0.5,
            Self::Balanced => 0.7,
            Self::Creative => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Precise => "Precise",
            Self::Balanced => "Balanced",
            Self::Creative => "Creative",
        }
    }

    /// Closest preset to `value`. Non-finite values map to the default.
    pub fn nearest(value: f64) -> Self {
        if !value.is_finite() {
            return Self::default();
        }
        Self::ALL
            .into_iter()
            .min_by(|left, right| {
                (left.value() - value)
                    .abs()
                    .total_cmp(&(right.value() - value).abs())
            })
            .unwrap_or_default()
    }

    /// Accepts a preset label or its float value.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(preset) = Self::ALL
            .into_iter()
            .find(|preset| preset.label().eq_ignore_ascii_case(raw))
        {
            return Some(preset);
        }
        raw.parse::<f64>()
            .ok()
            .and_then(|value| Self::try_from(value).ok())
    }
}

impl<'de> Deserialize<'de> for Temperature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        let preset = Self::nearest(value);
        if (preset.value() - value).abs() >= 1e-9 {
            tracing::warn!(
                stored = value,
                preset = preset.value(),
                "stored temperature is not a preset, using the nearest one"
            );
        }
        Ok(preset)
    }
}

impl TryFrom<f64> for Temperature {
    type Error = InvalidTemperature;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|preset| (preset.value() - value).abs() < 1e-9)
            .context(InvalidTemperatureSnafu { value })
    }
}

impl From<Temperature> for f64 {
    fn from(value: Temperature) -> Self {
        value.value()
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.value())
    }
}

/// Per-session generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    pub provider: ChatProvider,
    pub model: String,
    pub temperature: Temperature,
    pub system_prompt: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        let provider = ChatProvider::default();
        Self {
            provider,
            model: provider.default_model().to_string(),
            temperature: Temperature::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl GenerationSettings {
    /// Shallow merge. Switching provider without naming a model picks the new
    /// provider's default model.
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(provider) = patch.provider
            && provider != self.provider
        {
            self.provider = provider;
            if patch.model.is_none() {
                self.model = provider.default_model().to_string();
            }
        }
        if let Some(model) = patch.model {
            self.model = model;
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature;
        }
        if let Some(system_prompt) = patch.system_prompt {
            self.system_prompt = system_prompt;
        }
    }

    pub fn normalized(mut self) -> Self {
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = self.provider.default_model().to_string();
        }
        self
    }
}

/// Partial update for [`GenerationSettings`]; `None` fields are left as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub provider: Option<ChatProvider>,
    pub model: Option<String>,
    pub temperature: Option<Temperature>,
    pub system_prompt: Option<String>,
}

impl SettingsPatch {
    pub fn provider(mut self, provider: ChatProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: Temperature) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_gemini_flash_preset() {
        let settings = GenerationSettings::default();

        assert_eq!(settings.provider, ChatProvider::Gemini);
        assert_eq!(settings.model, "gemini-1.5-flash");
        assert_eq!(settings.temperature.value(), 0.7);
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn provider_change_resets_the_model() {
        let mut settings = GenerationSettings::default();
        settings.apply(SettingsPatch::default().provider(ChatProvider::OpenAI));

        assert_eq!(settings.provider, ChatProvider::OpenAI);
        assert_eq!(settings.model, "gpt-4");
    }

    #[test]
    fn provider_change_keeps_an_explicit_model() {
        let mut settings = GenerationSettings::default();
        settings.apply(
            SettingsPatch::default()
                .provider(ChatProvider::OpenAI)
                .model("gpt-3.5-turbo"),
        );

        assert_eq!(settings.model, "gpt-3.5-turbo");
    }

    #[test]
    fn same_provider_keeps_the_model() {
        let mut settings = GenerationSettings::default();
        settings.apply(SettingsPatch::default().model("gemini-1.5-pro"));
        settings.apply(
            SettingsPatch::default()
                .provider(ChatProvider::Gemini)
                .temperature(Temperature::Creative),
        );

        assert_eq!(settings.model, "gemini-1.5-pro");
        assert_eq!(settings.temperature, Temperature::Creative);
    }

    #[test]
    fn temperature_round_trips_as_a_float() {
        let settings = GenerationSettings::default();
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["temperature"], 0.7);
        assert_eq!(value["systemPrompt"], DEFAULT_SYSTEM_PROMPT);

        let restored = serde_json::from_str::<Temperature>("1.0").unwrap();
        assert_eq!(restored, Temperature::Creative);
    }

    #[test]
    fn stored_values_snap_to_the_nearest_preset() {
        assert_eq!(
            serde_json::from_str::<Temperature>("0.9").unwrap(),
            Temperature::Creative
        );
        assert_eq!(
            serde_json::from_str::<Temperature>("0.2").unwrap(),
            Temperature::Precise
        );
        assert_eq!(
            serde_json::from_str::<Temperature>("7").unwrap(),
            Temperature::Creative
        );
        assert_eq!(Temperature::nearest(f64::NAN), Temperature::Balanced);
    }

    #[test]
    fn user_input_still_requires_an_exact_preset() {
        assert_eq!(Temperature::parse("0.9"), None);
        assert!(Temperature::try_from(0.9).is_err());
    }

    #[test]
    fn parses_labels_and_values() {
        assert_eq!(Temperature::parse("creative"), Some(Temperature::Creative));
        assert_eq!(Temperature::parse("0.5"), Some(Temperature::Precise));
        assert_eq!(Temperature::parse("2"), None);
    }
}
