use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub kernel: KernelConfig,
    pub models: ModelsConfig,
    pub providers: ProvidersConfig,
    pub senses: SensesConfig,
}

/// Settings for the proactive loop and the session it runs in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelConfig {
    /// Application namespace shared by the cortex session and every neocortex run.
    pub app_name: String,
    pub user_id: String,
    /// Fixed id of the single session reused across all ticks.
    pub session_id: String,
    pub memory_path: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_iterations: u32,
    /// Number of past session messages replayed to the cortex on each tick.
    pub history_window: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            app_name: "saguaro_os".into(),
            user_id: "default_user".into(),
            session_id: "saguaro_session".into(),
            memory_path: "~/.saguaro/memory.md".into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_tool_iterations: 10,
            history_window: 20,
        }
    }
}

/// The two model tiers: cheap per-tick cortex, expensive on-demand neocortex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsConfig {
    pub cortex: ModelRef,
    pub neocortex: ModelRef,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cortex: ModelRef::new("gemini", "gemini-2.5-flash-lite"),
            neocortex: ModelRef::new("gemini", "gemini-2.5-pro"),
        }
    }
}

/// Reference to a provider + model combination.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse a `provider/model` identifier. A bare model name keeps
    /// `default_provider`. Only the first slash splits, so OpenRouter-style
    /// names such as `openrouter/meta-llama/llama-3` keep their tail intact.
    pub fn parse(identifier: &str, default_provider: &str) -> Self {
        match identifier.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Self::new(provider, model)
            }
            _ => Self::new(default_provider, identifier),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub ollama: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub deepseek: Option<ProviderConfig>,
    pub groq: Option<ProviderConfig>,
    pub gemini: Option<ProviderConfig>,
    pub mistral: Option<ProviderConfig>,
}

impl ProvidersConfig {
    /// Look up a provider's settings by name.
    pub fn get(&self, provider: &str) -> Option<&ProviderConfig> {
        match provider {
            "ollama" => self.ollama.as_ref(),
            "anthropic" => self.anthropic.as_ref(),
            "openai" => self.openai.as_ref(),
            "openrouter" => self.openrouter.as_ref(),
            "deepseek" => self.deepseek.as_ref(),
            "groq" => self.groq.as_ref(),
            "gemini" => self.gemini.as_ref(),
            "mistral" => self.mistral.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

/// Settings for the built-in context sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SensesConfig {
    /// Polling interval of the file snapshot sensor.
    pub interval_secs: f64,
    /// File kept up to date by an external capture tool (screenshot, OCR dump).
    pub watch_path: Option<String>,
}

impl Default for SensesConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            watch_path: None,
        }
    }
}
