use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::completion::{CompletionModel, CompletionRequest};
use rig::message::AssistantContent;
use rig::providers::{anthropic, deepseek, gemini, groq, mistral, ollama, openai, openrouter};
use rig::OneOrMany;
use saguaro_config::{ModelRef, ProviderConfig, ProvidersConfig};

/// Providers understood by [`ProviderFactory`].
pub const PROVIDERS: &[&str] = &[
    "anthropic",
    "openai",
    "ollama",
    "openrouter",
    "deepseek",
    "groq",
    "gemini",
    "mistral",
];

/// A callable inference backend: one completion request in, the assistant's
/// content parts out.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<OneOrMany<AssistantContent>>;
}

#[allow(deprecated)]
#[async_trait]
impl CompletionBackend for CompletionModelHandle<'static> {
    async fn complete(&self, request: CompletionRequest) -> Result<OneOrMany<AssistantContent>> {
        let response = self
            .completion(request)
            .await
            .map_err(|e| anyhow::anyhow!("LLM completion error: {e}"))?;
        Ok(response.choice)
    }
}

/// A model identifier bound to the backend that serves it.
#[derive(Clone)]
pub struct ModelBinding {
    name: String,
    backend: Arc<dyn CompletionBackend>,
}

impl ModelBinding {
    pub fn new(name: impl Into<String>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    /// Model name, for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<OneOrMany<AssistantContent>> {
        self.backend.complete(request).await
    }
}

impl std::fmt::Debug for ModelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBinding")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Maps a logical model reference to a callable backend.
pub trait ModelFactory: Send + Sync {
    fn bind(&self, model: &ModelRef) -> Result<ModelBinding>;
}

/// Environment variable holding the API key for a provider, if it needs one.
pub fn api_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        _ => None,
    }
}

/// Resolve an API key from config, falling back to the provider's environment variable.
pub fn resolve_api_key(provider_cfg: Option<&ProviderConfig>, env_var: &str) -> Option<String> {
    provider_cfg
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

/// [`ModelFactory`] backed by rig's provider clients.
pub struct ProviderFactory {
    providers: ProvidersConfig,
}

impl ProviderFactory {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self { providers }
    }

    fn api_base(&self, provider: &str) -> Option<String> {
        self.providers
            .get(provider)
            .and_then(|c| c.api_base.clone())
            .filter(|b| !b.is_empty())
    }

    fn require_key(&self, provider: &str, label: &str) -> Result<String> {
        let env_var = api_key_env(provider).unwrap_or("API_KEY");
        resolve_api_key(self.providers.get(provider), env_var).ok_or_else(|| {
            anyhow::anyhow!(
                "{label} provider selected but no API key found. \
                 Set providers.{provider}.apiKey in the config or {env_var} env var."
            )
        })
    }

    #[allow(deprecated)]
    fn create_handle(&self, provider: &str, model_name: &str) -> Result<CompletionModelHandle<'static>> {
        match provider {
            "anthropic" => {
                let key = self.require_key(provider, "Anthropic")?;
                let client: anthropic::Client = anthropic::Client::builder()
                    .api_key(&key)
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
                let model = client.completion_model(model_name).with_prompt_caching();
                Ok(CompletionModelHandle::new(Arc::new(model)))
            }

            "openai" => {
                let key = self.require_key(provider, "OpenAI")?;
                let mut builder = openai::CompletionsClient::builder().api_key(&key);
                if let Some(ref base) = self.api_base(provider) {
                    builder = builder.base_url(base);
                    tracing::info!("Using OpenAI provider with custom base: {base}");
                }
                let client: openai::CompletionsClient = builder
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            "ollama" => {
                let mut builder = ollama::Client::builder().api_key(Nothing);
                if let Some(ref base) = self.api_base(provider) {
                    builder = builder.base_url(base);
                }
                let client: ollama::Client = builder
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            "openrouter" => {
                let key = self.require_key(provider, "OpenRouter")?;
                let client: openrouter::Client = openrouter::Client::new(&key)
                    .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            "deepseek" => {
                let key = self.require_key(provider, "DeepSeek")?;
                let client: deepseek::Client = deepseek::Client::new(&key)
                    .map_err(|e| anyhow::anyhow!("Failed to create DeepSeek client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            "groq" => {
                let key = self.require_key(provider, "Groq")?;
                let client: groq::Client = groq::Client::new(&key)
                    .map_err(|e| anyhow::anyhow!("Failed to create Groq client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            "gemini" => {
                let key = self.require_key(provider, "Gemini")?;
                let client: gemini::Client = gemini::Client::new(key)
                    .map_err(|e| anyhow::anyhow!("Failed to create Gemini client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            "mistral" => {
                let key = self.require_key(provider, "Mistral")?;
                let client: mistral::Client = mistral::Client::new(&key)
                    .map_err(|e| anyhow::anyhow!("Failed to create Mistral client: {e}"))?;
                Ok(CompletionModelHandle::new(Arc::new(
                    client.completion_model(model_name),
                )))
            }

            other => anyhow::bail!(
                "Unknown provider '{other}'. Valid providers: {}",
                PROVIDERS.join(", ")
            ),
        }
    }
}

impl ModelFactory for ProviderFactory {
    /// Errors clearly if the provider is unknown or has no API key.
    fn bind(&self, model: &ModelRef) -> Result<ModelBinding> {
        if model.provider.is_empty() {
            anyhow::bail!(
                "No provider configured. Valid providers: {}",
                PROVIDERS.join(", ")
            );
        }
        if model.model.is_empty() {
            anyhow::bail!("No model configured for provider '{}'.", model.provider);
        }

        let handle = self.create_handle(&model.provider, &model.model)?;
        tracing::info!("Bound model {model}");
        Ok(ModelBinding::new(model.model.clone(), Arc::new(handle)))
    }
}
