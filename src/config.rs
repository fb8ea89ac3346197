//! Process-wide configuration: the provider wire dialect and per-deployment
//! tunables (`Config`), loaded once at startup and mutated only through
//! `UpdateConfig`.
//!
//! ## Environment Variables
//!
//! - `AGENT_CORE_API_KEY`: overrides the configured API key
//! - `AGENT_CORE_BASE_URL`: overrides the configured base URL
//! - `AGENT_CORE_MODEL`: overrides the configured model

use std::env;
use std::str::FromStr;

// ============================================================================
// DIALECT
// ============================================================================

/// Which wire protocol the Provider Client should speak to the configured
/// `base-url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// OpenAI-style `/chat/completions` with SSE deltas.
    #[default]
    OpenAI,
    /// Gemini-style `generateContent` / `streamGenerateContent`.
    Gemini,
    /// Native Ollama `/api/chat`.
    Ollama,
}

impl Dialect {
    /// The default API path suffix for this dialect, relative to `base-url`.
    ///
    /// Gemini's client reads a full response body rather than an SSE/NDJSON
    /// stream (see [`crate::provider::gemini`]), so this names the
    /// non-streaming `generateContent` endpoint, not `streamGenerateContent`.
    pub fn default_chat_path(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "/chat/completions",
            Dialect::Gemini => ":generateContent",
            Dialect::Ollama => "/api/chat",
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "open-ai" | "open_ai" => Ok(Dialect::OpenAI),
            "gemini" | "google" => Ok(Dialect::Gemini),
            "ollama" => Ok(Dialect::Ollama),
            _ => Err(format!("unknown provider dialect: {s}")),
        }
    }
}

// ============================================================================
// DETAIL LEVEL
// ============================================================================

/// How much spreadsheet context detail is embedded in the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailLevel {
    Minimal,
    #[default]
    Standard,
    Verbose,
}

impl FromStr for DetailLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minimal" => Ok(DetailLevel::Minimal),
            "standard" => Ok(DetailLevel::Standard),
            "verbose" => Ok(DetailLevel::Verbose),
            _ => Err(format!("unknown detail level: {s}")),
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub model: String,
    pub tool_model: Option<String>,
    pub base_url: String,
    pub max_rows_context: usize,
    pub max_context_chars: usize,
    pub max_rows_preview: usize,
    pub include_headers: bool,
    pub detail_level: DetailLevel,
    pub custom_prompt: Option<String>,
    pub language: String,
    pub provider: Dialect,
    pub ask_before_apply: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Fluent, validating builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    api_key: Option<String>,
    model: Option<String>,
    tool_model: Option<String>,
    base_url: Option<String>,
    max_rows_context: Option<usize>,
    max_context_chars: Option<usize>,
    max_rows_preview: Option<usize>,
    include_headers: Option<bool>,
    detail_level: Option<DetailLevel>,
    custom_prompt: Option<String>,
    language: Option<String>,
    provider: Option<Dialect>,
    ask_before_apply: Option<bool>,
}

impl ConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn tool_model(mut self, model: impl Into<String>) -> Self {
        self.tool_model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn max_rows_context(mut self, n: usize) -> Self {
        self.max_rows_context = Some(n);
        self
    }

    pub fn max_context_chars(mut self, n: usize) -> Self {
        self.max_context_chars = Some(n);
        self
    }

    pub fn max_rows_preview(mut self, n: usize) -> Self {
        self.max_rows_preview = Some(n);
        self
    }

    pub fn include_headers(mut self, include: bool) -> Self {
        self.include_headers = Some(include);
        self
    }

    pub fn detail_level(mut self, level: DetailLevel) -> Self {
        self.detail_level = Some(level);
        self
    }

    pub fn custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.language = Some(lang.into());
        self
    }

    pub fn provider(mut self, dialect: Dialect) -> Self {
        self.provider = Some(dialect);
        self
    }

    pub fn ask_before_apply(mut self, ask: bool) -> Self {
        self.ask_before_apply = Some(ask);
        self
    }

    /// Build the config, applying environment-variable overrides and
    /// defaults, and validating required fields.
    pub fn build(self) -> crate::Result<Config> {
        let api_key = env::var("AGENT_CORE_API_KEY")
            .ok()
            .or(self.api_key)
            .ok_or_else(|| crate::Error::config("api_key is required"))?;

        if api_key.trim().is_empty() {
            return Err(crate::Error::config("api_key must not be empty"));
        }

        let model = env::var("AGENT_CORE_MODEL")
            .ok()
            .or(self.model)
            .ok_or_else(|| crate::Error::config("model is required"))?;

        let base_url = env::var("AGENT_CORE_BASE_URL")
            .ok()
            .or(self.base_url)
            .ok_or_else(|| crate::Error::config("base_url is required"))?;

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(crate::Error::config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }

        let max_context_chars = self.max_context_chars.unwrap_or(90_000);
        if max_context_chars == 0 {
            return Err(crate::Error::config("max_context_chars must be > 0"));
        }

        Ok(Config {
            api_key,
            model,
            tool_model: self.tool_model,
            base_url,
            max_rows_context: self.max_rows_context.unwrap_or(500),
            max_context_chars,
            max_rows_preview: self.max_rows_preview.unwrap_or(20),
            include_headers: self.include_headers.unwrap_or(true),
            detail_level: self.detail_level.unwrap_or_default(),
            custom_prompt: self.custom_prompt,
            language: self.language.unwrap_or_else(|| "en".to_string()),
            provider: self.provider.unwrap_or_default(),
            ask_before_apply: self.ask_before_apply.unwrap_or(true),
        })
    }
}
