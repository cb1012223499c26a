use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const OPENAI: &str = "openai";
pub const AZURE: &str = "azure";
pub const ANTHROPIC: &str = "anthropic";
pub const OLLAMA: &str = "ollama";
pub const GITHUB: &str = "github";

pub const PROVIDERS: &[&str] = &[OPENAI, AZURE, ANTHROPIC, OLLAMA, GITHUB];

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const GITHUB_MODELS_BASE: &str = "https://models.inference.ai.azure.com";
const OLLAMA_DEFAULT_HOST: &str = "http://127.0.0.1:11434";
const PLACEHOLDER_API_KEY: &str = "<your token>";

/// Connection details for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageModelConfiguration {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub api_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// What `server.env` reports per provider. Never carries a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedProvider {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

/// `provider:model[:tag]`; a bare name is an OpenAI model.
pub fn parse_model_identifier(id: &str) -> ModelRef {
    match id.split_once(':') {
        Some((provider, model)) if !provider.is_empty() => {
            ModelRef { provider: provider.to_string(), model: model.to_string() }
        }
        _ => ModelRef { provider: OPENAI.to_string(), model: id.to_string() },
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unknown model provider '{0}'")]
    UnknownProvider(String),
    #[error("{var} not configured")]
    NotConfigured { provider: String, var: String },
    #[error("{provider} base url '{base}' must be an http(s) url")]
    InvalidBase { provider: String, base: String },
}

/// Resolves provider credentials from a snapshot of environment variables.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    vars: HashMap<String, String>,
}

impl ProviderCatalog {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty() && *v != PLACEHOLDER_API_KEY)
    }

    fn first_var(&self, names: &[&'static str]) -> Option<(&'static str, &str)> {
        names.iter().find_map(|name| self.var(name).map(|v| (*name, v)))
    }

    fn required(&self, provider: &str, name: &str) -> Result<String, ProviderError> {
        self.var(name).map(str::to_string).ok_or_else(|| ProviderError::NotConfigured {
            provider: provider.to_string(),
            var: name.to_string(),
        })
    }

    pub fn resolve(&self, provider: &str, model: &str) -> Result<LanguageModelConfiguration, ProviderError> {
        let mut cfg = LanguageModelConfiguration {
            provider: provider.to_string(),
            model: model.to_string(),
            base: None,
            token: None,
            source: None,
            api_type: None,
            version: None,
        };
        match provider {
            OPENAI => {
                cfg.token = Some(self.required(provider, "OPENAI_API_KEY")?);
                cfg.base = Some(self.var("OPENAI_API_BASE").unwrap_or(OPENAI_API_BASE).to_string());
                cfg.api_type = Some("openai".to_string());
                cfg.source = Some("env: OPENAI_API_...".to_string());
            }
            AZURE => {
                let (_, token) = self
                    .first_var(&["AZURE_OPENAI_API_KEY", "AZURE_API_KEY"])
                    .ok_or_else(|| ProviderError::NotConfigured {
                        provider: provider.to_string(),
                        var: "AZURE_OPENAI_API_KEY".to_string(),
                    })?;
                cfg.token = Some(token.to_string());
                let (_, base) = self
                    .first_var(&["AZURE_OPENAI_ENDPOINT", "AZURE_OPENAI_API_BASE", "AZURE_API_BASE"])
                    .ok_or_else(|| ProviderError::NotConfigured {
                        provider: provider.to_string(),
                        var: "AZURE_OPENAI_ENDPOINT".to_string(),
                    })?;
                cfg.base = Some(format!("{}/openai/deployments", base.trim_end_matches('/')));
                cfg.version = self.var("AZURE_OPENAI_API_VERSION").map(str::to_string);
                cfg.api_type = Some("azure".to_string());
                cfg.source = Some("env: AZURE_OPENAI_...".to_string());
            }
            ANTHROPIC => {
                cfg.token = Some(self.required(provider, "ANTHROPIC_API_KEY")?);
                cfg.base = Some(self.var("ANTHROPIC_API_BASE").unwrap_or(ANTHROPIC_API_BASE).to_string());
                cfg.version = self.var("ANTHROPIC_API_VERSION").map(str::to_string);
                cfg.source = Some("env: ANTHROPIC_API_...".to_string());
            }
            OLLAMA => {
                let host = self.var("OLLAMA_HOST").unwrap_or(OLLAMA_DEFAULT_HOST);
                let host = if host.contains("://") { host.to_string() } else { format!("http://{host}") };
                cfg.base = Some(format!("{}/v1", host.trim_end_matches('/')));
                cfg.token = Some(OLLAMA.to_string());
                cfg.api_type = Some("openai".to_string());
                cfg.source = Some("env: OLLAMA_HOST".to_string());
            }
            GITHUB => {
                let (var, token) = self
                    .first_var(&["GITHUB_MODELS_TOKEN", "GITHUB_TOKEN"])
                    .ok_or_else(|| ProviderError::NotConfigured {
                        provider: provider.to_string(),
                        var: "GITHUB_TOKEN".to_string(),
                    })?;
                cfg.token = Some(token.to_string());
                cfg.base = Some(GITHUB_MODELS_BASE.to_string());
                cfg.api_type = Some("openai".to_string());
                cfg.source = Some(format!("env: {var}"));
            }
            other => return Err(ProviderError::UnknownProvider(other.to_string())),
        }
        if let Some(base) = cfg.base.as_deref() {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return Err(ProviderError::InvalidBase { provider: provider.to_string(), base: base.to_string() });
            }
        }
        Ok(cfg)
    }

    /// Connection info for a model id. The secret is stripped unless
    /// `include_token` is set.
    pub fn model_configuration(
        &self,
        model_id: &str,
        include_token: bool,
    ) -> Result<LanguageModelConfiguration, ProviderError> {
        let ModelRef { provider, model } = parse_model_identifier(model_id);
        let mut cfg = self.resolve(&provider, &model)?;
        if !include_token {
            cfg.token = None;
        }
        Ok(cfg)
    }

    pub fn resolve_all(&self) -> Vec<ResolvedProvider> {
        PROVIDERS
            .iter()
            .map(|provider| match self.resolve(provider, "*") {
                Ok(cfg) => ResolvedProvider {
                    provider: cfg.provider,
                    base: cfg.base,
                    source: cfg.source,
                    error: None,
                },
                Err(e) => ResolvedProvider {
                    provider: provider.to_string(),
                    base: None,
                    source: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }
}
