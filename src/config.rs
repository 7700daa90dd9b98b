//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Engine and server configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    pub provider: LlmBackend,
    pub model: String,
    /// `None` runs with canned fallback replies only.
    pub api_key: Option<SecretString>,
    pub retrieval_enabled: bool,
    /// Snippets kept per turn after ranking.
    pub retrieval_limit: usize,
    pub generator_timeout: Duration,
    /// Delay between a Deep Think request and its `due_at`.
    pub deepthink_delay: Duration,
    /// How often the sweeper looks for due Deep Think jobs.
    pub deepthink_sweep_interval: Duration,
    /// Optional JSON file replacing the built-in governance copy.
    pub governance_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/reflect-flow.db"),
            port: 8080,
            provider: LlmBackend::Anthropic,
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: None,
            retrieval_enabled: true,
            retrieval_limit: 8,
            generator_timeout: Duration::from_secs(20),
            deepthink_delay: Duration::from_secs(24 * 60 * 60), // 24 hours
            deepthink_sweep_interval: Duration::from_secs(300), // 5 minutes
            governance_path: None,
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults for
    /// anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match get("REFLECT_FLOW_PROVIDER") {
            Some(v) => v.parse()?,
            None => defaults.provider,
        };
        let model = get("REFLECT_FLOW_MODEL").unwrap_or_else(|| match provider {
            LlmBackend::Anthropic => defaults.model.clone(),
            LlmBackend::OpenAi => "gpt-4o".to_string(),
        });
        let key_var = match provider {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };

        Ok(Self {
            db_path: get("REFLECT_FLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: parse_or("REFLECT_FLOW_PORT", get("REFLECT_FLOW_PORT"), defaults.port)?,
            provider,
            model,
            api_key: get(key_var).map(SecretString::from),
            retrieval_enabled: parse_bool_or(
                "REFLECT_FLOW_RETRIEVAL_ENABLED",
                get("REFLECT_FLOW_RETRIEVAL_ENABLED"),
                defaults.retrieval_enabled,
            )?,
            retrieval_limit: parse_or(
                "REFLECT_FLOW_RETRIEVAL_LIMIT",
                get("REFLECT_FLOW_RETRIEVAL_LIMIT"),
                defaults.retrieval_limit,
            )?,
            generator_timeout: Duration::from_secs(parse_or(
                "REFLECT_FLOW_GENERATOR_TIMEOUT_SECS",
                get("REFLECT_FLOW_GENERATOR_TIMEOUT_SECS"),
                defaults.generator_timeout.as_secs(),
            )?),
            deepthink_delay: Duration::from_secs(
                parse_or(
                    "REFLECT_FLOW_DEEPTHINK_DELAY_HOURS",
                    get("REFLECT_FLOW_DEEPTHINK_DELAY_HOURS"),
                    24u64,
                )?
                .saturating_mul(3600),
            ),
            deepthink_sweep_interval: Duration::from_secs(parse_or(
                "REFLECT_FLOW_DEEPTHINK_SWEEP_SECS",
                get("REFLECT_FLOW_DEEPTHINK_SWEEP_SECS"),
                defaults.deepthink_sweep_interval.as_secs(),
            )?),
            governance_path: get("REFLECT_FLOW_GOVERNANCE_PATH").map(PathBuf::from),
        })
    }

    /// Provider settings, if an API key is configured.
    pub fn llm_config(&self) -> Option<LlmConfig> {
        self.api_key.as_ref().map(|key| LlmConfig {
            backend: self.provider,
            api_key: key.clone(),
            model: self.model.clone(),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or(key: &str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.provider, LlmBackend::Anthropic);
        assert!(config.api_key.is_none());
        assert!(config.llm_config().is_none());
        assert_eq!(config.deepthink_delay, Duration::from_secs(86_400));
        assert!(config.retrieval_enabled);
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("REFLECT_FLOW_PROVIDER", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
            ("REFLECT_FLOW_PORT", "9090"),
            ("REFLECT_FLOW_RETRIEVAL_ENABLED", "false"),
            ("REFLECT_FLOW_RETRIEVAL_LIMIT", "3"),
            ("REFLECT_FLOW_DEEPTHINK_DELAY_HOURS", "2"),
            ("REFLECT_FLOW_GOVERNANCE_PATH", "/etc/reflect/governance.json"),
        ]))
        .unwrap();
        assert_eq!(config.provider, LlmBackend::OpenAi);
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.port, 9090);
        assert!(!config.retrieval_enabled);
        assert_eq!(config.retrieval_limit, 3);
        assert_eq!(config.deepthink_delay, Duration::from_secs(7_200));
        assert!(config.governance_path.is_some());
        assert_eq!(config.llm_config().unwrap().backend, LlmBackend::OpenAi);
    }

    #[test]
    fn anthropic_key_ignored_for_openai() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("REFLECT_FLOW_PROVIDER", "openai"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
        ]))
        .unwrap();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = EngineConfig::from_lookup(lookup(&[("REFLECT_FLOW_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "REFLECT_FLOW_PORT"));

        let err = EngineConfig::from_lookup(lookup(&[("REFLECT_FLOW_RETRIEVAL_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = EngineConfig::from_lookup(lookup(&[("REFLECT_FLOW_PROVIDER", "mistral")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
