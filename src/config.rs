//! Strongly-typed configuration for the agent.
//!
//! Configuration values can be constructed from defaults, loaded from
//! environment variables (with optional `.env` support), or adjusted
//! programmatically before handing them to the agent.

use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verbosity level for agent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Minimal,
    #[default]
    Medium,
    Detailed,
}

impl Verbosity {
    pub fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

/// Which provider wire shape to use for LLM calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    OpenAi,
}

impl ProviderKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(ProviderKind::Anthropic),
            "openai" => Some(ProviderKind::OpenAi),
            _ => None,
        }
    }
}

/// Configuration values for the browser-driving agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PilotConfig {
    /// Model identifier passed verbatim to the provider.
    pub model_name: String,
    pub provider: ProviderKind,
    pub model_api_key: Option<String>,
    /// Override of the provider's API base URL.
    pub model_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: u32,
    /// Extended-reasoning budget for providers that support it.
    pub thinking_budget_tokens: Option<u32>,

    /// Vision detector endpoint; `None` disables CV detection entirely.
    pub detector_endpoint: Option<String>,

    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub browser_args: Vec<String>,
    /// Attach to an already-running browser instead of launching one.
    pub cdp_url: Option<String>,

    pub max_steps: usize,
    /// Per-step timeout for the streaming run, in seconds.
    pub step_timeout_secs: Option<u64>,

    /// Directory holding the few-shot demonstration screenshots; missing
    /// files degrade to caption-only guidance.
    pub demo_images_dir: Option<PathBuf>,
    /// Soft context budget used by the token estimator.
    pub context_token_budget: usize,

    pub verbose: Verbosity,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            model_name: "claude-3-7-sonnet-latest".to_string(),
            provider: ProviderKind::default(),
            model_api_key: None,
            model_base_url: None,
            temperature: Some(0.0),
            max_output_tokens: 2048,
            thinking_budget_tokens: None,
            detector_endpoint: None,
            headless: true,
            chrome_executable: None,
            viewport_width: 1280,
            viewport_height: 900,
            browser_args: Vec::new(),
            cdp_url: None,
            max_steps: 100,
            step_timeout_secs: None,
            demo_images_dir: None,
            context_token_budget: 120_000,
            verbose: Verbosity::default(),
        }
    }
}

impl PilotConfig {
    /// Construct a configuration by reading relevant environment variables,
    /// after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        let mut config = PilotConfig::default();

        if let Some(value) = env_var("WEBPILOT_MODEL") {
            config.model_name = value;
        }

        if let Some(value) = env_var("WEBPILOT_PROVIDER") {
            config.provider = ProviderKind::parse(&value)
                .ok_or_else(|| ConfigError::invalid_enum("WEBPILOT_PROVIDER", value.clone()))?;
        }

        config.model_api_key = env_var("MODEL_API_KEY")
            .or_else(|| env_var("ANTHROPIC_API_KEY"))
            .or_else(|| env_var("OPENAI_API_KEY"));

        if let Some(value) = env_var("WEBPILOT_MODEL_BASE_URL") {
            config.model_base_url = Some(value);
        }

        if let Some(value) = env_var("WEBPILOT_DETECTOR_URL") {
            config.detector_endpoint = Some(value);
        }

        if let Some(value) = env_var("WEBPILOT_CHROME_BIN") {
            config.chrome_executable = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("WEBPILOT_CDP_URL") {
            config.cdp_url = Some(value);
        }

        if let Some(value) = env_var("WEBPILOT_HEADLESS") {
            config.headless = parse_bool("WEBPILOT_HEADLESS", &value)?;
        }

        if let Some(value) = env_var("WEBPILOT_MAX_STEPS") {
            config.max_steps = parse_usize("WEBPILOT_MAX_STEPS", &value)?;
        }

        if let Some(value) = env_var("WEBPILOT_STEP_TIMEOUT_SECS") {
            config.step_timeout_secs = Some(parse_u64("WEBPILOT_STEP_TIMEOUT_SECS", &value)?);
        }

        if let Some(value) = env_var("WEBPILOT_DEMO_IMAGES_DIR") {
            config.demo_images_dir = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("WEBPILOT_VERBOSE") {
            let parsed = parse_u8("WEBPILOT_VERBOSE", &value)?;
            config.verbose = Verbosity::from_u8(parsed)
                .ok_or_else(|| ConfigError::invalid_enum("WEBPILOT_VERBOSE", parsed.to_string()))?;
        }

        Ok(config)
    }
}

/// Errors surfaced while loading configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {variable}")]
    InvalidEnum { variable: &'static str, value: String },
    #[error("invalid integer '{value}' for {variable}: {source}")]
    InvalidInteger {
        variable: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid boolean '{value}' for {variable}")]
    InvalidBool { variable: &'static str, value: String },
}

impl ConfigError {
    fn invalid_enum(variable: &'static str, value: impl fmt::Display) -> Self {
        ConfigError::InvalidEnum {
            variable,
            value: value.to_string(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            variable,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(variable: &'static str, value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidInteger {
            variable,
            value: value.to_string(),
            source,
        })
}

fn parse_u64(variable: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidInteger {
            variable,
            value: value.to_string(),
            source,
        })
}

fn parse_usize(variable: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidInteger {
            variable,
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = PilotConfig::default();
        assert_eq!(config.max_steps, 100);
        assert!(config.headless);
        assert!(config.detector_endpoint.is_none());
        assert_eq!(config.provider, ProviderKind::Anthropic);
    }

    #[test]
    fn provider_parsing() {
        assert_eq!(ProviderKind::parse("OpenAI"), Some(ProviderKind::OpenAi));
        assert_eq!(
            ProviderKind::parse(" anthropic "),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(ProviderKind::parse("cohere"), None);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "ON").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = PilotConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: PilotConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.model_name, config.model_name);
        assert_eq!(back.max_steps, config.max_steps);
    }
}
