use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use crate::error::{FinsightError, Result};
use crate::schema::SourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Groq,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Groq => write!(f, "groq"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = FinsightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "groq" => Ok(ProviderKind::Groq),
            other => Err(FinsightError::Configuration(format!(
                "unknown LLM provider '{other}', expected openai, anthropic, or groq"
            ))),
        }
    }
}

/// Priority map used to pick a winner when two sources cover the same
/// period. Higher wins; exposed as configuration per deployment.
#[derive(Debug, Clone)]
pub struct SourcePriority(HashMap<SourceType, u8>);

impl Default for SourcePriority {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert(SourceType::QuickBooks, 2);
        map.insert(SourceType::Rootfi, 1);
        Self(map)
    }
}

impl SourcePriority {
    pub fn of(&self, source: SourceType) -> u8 {
        self.0.get(&source).copied().unwrap_or(0)
    }

    /// Parse `quickbooks=2,rootfi=1` style overrides.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut priority = Self::default();
        for pair in spec.split(',').filter(|p| !p.trim().is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                FinsightError::Configuration(format!(
                    "invalid source priority entry '{pair}', expected name=number"
                ))
            })?;
            let source: SourceType = name
                .trim()
                .parse()
                .map_err(|_| FinsightError::Configuration(format!("unknown source '{name}'")))?;
            let rank: u8 = value.trim().parse().map_err(|_| {
                FinsightError::Configuration(format!("invalid priority '{value}' for '{name}'"))
            })?;
            priority.0.insert(source, rank);
        }
        Ok(priority)
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_s: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub workers: usize,
    pub retry_max: u32,
    pub backoff_base_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub db_pool_size: u32,
    pub db_timeout_s: u64,
    pub host: String,
    pub port: u16,
    pub llm: LlmConfig,
    pub ingest: IngestConfig,
    pub conversation_ttl_s: u64,
    pub conversation_max_messages: usize,
    pub insight_cache_ttl_s: u64,
    pub tool_timeout_s: u64,
    pub query_timeout_s: u64,
    pub source_priority: SourcePriority,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            FinsightError::Configuration(format!("invalid value '{raw}' for {key}"))
        }),
        Err(_) => Ok(default),
    }
}

fn default_model(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::OpenAi => "gpt-4o-mini",
        ProviderKind::Anthropic => "claude-3-5-haiku-20241022",
        ProviderKind::Groq => "openai/gpt-oss-20b",
    }
}

impl Config {
    /// Load configuration from the environment, failing fast on anything
    /// malformed. Missing values fall back to documented defaults.
    pub fn from_env() -> Result<Self> {
        let provider: ProviderKind = env_or("FINSIGHT_LLM_PROVIDER", ProviderKind::Groq)?;

        let llm = LlmConfig {
            provider,
            api_key: env::var("FINSIGHT_LLM_API_KEY").unwrap_or_default(),
            model: env::var("FINSIGHT_LLM_MODEL")
                .unwrap_or_else(|_| default_model(provider).to_string()),
            temperature: env_or("FINSIGHT_LLM_TEMPERATURE", 0.1)?,
            max_tokens: env_or("FINSIGHT_LLM_MAX_TOKENS", 4000)?,
            timeout_s: env_or("FINSIGHT_LLM_TIMEOUT", 30)?,
            max_retries: env_or("FINSIGHT_LLM_MAX_RETRIES", 3)?,
        };

        let ingest = IngestConfig {
            workers: env_or("FINSIGHT_INGEST_WORKERS", 4)?,
            retry_max: env_or("FINSIGHT_INGEST_RETRY_MAX", 5)?,
            backoff_base_ms: env_or("FINSIGHT_INGEST_BACKOFF_BASE_MS", 100)?,
        };

        let source_priority = match env::var("FINSIGHT_SOURCE_PRIORITY") {
            Ok(spec) => SourcePriority::parse(&spec)?,
            Err(_) => SourcePriority::default(),
        };

        let config = Self {
            db_url: env::var("FINSIGHT_DB_URL")
                .unwrap_or_else(|_| "sqlite://finsight.db?mode=rwc".to_string()),
            db_pool_size: env_or("FINSIGHT_DB_POOL_SIZE", 20)?,
            db_timeout_s: env_or("FINSIGHT_DB_TIMEOUT", 5)?,
            host: env::var("FINSIGHT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("FINSIGHT_PORT", 8080)?,
            llm,
            ingest,
            conversation_ttl_s: env_or("FINSIGHT_CONVERSATION_TTL_S", 3600)?,
            conversation_max_messages: env_or("FINSIGHT_CONVERSATION_MAX_MESSAGES", 50)?,
            insight_cache_ttl_s: env_or("FINSIGHT_INSIGHT_CACHE_TTL_S", 3600)?,
            tool_timeout_s: env_or("FINSIGHT_TOOL_TIMEOUT", 10)?,
            query_timeout_s: env_or("FINSIGHT_QUERY_TIMEOUT", 60)?,
            source_priority,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_pool_size == 0 {
            return Err(FinsightError::Configuration(
                "db_pool_size must be at least 1".to_string(),
            ));
        }
        if self.ingest.workers == 0 {
            return Err(FinsightError::Configuration(
                "ingest_workers must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(FinsightError::Configuration(format!(
                "llm_temperature {} out of range 0.0..=2.0",
                self.llm.temperature
            )));
        }
        Ok(())
    }

    /// Whether the configured provider can actually be called.
    pub fn llm_configured(&self) -> bool {
        !self.llm.api_key.is_empty()
    }
}
