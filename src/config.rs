use std::{env, fmt::Display, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Stg,
    Prod,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "stg" => Ok(Self::Stg),
            "prod" => Ok(Self::Prod),
            other => Err(anyhow!("unknown APP_ENV '{}', expected dev, stg or prod", other)),
        }
    }
}

/// Whether the connection that triggered a room broadcast receives it too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastPolicy {
    IncludeSender,
    ExcludeSender,
}

impl BroadcastPolicy {
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Prod => Self::ExcludeSender,
            Environment::Dev | Environment::Stg => Self::IncludeSender,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub optimizer_model: String,
    pub optimizer_instructions: String,
    pub optimizer_temperature: f32,
    pub re_ranking_model: String,
    pub re_ranking_instructions: String,
    pub re_ranking_prompt: String,
    pub re_ranking_temperature: f32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub environment: Environment,
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: Option<String>,
    pub cache_timeout: Duration,
    pub jwt_secret: String,
    pub broadcast_policy: BroadcastPolicy,
    pub online_ttl: Duration,
    pub attachment_signer_url: Option<String>,
    pub attachment_url_ttl: Duration,
    pub openai: Option<OpenAiConfig>,
    pub semantic_search_enabled: bool,
    pub message_embedding_enabled: bool,
    pub scheduler_workers: usize,
    pub scheduler_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine, the process environment may carry everything.
        let _ = dotenvy::dotenv();

        let environment: Environment = parse_or("APP_ENV", Environment::Dev)?;
        let broadcast_policy = match optional("BROADCAST_INCLUDE_SENDER") {
            Some(raw) => {
                if parse_bool("BROADCAST_INCLUDE_SENDER", &raw)? {
                    BroadcastPolicy::IncludeSender
                } else {
                    BroadcastPolicy::ExcludeSender
                }
            }
            None => BroadcastPolicy::for_environment(environment),
        };

        Ok(Self {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            environment,
            database_url: required("DATABASE_URL")?,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 20)?,
            redis_url: optional("REDIS_URL"),
            cache_timeout: Duration::from_millis(parse_or("CACHE_TIMEOUT_MS", 500)?),
            jwt_secret: required("JWT_SECRET")?,
            broadcast_policy,
            online_ttl: Duration::from_secs(parse_or("ONLINE_TTL_SECS", 30)?),
            attachment_signer_url: optional("ATTACHMENT_SIGNER_URL"),
            attachment_url_ttl: Duration::from_secs(parse_or("ATTACHMENT_URL_TTL_SECS", 3600)?),
            openai: OpenAiConfig::from_env()?,
            semantic_search_enabled: flag("SEMANTIC_SEARCH_ENABLED")?,
            message_embedding_enabled: flag("MESSAGE_EMBEDDING_ENABLED")?,
            scheduler_workers: parse_or("SCHEDULER_WORKERS", 4)?,
            scheduler_poll_interval: Duration::from_millis(parse_or(
                "SCHEDULER_POLL_INTERVAL_MS",
                500,
            )?),
        })
    }

    /// Dev defaults with no external services; pairs with in-memory backends.
    pub fn local(jwt_secret: &str) -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            environment: Environment::Dev,
            database_url: String::new(),
            db_max_connections: 1,
            redis_url: None,
            cache_timeout: Duration::from_millis(500),
            jwt_secret: jwt_secret.to_string(),
            broadcast_policy: BroadcastPolicy::for_environment(Environment::Dev),
            online_ttl: Duration::from_secs(30),
            attachment_signer_url: None,
            attachment_url_ttl: Duration::from_secs(3600),
            openai: None,
            semantic_search_enabled: false,
            message_embedding_enabled: false,
            scheduler_workers: 1,
            scheduler_poll_interval: Duration::from_millis(50),
        }
    }
}

impl OpenAiConfig {
    /// Only present when an API key is configured; everything else then becomes required.
    fn from_env() -> Result<Option<Self>> {
        let Some(api_key) = optional("OPENAI_API_KEY") else {
            return Ok(None);
        };

        Ok(Some(Self {
            api_key,
            base_url: optional("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            embedding_model: optional("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            optimizer_model: required("OPENAI_SEARCH_QUERY_OPTIMIZER_MODEL")?,
            optimizer_instructions: required("OPENAI_SEARCH_QUERY_OPTIMIZER_INSTRUCTIONS")?,
            optimizer_temperature: parse_or("OPENAI_SEARCH_QUERY_OPTIMIZER_TEMP", 0.0)?,
            re_ranking_model: required("OPENAI_SEMANTIC_SEARCH_RE_RANKING_MODEL")?,
            re_ranking_instructions: required("OPENAI_SEMANTIC_SEARCH_RE_RANKING_INSTRUCTIONS")?,
            re_ranking_prompt: required("OPENAI_SEMANTIC_SEARCH_RE_RANKING_PROMPT")?,
            re_ranking_temperature: parse_or("OPENAI_SEMANTIC_SEARCH_RE_RANKING_TEMP", 0.0)?,
        }))
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> Result<String> {
    optional(key).with_context(|| format!("{} must be set", key))
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid value for {}: {}", key, e)),
        None => Ok(default),
    }
}

fn flag(key: &str) -> Result<bool> {
    optional(key).map_or(Ok(false), |raw| parse_bool(key, &raw))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("invalid boolean for {}: '{}'", key, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prod_excludes_sender_by_default() {
        assert_eq!(
            BroadcastPolicy::for_environment(Environment::Prod),
            BroadcastPolicy::ExcludeSender
        );
        assert_eq!(
            BroadcastPolicy::for_environment(Environment::Dev),
            BroadcastPolicy::IncludeSender
        );
        assert_eq!(
            BroadcastPolicy::for_environment(Environment::Stg),
            BroadcastPolicy::IncludeSender
        );
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("production".parse::<Environment>().is_err());
    }

    #[test]
    fn booleans_reject_garbage() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
