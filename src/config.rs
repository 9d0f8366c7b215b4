use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Caps on an agent's concurrent work and rate budgets.
///
/// Token and tool-call budgets are observed over sliding 60-second windows
/// (see [`crate::agent::resources`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    pub enforce_limits:           bool,
    pub max_concurrent_tasks:     usize,
    pub max_tokens_per_minute:    u64,
    pub max_tool_calls_per_minute: u64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            enforce_limits:            true,
            max_concurrent_tasks:      5,
            max_tokens_per_minute:     10_000,
            max_tool_calls_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ToolCacheConfig {
    pub enabled:           bool,
    pub default_ttl_secs:  u64,
    pub max_cache_size:    usize,
    /// Size-enforcement trigger as a fraction of `max_cache_size`.
    pub cleanup_threshold: f64,
    /// Minimum seconds between automatic cleanup passes.
    pub cleanup_interval_secs: u64,
}

impl Default for ToolCacheConfig {
    fn default() -> Self {
        Self {
            enabled:               true,
            default_ttl_secs:      60,
            max_cache_size:        1000,
            cleanup_threshold:     0.8,
            cleanup_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst:               u32,
    pub batch_size:          usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst:               5,
            batch_size:          10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model:       String,
    pub temperature: f64,
    pub max_tokens:  u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model:       String::new(),
            temperature: 0.7,
            max_tokens:  4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DslConfig {
    pub max_execution_duration_secs: f64,
    pub max_parallel_tasks:          usize,
    pub default_loop_cap:            u32,
}

impl Default for DslConfig {
    fn default() -> Self {
        Self {
            max_execution_duration_secs: 3600.0,
            max_parallel_tasks:          10,
            default_loop_cap:            100,
        }
    }
}

/// Aggregated configuration for the execution core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub limits:     ResourceLimitsConfig,
    pub tool_cache: ToolCacheConfig,
    pub rate_limit: RateLimitConfig,
    pub llm:        LlmConfig,
    pub dsl:        DslConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl CoreConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("MAX_CONCURRENT_TASKS") {
            cfg.limits.max_concurrent_tasks = v;
        }
        if let Some(v) = env_parse("MAX_TOKENS_PER_MINUTE") {
            cfg.limits.max_tokens_per_minute = v;
        }
        if let Some(v) = env_parse("MAX_TOOL_CALLS_PER_MINUTE") {
            cfg.limits.max_tool_calls_per_minute = v;
        }

        if let Some(v) = env_parse("TOOL_CACHE_ENABLED") {
            cfg.tool_cache.enabled = v;
        }
        if let Some(v) = env_parse("TOOL_CACHE_DEFAULT_TTL") {
            cfg.tool_cache.default_ttl_secs = v;
        }
        if let Some(v) = env_parse("TOOL_CACHE_MAX_SIZE") {
            cfg.tool_cache.max_cache_size = v;
        }
        if let Some(v) = env_parse("TOOL_CACHE_CLEANUP_THRESHOLD") {
            cfg.tool_cache.cleanup_threshold = v;
        }
        if let Some(v) = env_parse("TOOL_CACHE_CLEANUP_INTERVAL") {
            cfg.tool_cache.cleanup_interval_secs = v;
        }

        if let Some(v) = env_parse("RATE_LIMIT_REQUESTS_PER_SECOND") {
            cfg.rate_limit.requests_per_second = v;
        }
        if let Some(v) = env_parse("BATCH_SIZE") {
            cfg.rate_limit.batch_size = v;
        }

        if let Ok(v) = std::env::var("LLM_MODEL") {
            cfg.llm.model = v;
        }
        if let Some(v) = env_parse("LLM_TEMPERATURE") {
            cfg.llm.temperature = v;
        }
        if let Some(v) = env_parse("LLM_MAX_TOKENS") {
            cfg.llm.max_tokens = v;
        }

        if let Some(v) = env_parse("DSL_MAX_EXECUTION_DURATION") {
            cfg.dsl.max_execution_duration_secs = v;
        }
        if let Some(v) = env_parse("DSL_MAX_PARALLEL_TASKS") {
            cfg.dsl.max_parallel_tasks = v;
        }
        if let Some(v) = env_parse("DSL_DEFAULT_LOOP_CAP") {
            cfg.dsl.default_loop_cap = v;
        }

        cfg
    }
}
