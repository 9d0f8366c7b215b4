use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::cache::ToolCache;
use super::registry::ToolRegistry;
use crate::config::{RateLimitConfig, ToolCacheConfig};
use crate::error::{CoreError, CoreResult};

/// Computes a TTL in seconds from `(result, params)`. When set for a tool it
/// wins over the fixed default TTL.
pub type TtlStrategy = Arc<dyn Fn(&Value, &Value) -> u64 + Send + Sync>;

/// Caller identity attached to an invocation; partitions both the cache key
/// and the rate-limit bucket.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub user_id: Option<String>,
    pub task_id: Option<String>,
}

struct TokenBucket {
    tokens:      f64,
    capacity:    f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available, otherwise report how long to wait.
    fn try_acquire(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }
}

/// Per-key token-bucket limiter. Breaches block the caller until a slot
/// frees up; requests are never dropped.
pub struct RateLimiter {
    config:  RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
                    TokenBucket::new(
                        f64::from(self.config.burst).max(1.0),
                        self.config.requests_per_second,
                    )
                });
                match bucket.try_acquire() {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            // Sleep outside the lock so other keys keep flowing.
            tracing::debug!(key, wait_ms = wait.as_millis() as u64, "rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Canonical JSON: objects with keys in sorted order, recursively. Two
/// semantically equal parameter maps always produce the same string.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Schema-validated, cached, rate-limited tool dispatch.
///
/// The invocation contract, in order: resolve, validate, cache lookup,
/// rate-limit acquire, run, cache write. Failures propagate as typed
/// [`CoreError`] values and never touch the cache.
pub struct ToolExecutor {
    registry:       Arc<ToolRegistry>,
    cache:          ToolCache,
    limiter:        RateLimiter,
    ttl_strategies: std::sync::Mutex<HashMap<String, TtlStrategy>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_config(registry, ToolCacheConfig::default(), RateLimitConfig::default())
    }

    pub fn with_config(
        registry: Arc<ToolRegistry>,
        cache_config: ToolCacheConfig,
        rate_config: RateLimitConfig,
    ) -> Self {
        Self {
            registry,
            cache: ToolCache::new(cache_config),
            limiter: RateLimiter::new(rate_config),
            ttl_strategies: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    /// Install a TTL strategy for one tool. The strategy wins over the
    /// fixed default TTL on every cache write for that tool.
    pub fn set_ttl_strategy(&self, tool_name: &str, strategy: TtlStrategy) {
        self.ttl_strategies
            .lock()
            .expect("ttl strategy lock poisoned")
            .insert(tool_name.to_string(), strategy);
    }

    pub fn cache_key(
        tool_name: &str,
        operation: &str,
        params: &Value,
        opts: &InvokeOptions,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(params).as_bytes());
        hasher.update(b"|");
        hasher.update(opts.user_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(opts.task_id.as_deref().unwrap_or("").as_bytes());
        let digest = hasher.finalize();
        format!("{}.{}:{:x}", tool_name, operation, digest)
    }

    /// Run one tool operation under the full invocation contract.
    pub async fn invoke(
        &self,
        tool_name: &str,
        operation: &str,
        params: Value,
        opts: InvokeOptions,
    ) -> CoreResult<Value> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| CoreError::ToolNotFound(tool_name.to_string()))?;

        if !tool.supported_operations().iter().any(|op| op == operation) {
            return Err(CoreError::ToolOperationNotFound {
                tool:      tool_name.to_string(),
                operation: operation.to_string(),
            });
        }

        tool.validate_params(operation, &params).map_err(|msg| {
            CoreError::Validation(format!(
                "invalid parameters for {}.{}: {}",
                tool_name, operation, msg
            ))
        })?;

        let key = Self::cache_key(tool_name, operation, &params, &opts);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(tool = tool_name, operation, "cache hit");
            return Ok(cached);
        }

        let bucket_key = format!(
            "{}:{}",
            opts.user_id.as_deref().unwrap_or("anonymous"),
            tool_name
        );
        self.limiter.acquire(&bucket_key).await;

        let started = Instant::now();
        let outcome = tool.run(operation, &params).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    tool = tool_name,
                    operation,
                    elapsed_ms,
                    "tool invocation succeeded"
                );
                let ttl = self.ttl_for(tool_name, &result, &params);
                self.cache.insert(key, result.clone(), ttl);
                Ok(result)
            }
            Err(message) => {
                tracing::warn!(
                    tool = tool_name,
                    operation,
                    elapsed_ms,
                    error = %message,
                    "tool invocation failed"
                );
                Err(CoreError::Execution(format!(
                    "{}.{} failed: {}",
                    tool_name, operation, message
                )))
            }
        }
    }

    fn ttl_for(&self, tool_name: &str, result: &Value, params: &Value) -> Duration {
        let strategies = self.ttl_strategies.lock().expect("ttl strategy lock poisoned");
        match strategies.get(tool_name) {
            Some(strategy) => Duration::from_secs(strategy(result, params)),
            None => self.cache.default_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::CalculatorTool;
    use crate::tools::{FnOperation, FnTool};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor() -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CalculatorTool::new()));
        ToolExecutor::new(registry)
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn cache_key_separates_users() {
        let params = json!({"a": 1});
        let k1 = ToolExecutor::cache_key("t", "op", &params, &InvokeOptions {
            user_id: Some("u1".into()),
            task_id: None,
        });
        let k2 = ToolExecutor::cache_key("t", "op", &params, &InvokeOptions {
            user_id: Some("u2".into()),
            task_id: None,
        });
        assert_ne!(k1, k2);
        assert!(k1.starts_with("t.op:"));
    }

    #[tokio::test]
    async fn invoke_unknown_tool_fails_typed() {
        let exec = executor();
        let err = exec
            .invoke("nonexistent", "op", json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ToolNotFound);
    }

    #[tokio::test]
    async fn invoke_unknown_operation_fails_typed() {
        let exec = executor();
        let err = exec
            .invoke("calculator", "launch", json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ToolOperationNotFound);
    }

    #[tokio::test]
    async fn invoke_invalid_params_fails_with_remediation() {
        let exec = executor();
        let err = exec
            .invoke("calculator", "add", json!({"a": 1}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
        assert!(err.to_string().contains("'b'"));
    }

    #[tokio::test]
    async fn second_invoke_hits_cache_without_running() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(
            FnTool::new("counter", "Counts invocations").operation(FnOperation::new(
                "bump",
                "Increment the global counter",
                |_| {
                    let n = RUNS.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!(n))
                },
            )),
        ));
        let exec = ToolExecutor::new(registry);

        let first = exec
            .invoke("counter", "bump", json!({}), InvokeOptions::default())
            .await
            .unwrap();
        let second = exec
            .invoke("counter", "bump", json!({}), InvokeOptions::default())
            .await
            .unwrap();

        assert_eq!(first, second, "cache hit must return the populated value");
        assert_eq!(RUNS.load(Ordering::SeqCst), 1, "run must not execute on a hit");
        assert_eq!(exec.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn failures_do_not_pollute_cache() {
        let exec = executor();
        let err = exec
            .invoke(
                "calculator",
                "divide",
                json!({"a": 1, "b": 0}),
                InvokeOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Execution);
        assert_eq!(exec.cache().len(), 0);
    }

    #[tokio::test]
    async fn ttl_strategy_wins_over_default() {
        let exec = executor();
        exec.set_ttl_strategy("calculator", Arc::new(|_result, _params| 0));
        exec.invoke(
            "calculator",
            "add",
            json!({"a": 1, "b": 2}),
            InvokeOptions::default(),
        )
        .await
        .unwrap();
        // TTL of zero: the entry expires immediately, so the next lookup
        // misses and re-runs.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            exec.cache()
                .get(&ToolExecutor::cache_key(
                    "calculator",
                    "add",
                    &json!({"a": 1, "b": 2}),
                    &InvokeOptions::default()
                )),
            None
        );
    }

    #[tokio::test]
    async fn rate_limiter_blocks_rather_than_drops() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 100.0,
            burst: 1,
            batch_size: 10,
        });
        let started = Instant::now();
        limiter.acquire("u:tool").await;
        limiter.acquire("u:tool").await;
        // Second acquire had to wait for a refill (~10ms at 100 rps).
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
