use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::collaboration::AgentRegistry;
use super::hybrid::HybridAgent;
use super::TaskOutcome;
use crate::error::{CoreError, CoreResult, RecoveryCause};
use crate::types::{ExecutionContext, Task};

/// Ordered strategies tried by [`HybridAgent::execute_with_recovery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run on retryable errors with exponential backoff and jitter.
    Retry,
    /// Strip optional requirements from the task and retry once.
    Simplify,
    /// Hand the task to the configured fallback executor.
    Fallback,
    /// Forward to a capable peer from the registry.
    Delegate,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Simplify => "simplify",
            Self::Fallback => "fallback",
            Self::Delegate => "delegate",
        }
    }

    pub fn all() -> Vec<RecoveryStrategy> {
        vec![Self::Retry, Self::Simplify, Self::Fallback, Self::Delegate]
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Exponential backoff with up-to-25% jitter, without a PRNG dependency —
/// the subsecond clock phase is noise enough here.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY
        .checked_mul(1u32 << attempt.min(6))
        .unwrap_or(RETRY_MAX_DELAY)
        .min(RETRY_MAX_DELAY);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter = base.mul_f64(f64::from(nanos % 1000) / 4000.0);
    base + jitter
}

impl HybridAgent {
    /// Run a task, then walk the recovery chain on failure.
    ///
    /// Strategies run in the given order; the first success wins and the
    /// outcome records which strategy produced it. When every strategy
    /// fails the error is `RecoveryExhausted` carrying one cause per
    /// strategy.
    pub async fn execute_with_recovery(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        strategies: &[RecoveryStrategy],
        registry: Option<&AgentRegistry>,
    ) -> CoreResult<TaskOutcome> {
        let first_error = match self.execute_task(task, ctx).await {
            Ok(outcome) if outcome.success => return Ok(outcome),
            Ok(outcome) => CoreError::Execution(
                outcome.error.unwrap_or_else(|| "task reported failure".to_string()),
            ),
            Err(err) => err,
        };
        tracing::warn!(
            agent = %self.core.agent_id(),
            task = %task.task_id,
            error = %first_error,
            "task failed, entering recovery chain"
        );

        let mut causes = Vec::new();
        let mut last_error = first_error;

        for strategy in strategies {
            self.core.log("recovery", "STRATEGY_START", strategy.as_str());
            let attempt = match strategy {
                RecoveryStrategy::Retry => self.recover_retry(task, ctx, &last_error).await,
                RecoveryStrategy::Simplify => self.recover_simplify(task, ctx).await,
                RecoveryStrategy::Fallback => self.recover_fallback(task).await,
                RecoveryStrategy::Delegate => self.recover_delegate(task, registry).await,
            };

            match attempt {
                Ok(mut outcome) => {
                    outcome.recovery_strategy = Some(strategy.as_str().to_string());
                    self.core.log("recovery", "STRATEGY_SUCCESS", strategy.as_str());
                    return Ok(outcome);
                }
                Err(err) => {
                    self.core.log("recovery", "STRATEGY_FAILED", &err.to_string());
                    causes.push(RecoveryCause {
                        strategy: strategy.as_str().to_string(),
                        error:    err.to_string(),
                    });
                    last_error = err;
                }
            }
        }

        Err(CoreError::RecoveryExhausted { causes })
    }

    async fn recover_retry(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        trigger: &CoreError,
    ) -> CoreResult<TaskOutcome> {
        if !trigger.is_retryable() {
            return Err(CoreError::Execution(format!(
                "error is not retryable: {}",
                trigger
            )));
        }

        let max_retries = task.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let mut last = None;
        for attempt in 0..max_retries {
            tokio::time::sleep(backoff_delay(attempt)).await;
            match self.execute_task(task, ctx).await {
                Ok(outcome) if outcome.success => return Ok(outcome),
                Ok(outcome) => {
                    last = Some(CoreError::Execution(
                        outcome.error.unwrap_or_else(|| "task reported failure".to_string()),
                    ));
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    last = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            CoreError::Execution(format!("retry budget of {} exhausted", max_retries))
        }))
    }

    async fn recover_simplify(&self, task: &Task, ctx: &ExecutionContext) -> CoreResult<TaskOutcome> {
        let simplified = simplify_task(task);
        if simplified.description == task.description {
            return Err(CoreError::Execution(
                "task could not be simplified further".to_string(),
            ));
        }
        tracing::debug!(
            original = %task.description,
            simplified = %simplified.description,
            "retrying with simplified task"
        );
        match self.execute_task(&simplified, ctx).await {
            Ok(outcome) if outcome.success => Ok(outcome),
            Ok(outcome) => Err(CoreError::Execution(
                outcome
                    .error
                    .unwrap_or_else(|| "simplified task reported failure".to_string()),
            )),
            Err(err) => Err(err),
        }
    }

    async fn recover_fallback(&self, task: &Task) -> CoreResult<TaskOutcome> {
        match &self.fallback {
            Some(fallback) => match fallback(task.clone()).await {
                Ok(outcome) if outcome.success => Ok(outcome),
                Ok(outcome) => Err(CoreError::Execution(
                    outcome
                        .error
                        .unwrap_or_else(|| "fallback reported failure".to_string()),
                )),
                Err(err) => Err(err),
            },
            None => Err(CoreError::Execution("no fallback configured".to_string())),
        }
    }

    async fn recover_delegate(
        &self,
        task: &Task,
        registry: Option<&AgentRegistry>,
    ) -> CoreResult<TaskOutcome> {
        let registry = registry
            .ok_or_else(|| CoreError::Execution("no peer registry available".to_string()))?;

        let needed: Vec<String> = task.task_type.iter().cloned().collect();
        let mut candidates = self.find_capable_agents(registry, &needed);
        if candidates.is_empty() {
            candidates = registry
                .ids()
                .into_iter()
                .filter(|id| id != self.core.agent_id())
                .collect();
        }
        let target = candidates.first().ok_or_else(|| {
            CoreError::Execution("no capable peer registered for delegation".to_string())
        })?;

        self.delegate_task(registry, task, target).await.and_then(|outcome| {
            if outcome.success {
                Ok(outcome)
            } else {
                Err(CoreError::Execution(
                    outcome
                        .error
                        .unwrap_or_else(|| "delegated task reported failure".to_string()),
                ))
            }
        })
    }
}

/// Drop optional requirements: parenthesized asides go first, then any
/// clause after a semicolon, then everything past the first sentence.
pub(crate) fn simplify_task(task: &Task) -> Task {
    let mut description = task.description.clone();

    while let (Some(open), Some(close)) = (description.find('('), description.find(')')) {
        if open < close {
            description.replace_range(open..=close, "");
        } else {
            break;
        }
    }

    if let Some(pos) = description.find(';') {
        description.truncate(pos);
    }

    if let Some(pos) = description.find(". ") {
        description.truncate(pos + 1);
    }

    let description = description.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut simplified = task.clone();
    simplified.description = description;
    simplified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_labels() {
        assert_eq!(RecoveryStrategy::Retry.as_str(), "retry");
        assert_eq!(RecoveryStrategy::all().len(), 4);
    }

    #[test]
    fn simplify_strips_optional_clauses() {
        let task = Task::new(
            "Summarize the report (include charts if possible); also translate it. Then email everyone.",
        );
        let simplified = simplify_task(&task);
        assert_eq!(simplified.description, "Summarize the report");
    }

    #[test]
    fn simplify_is_identity_on_minimal_tasks() {
        let task = Task::new("add numbers");
        assert_eq!(simplify_task(&task).description, task.description);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(0);
        let third = backoff_delay(2);
        assert!(third >= first * 2, "{:?} vs {:?}", third, first);
        assert!(backoff_delay(20) <= RETRY_MAX_DELAY.mul_f64(1.25));
    }
}
