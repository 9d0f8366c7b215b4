use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::lifecycle::AgentLifecycle;
use super::resources::{ResourceMonitor, TaskPermit};
use super::trace::ExecutionTrace;
use super::TaskOutcome;
use crate::cancel::CancelToken;
use crate::config::ResourceLimitsConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{ExecutionStatus, Task};

/// Hook kinds run around every task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreExecution,
    PostExecution,
    OnError,
}

/// Context handed to hooks. Hook failures are logged and swallowed — they
/// never abort the primary execution.
pub struct HookContext<'a> {
    pub agent_id: &'a str,
    pub task:     &'a Task,
    pub result:   Option<&'a TaskOutcome>,
    pub error:    Option<&'a str>,
}

pub type HookFn = Arc<dyn Fn(&HookContext<'_>) -> Result<(), String> + Send + Sync>;

/// Book-keeping for one in-flight or finished execution.
#[derive(Clone)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub kind:         String,
    pub status:       ExecutionStatus,
    pub cancel:       CancelToken,
    pub created_at:   DateTime<Utc>,
    pub cancellation_reason: Option<String>,
}

/// Shared machinery under every agent: lifecycle state machine, hook
/// registry, execution registry with pause/resume/cancel, resource
/// governor, and the execution trace.
pub struct AgentCore {
    agent_id:   String,
    state:      Mutex<AgentLifecycle>,
    hooks:      Mutex<HashMap<HookKind, Vec<HookFn>>>,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
    trace:      Mutex<ExecutionTrace>,
    step:       std::sync::atomic::AtomicUsize,
    resources:  Arc<ResourceMonitor>,
}

impl AgentCore {
    pub fn new(agent_id: impl Into<String>, limits: ResourceLimitsConfig) -> Self {
        Self {
            agent_id:   agent_id.into(),
            state:      Mutex::new(AgentLifecycle::Created),
            hooks:      Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            trace:      Mutex::new(ExecutionTrace::new()),
            step:       std::sync::atomic::AtomicUsize::new(0),
            resources:  Arc::new(ResourceMonitor::new(limits)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn state(&self) -> AgentLifecycle {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn transition(&self, to: AgentLifecycle) -> CoreResult<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if !state.can_transition(to) {
            return Err(CoreError::Validation(format!(
                "invalid lifecycle transition {} -> {}",
                *state, to
            )));
        }
        tracing::info!(agent = %self.agent_id, from = %*state, to = %to, "lifecycle transition");
        *state = to;
        Ok(())
    }

    /// `Created → Initializing → Active`.
    pub fn initialize(&self) -> CoreResult<()> {
        self.transition(AgentLifecycle::Initializing)?;
        self.transition(AgentLifecycle::Active)?;
        self.log("lifecycle", "INITIALIZED", "");
        Ok(())
    }

    /// `→ ShuttingDown → Terminated`. Cancels everything still running.
    pub fn shutdown(&self) -> CoreResult<()> {
        self.transition(AgentLifecycle::ShuttingDown)?;
        {
            let executions = self.executions.lock().expect("executions lock poisoned");
            for record in executions.values() {
                if !record.status.is_terminal() {
                    record.cancel.cancel();
                }
            }
        }
        self.transition(AgentLifecycle::Terminated)?;
        self.log("lifecycle", "TERMINATED", "");
        Ok(())
    }

    /// Admission check plus `Active → Busy`. The returned guard restores
    /// `Busy → Active` and frees the concurrency slot when dropped.
    pub fn begin_task(core: &Arc<AgentCore>, kind: &str) -> CoreResult<TaskGuard> {
        {
            let state = core.state.lock().expect("state lock poisoned");
            if !state.accepts_tasks() {
                return Err(CoreError::Validation(format!(
                    "agent {} is {} and does not accept tasks",
                    core.agent_id, *state
                )));
            }
        }

        let permit = ResourceMonitor::acquire_task_permit(&core.resources);
        // First concurrent task flips the agent to Busy.
        let _ = core.transition(AgentLifecycle::Busy);

        let execution_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            kind:         kind.to_string(),
            status:       ExecutionStatus::Running,
            cancel:       cancel.clone(),
            created_at:   Utc::now(),
            cancellation_reason: None,
        };
        core.executions
            .lock()
            .expect("executions lock poisoned")
            .insert(execution_id.clone(), record);

        Ok(TaskGuard {
            core: Arc::clone(core),
            execution_id,
            cancel,
            _permit: permit,
        })
    }

    pub fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions
            .lock()
            .expect("executions lock poisoned")
            .get(execution_id)
            .cloned()
    }

    pub fn execution_ids(&self) -> Vec<String> {
        self.executions
            .lock()
            .expect("executions lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn set_execution_status(&self, execution_id: &str, status: ExecutionStatus) -> CoreResult<()> {
        let mut executions = self.executions.lock().expect("executions lock poisoned");
        let record = executions
            .get_mut(execution_id)
            .ok_or_else(|| CoreError::Validation(format!("execution {} not found", execution_id)))?;
        record.status = status;
        Ok(())
    }

    /// Pause a running execution; the agent drops to `Paused` as well.
    pub fn pause_execution(&self, execution_id: &str) -> CoreResult<bool> {
        {
            let executions = self.executions.lock().expect("executions lock poisoned");
            let record = executions.get(execution_id).ok_or_else(|| {
                CoreError::Validation(format!("execution {} not found", execution_id))
            })?;
            if record.status != ExecutionStatus::Running {
                return Ok(false);
            }
        }
        self.set_execution_status(execution_id, ExecutionStatus::Paused)?;
        let _ = self.transition(AgentLifecycle::Paused);
        self.log("execution", "PAUSED", execution_id);
        Ok(true)
    }

    pub fn resume_execution(&self, execution_id: &str) -> CoreResult<bool> {
        {
            let executions = self.executions.lock().expect("executions lock poisoned");
            let record = executions.get(execution_id).ok_or_else(|| {
                CoreError::Validation(format!("execution {} not found", execution_id))
            })?;
            if record.status != ExecutionStatus::Paused {
                return Ok(false);
            }
        }
        self.set_execution_status(execution_id, ExecutionStatus::Running)?;
        let _ = self.transition(AgentLifecycle::Active);
        self.log("execution", "RESUMED", execution_id);
        Ok(true)
    }

    /// Signal cooperative cancellation. In-flight work observes the token
    /// at its next suspension point and completes with a CANCELLED result.
    pub fn cancel_execution(&self, execution_id: &str, reason: Option<&str>) -> CoreResult<bool> {
        let cancel = {
            let mut executions = self.executions.lock().expect("executions lock poisoned");
            let record = executions.get_mut(execution_id).ok_or_else(|| {
                CoreError::Validation(format!("execution {} not found", execution_id))
            })?;
            record.status = ExecutionStatus::Cancelled;
            record.cancellation_reason = reason.map(str::to_string);
            record.cancel.clone()
        };
        cancel.cancel();
        self.log(
            "execution",
            "CANCELLED",
            &format!("{} ({})", execution_id, reason.unwrap_or("no reason")),
        );
        Ok(true)
    }

    // ── Hooks ───────────────────────────────────────────────────────────

    pub fn add_hook(&self, kind: HookKind, hook: HookFn) {
        self.hooks
            .lock()
            .expect("hooks lock poisoned")
            .entry(kind)
            .or_default()
            .push(hook);
    }

    /// Run hooks of one kind sequentially. Failures are logged as
    /// HOOK_ERROR and never abort the caller.
    pub fn run_hooks(&self, kind: HookKind, ctx: &HookContext<'_>) {
        let hooks = {
            let hooks = self.hooks.lock().expect("hooks lock poisoned");
            hooks.get(&kind).cloned().unwrap_or_default()
        };
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(message) = hook(ctx) {
                tracing::warn!(
                    agent = %self.agent_id,
                    kind = ?kind,
                    hook = index,
                    error = %message,
                    "hook failed"
                );
                self.log("hook", "HOOK_ERROR", &message);
            }
        }
    }

    // ── Trace ───────────────────────────────────────────────────────────

    pub fn log(&self, scope: &str, event: &str, data: &str) {
        let step = self.step.load(std::sync::atomic::Ordering::SeqCst);
        self.trace
            .lock()
            .expect("trace lock poisoned")
            .record(step, scope, event, data);
    }

    pub fn next_step(&self) -> usize {
        self.step
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1
    }

    pub fn with_trace<R>(&self, f: impl FnOnce(&ExecutionTrace) -> R) -> R {
        let trace = self.trace.lock().expect("trace lock poisoned");
        f(&trace)
    }
}

/// RAII guard for one task execution.
pub struct TaskGuard {
    core:         Arc<AgentCore>,
    execution_id: String,
    cancel:       CancelToken,
    _permit:      TaskPermit,
}

impl std::fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard")
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl TaskGuard {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn finish(&self, status: ExecutionStatus) {
        let _ = self.core.set_execution_status(&self.execution_id, status);
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        // Leave terminal statuses alone; anything else was abandoned.
        if let Some(record) = self.core.execution(&self.execution_id) {
            if !record.status.is_terminal() && record.status != ExecutionStatus::Paused {
                let _ = self
                    .core
                    .set_execution_status(&self.execution_id, ExecutionStatus::Completed);
            }
        }
        // Last task out returns the agent to Active.
        if self.core.resources.active_tasks() <= 1 {
            let _ = self.core.transition(AgentLifecycle::Active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn core() -> Arc<AgentCore> {
        let core = Arc::new(AgentCore::new("agent-1", ResourceLimitsConfig::default()));
        core.initialize().unwrap();
        core
    }

    #[test]
    fn initialize_walks_the_state_machine() {
        let core = Arc::new(AgentCore::new("a", ResourceLimitsConfig::default()));
        assert_eq!(core.state(), AgentLifecycle::Created);
        core.initialize().unwrap();
        assert_eq!(core.state(), AgentLifecycle::Active);
    }

    #[test]
    fn begin_task_requires_active() {
        let core = Arc::new(AgentCore::new("a", ResourceLimitsConfig::default()));
        let err = AgentCore::begin_task(&core, "task").unwrap_err();
        assert!(err.to_string().contains("does not accept tasks"));
    }

    #[test]
    fn task_guard_flips_busy_and_back() {
        let core = core();
        let guard = AgentCore::begin_task(&core, "task").unwrap();
        assert_eq!(core.state(), AgentLifecycle::Busy);
        guard.finish(ExecutionStatus::Completed);
        drop(guard);
        assert_eq!(core.state(), AgentLifecycle::Active);
    }

    #[test]
    fn cancel_sets_status_and_token() {
        let core = core();
        let guard = AgentCore::begin_task(&core, "task").unwrap();
        let token = guard.cancel_token();
        let id = guard.execution_id().to_string();

        core.cancel_execution(&id, Some("operator request")).unwrap();
        assert!(token.is_cancelled());
        assert_eq!(core.execution(&id).unwrap().status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn pause_resume_round_trip() {
        let core = core();
        let guard = AgentCore::begin_task(&core, "task").unwrap();
        let id = guard.execution_id().to_string();

        assert!(core.pause_execution(&id).unwrap());
        assert_eq!(core.state(), AgentLifecycle::Paused);
        assert_eq!(core.execution(&id).unwrap().status, ExecutionStatus::Paused);

        assert!(core.resume_execution(&id).unwrap());
        assert_eq!(core.execution(&id).unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn hooks_run_and_failures_are_swallowed() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let core = core();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        core.add_hook(
            HookKind::PreExecution,
            Arc::new(move |_ctx| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        core.add_hook(
            HookKind::PreExecution,
            Arc::new(|_ctx| Err("hook blew up".to_string())),
        );

        let task = Task::direct("calculator", "add", json!({}));
        core.run_hooks(
            HookKind::PreExecution,
            &HookContext {
                agent_id: "agent-1",
                task: &task,
                result: None,
                error: None,
            },
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // Failure landed in the trace, not in the caller.
        assert_eq!(core.with_trace(|t| t.for_event("HOOK_ERROR").len()), 1);
    }

    #[test]
    fn shutdown_cancels_running_executions() {
        let core = core();
        let guard = AgentCore::begin_task(&core, "task").unwrap();
        let token = guard.cancel_token();
        core.shutdown().unwrap();
        assert!(token.is_cancelled());
        assert_eq!(core.state(), AgentLifecycle::Terminated);
    }
}
