use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use super::core::{AgentCore, HookContext, HookKind};
use super::events::AgentEvent;
use super::{invoke_with_observation, TaskOutcome};
use crate::config::{LlmConfig, ResourceLimitsConfig};
use crate::error::{CoreError, CoreResult};
use crate::llm::{ChatMessage, LlmClient, LlmOptions, ToolChoice};
use crate::tools::{InvokeOptions, ToolExecutor};
use crate::types::{ExecutionStatus, Task};

/// Agent that dispatches tool operations, directly or via LLM function
/// calling.
///
/// The direct path runs when a task names `tool` + `operation`; otherwise an
/// LLM (when configured) selects the calls, which run serially here —
/// parallel execution is the hybrid agent's concern.
pub struct ToolAgent {
    core:       Arc<AgentCore>,
    executor:   Arc<ToolExecutor>,
    llm:        Option<Arc<dyn LlmClient>>,
    llm_config: LlmConfig,
}

impl ToolAgent {
    pub fn new(agent_id: impl Into<String>, executor: Arc<ToolExecutor>) -> CoreResult<Self> {
        let core = Arc::new(AgentCore::new(agent_id, ResourceLimitsConfig::default()));
        core.initialize()?;
        Ok(Self {
            core,
            executor,
            llm: None,
            llm_config: LlmConfig::default(),
        })
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, config: LlmConfig) -> Self {
        self.llm = Some(llm);
        self.llm_config = config;
        self
    }

    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    pub async fn execute(&self, task: &Task) -> CoreResult<TaskOutcome> {
        let guard = AgentCore::begin_task(&self.core, "tool_task")?;
        self.core.run_hooks(
            HookKind::PreExecution,
            &HookContext {
                agent_id: self.core.agent_id(),
                task,
                result: None,
                error: None,
            },
        );

        let outcome = if task.is_direct() {
            self.execute_direct(task, None).await
        } else {
            self.execute_llm_assisted(task, None).await
        };

        match &outcome {
            Ok(result) => {
                self.core.run_hooks(
                    HookKind::PostExecution,
                    &HookContext {
                        agent_id: self.core.agent_id(),
                        task,
                        result: Some(result),
                        error: None,
                    },
                );
                guard.finish(if result.success {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                });
            }
            Err(err) => {
                let message = err.to_string();
                self.core.run_hooks(
                    HookKind::OnError,
                    &HookContext {
                        agent_id: self.core.agent_id(),
                        task,
                        result: None,
                        error: Some(&message),
                    },
                );
                guard.finish(ExecutionStatus::Failed);
            }
        }
        outcome
    }

    /// Streaming variant emitting ordered [`AgentEvent`]s:
    /// `status → token* → tool_calls → (tool_call → tool_result)* → result`.
    pub async fn execute_streaming(
        &self,
        task: &Task,
        events: UnboundedSender<AgentEvent>,
    ) -> CoreResult<TaskOutcome> {
        let guard = AgentCore::begin_task(&self.core, "tool_task_streaming")?;
        let _ = events.send(AgentEvent::status(format!("executing task {}", task.task_id)));

        let outcome = if task.is_direct() {
            self.execute_direct(task, Some(&events)).await
        } else {
            self.execute_llm_assisted(task, Some(&events)).await
        };

        match &outcome {
            Ok(result) => {
                let _ = events.send(AgentEvent::Result {
                    success: result.success,
                    payload: result.output.clone().unwrap_or(Value::Null),
                });
                guard.finish(ExecutionStatus::Completed);
            }
            Err(err) => {
                let _ = events.send(AgentEvent::Error {
                    message: err.to_string(),
                });
                guard.finish(ExecutionStatus::Failed);
            }
        }
        outcome
    }

    async fn execute_direct(
        &self,
        task: &Task,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> CoreResult<TaskOutcome> {
        let tool = task.tool.as_deref().expect("direct task has a tool");
        let operation = task.operation.as_deref().expect("direct task has an operation");
        let params = task.parameters.clone().unwrap_or_else(|| json!({}));

        if let Some(tx) = events {
            let _ = tx.send(AgentEvent::ToolCall {
                name:      format!("{}.{}", tool, operation),
                arguments: params.clone(),
            });
        }

        self.core.resources().record_tool_call();
        let (observation, result) = invoke_with_observation(
            &self.executor,
            tool,
            operation,
            &params,
            InvokeOptions {
                user_id: Some(self.core.agent_id().to_string()),
                task_id: Some(task.task_id.clone()),
            },
        )
        .await;

        if let Some(tx) = events {
            let _ = tx.send(AgentEvent::ToolResult {
                name:    observation.tool_name.clone(),
                success: observation.success,
                result:  observation.result.clone().unwrap_or(Value::Null),
            });
        }
        self.core
            .log("tool", "DIRECT_DISPATCH", &format!("{}.{}", tool, operation));

        match result {
            Ok(value) => Ok(TaskOutcome {
                success:           true,
                output:            Some(value.clone()),
                tool_calls_count:  0,
                tool_results:      vec![value],
                observations:      vec![observation],
                tool_used:         Some(tool.to_string()),
                error:             None,
                recovery_strategy: None,
            }),
            Err(err) => Ok(TaskOutcome {
                success:           false,
                output:            None,
                tool_calls_count:  0,
                tool_results:      Vec::new(),
                observations:      vec![observation],
                tool_used:         Some(tool.to_string()),
                error:             Some(err.to_string()),
                recovery_strategy: None,
            }),
        }
    }

    async fn execute_llm_assisted(
        &self,
        task: &Task,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> CoreResult<TaskOutcome> {
        let llm = self.llm.as_ref().ok_or_else(|| {
            CoreError::Validation(
                "task names no tool and this agent has no LLM client configured".to_string(),
            )
        })?;

        let messages = vec![
            ChatMessage::system("Select and call the tools needed to complete the user's task."),
            ChatMessage::user(&task.description),
        ];
        let opts = LlmOptions {
            model:       Some(self.llm_config.model.clone()).filter(|m| !m.is_empty()),
            temperature: Some(self.llm_config.temperature),
            max_tokens:  Some(self.llm_config.max_tokens),
            tools:       self.executor.registry().function_schemas(),
            tool_choice: ToolChoice::Auto,
        };

        let reply = llm.generate_text(&messages, &opts).await.map_err(CoreError::from)?;
        if let Some(tokens) = reply.tokens_used {
            self.core.resources().record_tokens(u64::from(tokens));
        }

        if reply.tool_calls.is_empty() {
            return Ok(TaskOutcome::from_output(Value::String(reply.content)));
        }

        if let Some(tx) = events {
            let _ = tx.send(AgentEvent::ToolCalls {
                count: reply.tool_calls.len(),
            });
        }

        let mut tool_results = Vec::new();
        let mut observations = Vec::new();
        for call in &reply.tool_calls {
            let (tool, operation) = match self.executor.registry().resolve_function(&call.name) {
                Some((tool, operation)) => (tool.name().to_string(), operation),
                None => {
                    return Err(CoreError::ToolNotFound(call.name.clone()));
                }
            };
            let params = call.parsed_arguments();

            if let Some(tx) = events {
                let _ = tx.send(AgentEvent::ToolCall {
                    name:      format!("{}.{}", tool, operation),
                    arguments: params.clone(),
                });
            }

            self.core.resources().record_tool_call();
            let (observation, result) = invoke_with_observation(
                &self.executor,
                &tool,
                &operation,
                &params,
                InvokeOptions {
                    user_id: Some(self.core.agent_id().to_string()),
                    task_id: Some(task.task_id.clone()),
                },
            )
            .await;

            if let Some(tx) = events {
                let _ = tx.send(AgentEvent::ToolResult {
                    name:    observation.tool_name.clone(),
                    success: observation.success,
                    result:  observation.result.clone().unwrap_or(Value::Null),
                });
            }

            if let Ok(value) = result {
                tool_results.push(json!({"result": value}));
            } else {
                tool_results.push(json!({
                    "error": observation.error.clone().unwrap_or_default()
                }));
            }
            observations.push(observation);
        }

        Ok(TaskOutcome {
            success:           true,
            output:            Some(Value::String(reply.content)),
            tool_calls_count:  observations.len(),
            tool_results,
            observations,
            tool_used:         None,
            error:             None,
            recovery_strategy: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmReply, LlmToolCall, MockLlmClient};
    use crate::tools::builtin::CalculatorTool;
    use crate::tools::ToolRegistry;

    fn executor() -> Arc<ToolExecutor> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CalculatorTool::new()));
        Arc::new(ToolExecutor::new(registry))
    }

    #[tokio::test]
    async fn direct_path_returns_result_verbatim() {
        let agent = ToolAgent::new("tool-agent", executor()).unwrap();
        let task = Task::direct("calculator", "add", json!({"a": 5, "b": 3}));

        let outcome = agent.execute(&task).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, Some(json!(8)));
        assert_eq!(outcome.tool_used.as_deref(), Some("calculator"));
        assert_eq!(outcome.observations.len(), 1);
        assert!(outcome.observations[0].success);
    }

    #[tokio::test]
    async fn direct_path_without_llm_never_calls_model() {
        let mock = Arc::new(MockLlmClient::new(vec![]));
        let agent = ToolAgent::new("tool-agent", executor())
            .unwrap()
            .with_llm(mock.clone(), LlmConfig::default());
        let task = Task::direct("calculator", "add", json!({"a": 1, "b": 2}));

        agent.execute(&task).await.unwrap();
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn llm_assisted_path_executes_function_calls() {
        let reply = LlmReply::text("").with_tool_calls(vec![LlmToolCall::new(
            "call_1",
            "calculator.add",
            r#"{"a":7,"b":8}"#,
        )]);
        let mock = Arc::new(MockLlmClient::new(vec![reply]));
        let agent = ToolAgent::new("tool-agent", executor())
            .unwrap()
            .with_llm(mock.clone(), LlmConfig::default());

        let outcome = agent.execute(&Task::new("add seven and eight")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tool_calls_count, 1);
        assert_eq!(outcome.tool_results[0], json!({"result": 15}));
        assert_eq!(mock.call_count(), 1);
        // The model saw every registered operation as a schema.
        assert_eq!(mock.call(0).unwrap().tool_count, 4);
    }

    #[tokio::test]
    async fn llm_assisted_without_client_is_a_validation_error() {
        let agent = ToolAgent::new("tool-agent", executor()).unwrap();
        let err = agent.execute(&Task::new("do something")).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
    }

    #[tokio::test]
    async fn streaming_events_are_causally_ordered() {
        let reply = LlmReply::text("using the calculator").with_tool_calls(vec![
            LlmToolCall::new("c1", "calculator.add", r#"{"a":1,"b":2}"#),
        ]);
        let mock = Arc::new(MockLlmClient::new(vec![reply]));
        let agent = ToolAgent::new("tool-agent", executor())
            .unwrap()
            .with_llm(mock, LlmConfig::default());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        agent
            .execute_streaming(&Task::new("compute"), tx)
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.type_name());
        }
        let tool_calls_pos = kinds.iter().position(|k| *k == "tool_calls").unwrap();
        let tool_call_pos = kinds.iter().position(|k| *k == "tool_call").unwrap();
        let tool_result_pos = kinds.iter().position(|k| *k == "tool_result").unwrap();
        assert!(tool_calls_pos < tool_call_pos);
        assert!(tool_call_pos < tool_result_pos);
        assert_eq!(*kinds.last().unwrap(), "result");
    }
}
