use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::LocalAgentBroker;
use crate::db::sources::is_local_url;
use crate::mcp::McpClient;

const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Uniform result of one tool invocation. Tool-level failures are values,
/// never errors — the agent loop feeds them back to the LLM as text.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallOutcome {
    pub fn ok(tool_name: &str, arguments: Value, result: String) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            tool_name: tool_name.to_string(),
            arguments,
        }
    }

    pub fn failed(tool_name: &str, arguments: Value, error: String) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            tool_name: tool_name.to_string(),
            arguments,
        }
    }

    /// The text handed to the LLM: the result, or an error line the model
    /// can react to.
    pub fn text(&self) -> String {
        match (&self.result, &self.error) {
            (Some(result), _) => result.clone(),
            (None, Some(error)) => format!("Error calling tool {}: {}", self.tool_name, error),
            (None, None) => String::new(),
        }
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Dispatches tool calls to the correct transport based on the source's URL
/// scheme: local schemes go to the agent broker, everything else over SSE.
pub struct ToolExecutor {
    broker: Arc<LocalAgentBroker>,
    mcp: McpClient,
    local_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(broker: Arc<LocalAgentBroker>, mcp: McpClient) -> Self {
        Self {
            broker,
            mcp,
            local_timeout: DEFAULT_LOCAL_TIMEOUT,
        }
    }

    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    pub async fn call_tool(
        &self,
        server_url: &str,
        auth_headers: &HashMap<String, String>,
        tool_name: &str,
        arguments: Value,
    ) -> ToolCallOutcome {
        if is_local_url(server_url) {
            debug!("routing tool '{}' to local agents ({})", tool_name, server_url);
            return self.call_local(tool_name, arguments).await;
        }

        debug!("routing tool '{}' to remote SSE ({})", tool_name, server_url);
        match self
            .mcp
            .call_tool(server_url, auth_headers, tool_name, &arguments)
            .await
        {
            Ok(text) => ToolCallOutcome::ok(tool_name, arguments, text),
            Err(e) => {
                warn!("remote tool '{}' failed: {}", tool_name, e);
                ToolCallOutcome::failed(tool_name, arguments, e.to_string())
            }
        }
    }

    async fn call_local(&self, tool_name: &str, arguments: Value) -> ToolCallOutcome {
        match self
            .broker
            .execute(tool_name, arguments.clone(), self.local_timeout)
            .await
        {
            Some(result) if result.success => {
                let text = result.result.as_ref().map(value_to_text).unwrap_or_default();
                ToolCallOutcome::ok(tool_name, arguments, text)
            }
            Some(result) => ToolCallOutcome::failed(
                tool_name,
                arguments,
                result.error.unwrap_or_else(|| "Unknown error".to_string()),
            ),
            None => ToolCallOutcome::failed(
                tool_name,
                arguments,
                "Tool execution timed out or no capable agent available".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AgentRegistration, AgentTaskResult};
    use serde_json::json;

    fn executor_with_broker() -> (Arc<LocalAgentBroker>, ToolExecutor) {
        let broker = Arc::new(LocalAgentBroker::new());
        let executor = ToolExecutor::new(broker.clone(), McpClient::new())
            .with_local_timeout(Duration::from_millis(200));
        (broker, executor)
    }

    #[tokio::test]
    async fn local_scheme_routes_to_broker() {
        let (broker, executor) = executor_with_broker();
        broker.register(AgentRegistration {
            agent_id: "a1".into(),
            name: "worker".into(),
            capabilities: vec!["jira_operations".into()],
            version: None,
        });

        // Simulate the polling agent concurrently with the dispatch.
        let agent = {
            let broker = broker.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(task) = broker.poll("a1") {
                        broker.complete(
                            task.task_id,
                            AgentTaskResult {
                                task_id: task.task_id,
                                agent_id: "a1".into(),
                                success: true,
                                result: Some(json!("2 issues found")),
                                error: None,
                                execution_time_ms: Some(5),
                            },
                        );
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let outcome = executor
            .call_tool(
                "local://jira_operations",
                &HashMap::new(),
                "jira_search",
                json!({"jql": "project=PDR"}),
            )
            .await;
        agent.await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.result.as_deref(), Some("2 issues found"));
        assert_eq!(outcome.tool_name, "jira_search");
    }

    #[tokio::test]
    async fn local_timeout_becomes_failure_value() {
        let (_broker, executor) = executor_with_broker();
        let outcome = executor
            .call_tool("agent://nobody-home", &HashMap::new(), "jira_search", json!({}))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn local_agent_error_is_preserved() {
        let (broker, executor) = executor_with_broker();
        broker.register(AgentRegistration {
            agent_id: "a1".into(),
            name: "worker".into(),
            capabilities: vec!["jira_operations".into()],
            version: None,
        });

        let agent = {
            let broker = broker.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(task) = broker.poll("a1") {
                        broker.complete(
                            task.task_id,
                            AgentTaskResult {
                                task_id: task.task_id,
                                agent_id: "a1".into(),
                                success: false,
                                result: None,
                                error: Some("jira unreachable".into()),
                                execution_time_ms: None,
                            },
                        );
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let outcome = executor
            .call_tool("stdio:///opt/jira-server", &HashMap::new(), "jira_search", json!({}))
            .await;
        agent.await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("jira unreachable"));
        assert!(outcome.text().contains("jira unreachable"));
    }

    #[test]
    fn outcome_text_prefers_result() {
        let ok = ToolCallOutcome::ok("t", json!({}), "payload".into());
        assert_eq!(ok.text(), "payload");

        let failed = ToolCallOutcome::failed("t", json!({}), "boom".into());
        assert_eq!(failed.text(), "Error calling tool t: boom");
    }
}
