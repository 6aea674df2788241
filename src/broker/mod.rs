use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sentinel tool name for catalog-discovery tasks; any agent matches it.
pub const DISCOVERY_TOOL: &str = "__discovery__";

/// Tool-name prefixes mapped to the capability tags that can serve them.
const PREFIX_CAPABILITIES: &[(&str, &[&str])] = &[
    (
        "jira_",
        &["jira_operations", "khoros-atlassian", "atlassian_integration"],
    ),
    (
        "confluence_",
        &["confluence_operations", "khoros-atlassian", "atlassian_integration"],
    ),
    ("atlassian_", &["atlassian_integration", "khoros-atlassian"]),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
struct AgentInfo {
    registration: AgentRegistration,
    last_ping: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusEntry {
    pub agent_id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub active_tasks: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub registered_agents: usize,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub agents: Vec<AgentStatusEntry>,
}

#[derive(Default)]
struct BrokerState {
    agents: HashMap<String, AgentInfo>,
    /// FIFO queue scanned in insertion order on every poll.
    pending_tasks: IndexMap<Uuid, Task>,
    /// Tasks currently assigned to an agent, keyed by agent. The full task
    /// is retained so reaping can re-enqueue it.
    agent_tasks: HashMap<String, HashMap<Uuid, Task>>,
    task_results: HashMap<Uuid, AgentTaskResult>,
    task_futures: HashMap<Uuid, Arc<Notify>>,
}

/// In-memory registry, queue, and result store coupling polling local
/// agents to tool-call tasks. All state lives behind one lock; restart
/// loses pending work and agents must re-register.
#[derive(Default)]
pub struct LocalAgentBroker {
    state: Mutex<BrokerState>,
}

fn agent_can_handle(capabilities: &[String], tool_name: &str) -> bool {
    if tool_name == DISCOVERY_TOOL {
        return true;
    }
    if capabilities.iter().any(|c| c == tool_name) {
        return true;
    }
    for (prefix, required) in PREFIX_CAPABILITIES {
        if tool_name.starts_with(prefix) {
            return capabilities.iter().any(|c| required.contains(&c.as_str()));
        }
    }
    false
}

impl LocalAgentBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or re-register) an agent. Idempotent: overwrites the prior
    /// entry and resets `last_ping` without touching assigned work.
    pub fn register(&self, registration: AgentRegistration) {
        let mut state = self.lock();
        let agent_id = registration.agent_id.clone();
        info!(
            "local agent registered: {} ({:?})",
            agent_id, registration.capabilities
        );
        state.agents.insert(
            agent_id.clone(),
            AgentInfo {
                registration,
                last_ping: Utc::now(),
            },
        );
        state.agent_tasks.entry(agent_id).or_default();
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.lock().agents.contains_key(agent_id)
    }

    pub fn agent_capabilities(&self, agent_id: &str) -> Option<Vec<String>> {
        self.lock()
            .agents
            .get(agent_id)
            .map(|a| a.registration.capabilities.clone())
    }

    /// Whether any registered agent declares the given capability.
    pub fn has_capable_agent(&self, capability: &str) -> bool {
        self.lock()
            .agents
            .values()
            .any(|a| a.registration.capabilities.iter().any(|c| c == capability))
    }

    /// Hand the first matching pending task to the agent, in queue order.
    /// Updates `last_ping`. Unknown agents get nothing.
    pub fn poll(&self, agent_id: &str) -> Option<Task> {
        let mut state = self.lock();

        let capabilities = match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_ping = Utc::now();
                agent.registration.capabilities.clone()
            }
            None => {
                warn!("unknown agent polling for work: {}", agent_id);
                return None;
            }
        };

        let matched = state
            .pending_tasks
            .iter()
            .find(|(_, task)| agent_can_handle(&capabilities, &task.tool_name))
            .map(|(id, _)| *id)?;

        // shift_remove keeps the FIFO order of the remaining queue.
        let task = state.pending_tasks.shift_remove(&matched)?;
        state
            .agent_tasks
            .entry(agent_id.to_string())
            .or_default()
            .insert(task.task_id, task.clone());

        debug!(
            "task {} ({}) assigned to agent {}",
            task.task_id, task.tool_name, agent_id
        );
        Some(task)
    }

    /// Enqueue a task and create its completion signal.
    pub fn submit(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Uuid {
        let task = Task {
            task_id: Uuid::new_v4(),
            tool_name: tool_name.to_string(),
            arguments,
            timeout_seconds: timeout.as_secs(),
            created_at: Utc::now(),
        };
        let task_id = task.task_id;

        let mut state = self.lock();
        state.pending_tasks.insert(task_id, task);
        state.task_futures.insert(task_id, Arc::new(Notify::new()));
        debug!(
            "task {} ({}) submitted, {} pending",
            task_id,
            tool_name,
            state.pending_tasks.len()
        );
        task_id
    }

    /// Store a result and wake the waiter. Idempotent: a second completion
    /// for the same task is a no-op.
    pub fn complete(&self, task_id: Uuid, result: AgentTaskResult) {
        let mut state = self.lock();
        if state.task_results.contains_key(&task_id) {
            return;
        }

        state.pending_tasks.shift_remove(&task_id);
        for tasks in state.agent_tasks.values_mut() {
            if tasks.remove(&task_id).is_some() {
                break;
            }
        }
        state.task_results.insert(task_id, result);

        if let Some(notify) = state.task_futures.remove(&task_id) {
            notify.notify_one();
        }
    }

    /// Wait for a task's result. If it already completed, returns it
    /// immediately; otherwise blocks on the completion signal up to
    /// `timeout`. A timeout abandons the future — a late result is still
    /// stored and visible via [`Self::result`].
    pub async fn wait(&self, task_id: Uuid, timeout: Duration) -> Option<AgentTaskResult> {
        let notify = {
            let state = self.lock();
            if let Some(result) = state.task_results.get(&task_id) {
                return Some(result.clone());
            }
            state.task_futures.get(&task_id).cloned()
        };

        let notify = notify?;
        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => self.lock().task_results.get(&task_id).cloned(),
            Err(_) => {
                warn!("timed out waiting for task {}", task_id);
                self.lock().task_futures.remove(&task_id);
                None
            }
        }
    }

    /// Direct result lookup (used after a `wait` timeout).
    pub fn result(&self, task_id: Uuid) -> Option<AgentTaskResult> {
        self.lock().task_results.get(&task_id).cloned()
    }

    /// Remove agents that have not pinged within `max_age` and re-enqueue
    /// their still-open tasks. Tasks with results stay completed.
    pub fn reap(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut state = self.lock();

        let stale: Vec<String> = state
            .agents
            .iter()
            .filter(|(_, agent)| agent.last_ping < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for agent_id in &stale {
            state.agents.remove(agent_id);
            if let Some(tasks) = state.agent_tasks.remove(agent_id) {
                for (task_id, task) in tasks {
                    if state.task_results.contains_key(&task_id) {
                        continue;
                    }
                    info!(
                        "re-enqueueing task {} from reaped agent {}",
                        task_id, agent_id
                    );
                    state.pending_tasks.insert(task_id, task);
                }
            }
            info!("reaped stale agent {}", agent_id);
        }

        stale
    }

    /// Submit a task and wait for its result in one call.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Option<AgentTaskResult> {
        let task_id = self.submit(tool_name, arguments, timeout);
        self.wait(task_id, timeout).await
    }

    pub fn status(&self) -> BrokerStatus {
        let state = self.lock();
        BrokerStatus {
            registered_agents: state.agents.len(),
            pending_tasks: state.pending_tasks.len(),
            active_tasks: state.agent_tasks.values().map(HashMap::len).sum(),
            agents: state
                .agents
                .iter()
                .map(|(agent_id, agent)| AgentStatusEntry {
                    agent_id: agent_id.clone(),
                    name: agent.registration.name.clone(),
                    capabilities: agent.registration.capabilities.clone(),
                    active_tasks: state
                        .agent_tasks
                        .get(agent_id)
                        .map_or(0, HashMap::len),
                    last_seen: agent.last_ping,
                })
                .collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_ping(&self, agent_id: &str, age: Duration) {
        let mut state = self.lock();
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.last_ping = Utc::now() - chrono::Duration::from_std(age).unwrap();
        }
    }
}
