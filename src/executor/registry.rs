//! Execution registry — in-memory status ledger for introspection.
//!
//! A soft cache, not a source of truth: entries live in a map guarded by
//! an async mutex, completed entries are evicted after a retention window,
//! and everything is lost on restart by design.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::ExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub execution_id: String,
    pub state: ExecutionState,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    /// Orchestrator-level fault message, for failed entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status ledger keyed by execution id.
pub struct ExecutionRegistry {
    entries: Arc<Mutex<HashMap<String, ExecutionStatus>>>,
    retention: Duration,
}

impl ExecutionRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    /// Registers a running execution. Called when orchestration starts.
    pub async fn start(&self, execution_id: &str) {
        let status = ExecutionStatus {
            execution_id: execution_id.to_string(),
            state: ExecutionState::Running,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            result: None,
            error: None,
        };
        self.entries
            .lock()
            .await
            .insert(execution_id.to_string(), status);
    }

    /// Marks an execution completed with its result.
    pub async fn complete(&self, execution_id: &str, result: ExecutionResult) {
        self.finish(execution_id, ExecutionState::Completed, Some(result), None)
            .await;
    }

    /// Marks an execution failed with an orchestrator-level fault.
    pub async fn fail(&self, execution_id: &str, error: &str) {
        self.finish(
            execution_id,
            ExecutionState::Failed,
            None,
            Some(error.to_string()),
        )
        .await;
    }

    async fn finish(
        &self,
        execution_id: &str,
        state: ExecutionState,
        result: Option<ExecutionResult>,
        error: Option<String>,
    ) {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(execution_id) {
                entry.state = state;
                entry.completed_at = Some(chrono::Utc::now().to_rfc3339());
                entry.result = result;
                entry.error = error;
            }
        }
        self.schedule_eviction(execution_id.to_string());
    }

    /// Drops the entry after the retention window, unless the id was
    /// reused and is running again.
    fn schedule_eviction(&self, execution_id: String) {
        let entries = self.entries.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut entries = entries.lock().await;
            let evict = entries
                .get(&execution_id)
                .map(|e| e.state != ExecutionState::Running)
                .unwrap_or(false);
            if evict {
                entries.remove(&execution_id);
                debug!("Evicted execution status {execution_id}");
            }
        });
    }

    pub async fn get(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.entries.lock().await.get(execution_id).cloned()
    }

    /// All entries, running ones included — for polling dashboards.
    pub async fn list(&self) -> Vec<ExecutionStatus> {
        let mut all: Vec<ExecutionStatus> =
            self.entries.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }
}
