//! Identity of the task the agent runs beside.

use serde::{Deserialize, Serialize};

/// Identifies one attempt of one task within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub workflow_id: String,
    pub group_name: String,
    pub task_name: String,
    #[serde(default)]
    pub retry_id: u32,
}

impl TaskContext {
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        group_name: impl Into<String>,
        task_name: impl Into<String>,
        retry_id: u32,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            group_name: group_name.into(),
            task_name: task_name.into(),
            retry_id,
        }
    }

    /// Query parameters identifying this task to the remote service.
    #[must_use]
    pub fn query_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("workflow_id", self.workflow_id.clone()),
            ("group_name", self.group_name.clone()),
            ("task_name", self.task_name.clone()),
            ("retry_id", self.retry_id.to_string()),
        ]
    }

    /// Short label used in metric tags, e.g. `wf-1/train/2`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.workflow_id, self.task_name, self.retry_id)
    }
}
