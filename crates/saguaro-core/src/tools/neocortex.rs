use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

use super::{Tool, ToolContext};
use crate::agent::context::ContextItem;
use crate::agent::runner::{preview, Agent, Runner};
use crate::session::{InMemorySessionService, SessionKey, SessionService, SessionState};

/// Delegates a task to the neocortex agent in a fresh, throwaway session.
///
/// The agent is taken from the session state when present, otherwise the
/// one this tool was built with. Each summon starts with no history.
pub struct SummonNeocortexTool {
    fallback: Arc<Agent>,
    app_name: String,
    user_id: String,
}

impl SummonNeocortexTool {
    pub fn new(fallback: Arc<Agent>, app_name: &str, user_id: &str) -> Self {
        Self {
            fallback,
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Run `task` to completion and describe the answer. Failures come back
    /// as a status string, never as an error.
    ///
    /// Dropping the returned future aborts the nested run.
    pub async fn summon(&self, ctx: &ToolContext, task: &str) -> String {
        let neocortex = ctx
            .state
            .neocortex()
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        let session_id = format!("neocortex-{}", uuid::Uuid::new_v4().simple());

        info!(
            "Summoning neocortex ({}) from {}: {}",
            neocortex.model().name(),
            ctx.agent_name,
            preview(task, 120)
        );

        let app_name = self.app_name.clone();
        let user_id = self.user_id.clone();
        let task = task.to_string();
        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            let sessions = Arc::new(InMemorySessionService::new());
            sessions
                .create_session(
                    SessionKey::new(&app_name, &user_id, &session_id),
                    Arc::new(SessionState::default()),
                )
                .await?;
            let runner = Runner::new(neocortex, &app_name, sessions);
            let outcome = runner
                .run_to_completion(&user_id, &session_id, ContextItem::text(task))
                .await?;
            anyhow::Ok(outcome)
        }));

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("neocortex task aborted: {e}")),
        };

        match result {
            Ok(outcome) => {
                let answer = match outcome.final_text() {
                    Some(text) => text.to_string(),
                    None => outcome.to_string(),
                };
                info!("Neocortex answered ({} chars)", answer.len());
                format!("Neocortex responded: {answer}")
            }
            Err(e) => {
                warn!("Neocortex failed: {e:#}");
                format!("Error: Neocortex failed: {e}")
            }
        }
    }
}

#[async_trait]
impl Tool for SummonNeocortexTool {
    fn name(&self) -> &str {
        "summon_neocortex"
    }

    fn description(&self) -> &str {
        "Summon the Neocortex, a larger reasoning model, for complex tasks. \
         Describe the task fully: the Neocortex sees nothing but this text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The complex task description"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: serde_json::Value) -> Result<String> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;

        Ok(self.summon(ctx, task).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn tool_with(backend: &Arc<ScriptedBackend>) -> SummonNeocortexTool {
        let agent = Agent::new("neocortex", backend.binding("big"), "think hard");
        SummonNeocortexTool::new(Arc::new(agent), "saguaro_os", "default_user")
    }

    #[tokio::test]
    async fn task_is_the_sole_input() {
        let backend = ScriptedBackend::new();
        backend.push_text("use a bloom filter");
        let tool = tool_with(&backend);
        let ctx = ToolContext::new(Arc::new(SessionState::default()));

        let out = tool.summon(&ctx, "design a dedup cache").await;
        assert_eq!(out, "Neocortex responded: use a bloom filter");

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_texts, vec!["design a dedup cache".to_string()]);
        assert!(requests[0].assistant_texts.is_empty());
        assert!(requests[0].tool_names.is_empty());
        assert_eq!(requests[0].preamble.as_deref(), Some("think hard"));
    }

    #[tokio::test]
    async fn each_summon_starts_fresh() {
        let backend = ScriptedBackend::new();
        backend.push_text("first");
        backend.push_text("second");
        let tool = tool_with(&backend);
        let ctx = ToolContext::new(Arc::new(SessionState::default()));

        tool.summon(&ctx, "a").await;
        tool.summon(&ctx, "b").await;

        let requests = backend.requests();
        assert_eq!(requests[1].user_texts, vec!["b".to_string()]);
        assert!(requests[1].assistant_texts.is_empty());
    }

    #[tokio::test]
    async fn state_agent_takes_precedence() {
        let fallback = ScriptedBackend::new();
        let in_state = ScriptedBackend::new();
        in_state.push_text("from state");
        let tool = tool_with(&fallback);
        let agent = Arc::new(Agent::new("neocortex", in_state.binding("big"), ""));
        let ctx = ToolContext::new(Arc::new(SessionState::default().with_neocortex(agent)));

        let out = tool.summon(&ctx, "x").await;
        assert_eq!(out, "Neocortex responded: from state");
        assert!(fallback.requests().is_empty());
    }

    #[tokio::test]
    async fn dropped_summon_aborts_nested_run() {
        let backend = ScriptedBackend::new();
        backend.set_latency(std::time::Duration::from_millis(300));
        backend.push_text("too late");
        let tool = tool_with(&backend);
        let ctx = ToolContext::new(Arc::new(SessionState::default()));

        let summon = tool.summon(&ctx, "slow task");
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), summon)
                .await
                .is_err()
        );

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(backend.requests().len(), 1);
        assert_eq!(backend.completed(), 0);
    }

    #[tokio::test]
    async fn failure_becomes_status_string() {
        let backend = ScriptedBackend::new();
        backend.push_failure("rate limited");
        let tool = tool_with(&backend);
        let ctx = ToolContext::new(Arc::new(SessionState::default()));

        let out = tool
            .execute(&ctx, serde_json::json!({"task": "x"}))
            .await
            .unwrap();
        assert!(out.starts_with("Error: Neocortex failed:"));
        assert!(out.contains("rate limited"));
    }
}
