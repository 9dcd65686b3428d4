use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{Tool, ToolContext};

pub const ADD_LONG_TERM: &str = "add_long_term";
pub const APPEND_SHORT_TERM: &str = "append_short_term";

/// Mutates the session's memory store.
///
/// `add_long_term` overwrites the whole document, short-term region
/// included. The action name suggests an additive write; it is not one.
pub struct UpdateMemoryTool;

#[async_trait]
impl Tool for UpdateMemoryTool {
    fn name(&self) -> &str {
        "update_memory"
    }

    fn description(&self) -> &str {
        "Update the system memory. action=\"append_short_term\" appends an entry to the \
         Short Term Memory. action=\"add_long_term\" REPLACES the entire memory document \
         (long and short term) with the given content, so include everything worth keeping."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "Either \"add_long_term\" or \"append_short_term\""
                },
                "content": {
                    "type": "string",
                    "description": "The content to write or append to memory"
                }
            },
            "required": ["action", "content"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: serde_json::Value) -> Result<String> {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: action"))?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        Ok(update_memory(ctx, action, content).await)
    }
}

/// Apply a memory action and describe the result. Never fails: every branch
/// yields the status string the agent will observe.
pub async fn update_memory(ctx: &ToolContext, action: &str, content: &str) -> String {
    let Some(memory) = ctx.state.memory() else {
        return "Error: Memory system not accessible.".to_string();
    };

    match action {
        ADD_LONG_TERM => match memory.write(content).await {
            Ok(()) => {
                info!("Memory overwritten by {} ({} chars)", ctx.agent_name, content.len());
                "Long term memory updated (overwritten).".to_string()
            }
            Err(e) => {
                warn!("Memory overwrite failed: {e}");
                format!("Error: Failed to update memory: {e}")
            }
        },
        APPEND_SHORT_TERM => match memory.append_short_term(content).await {
            Ok(()) => "Entry appended to short term memory.".to_string(),
            Err(e) => {
                warn!("Short-term append failed: {e}");
                format!("Error: Failed to update memory: {e}")
            }
        },
        other => format!("Error: Unknown action '{other}'."),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent::memory::MemoryStore;
    use crate::session::SessionState;

    async fn ctx_with_memory(dir: &tempfile::TempDir) -> (ToolContext, Arc<MemoryStore>) {
        let memory = Arc::new(
            MemoryStore::open(dir.path().join("memory.md"))
                .await
                .unwrap(),
        );
        let state = SessionState::default().with_memory(memory.clone());
        (ToolContext::new(Arc::new(state)), memory)
    }

    #[tokio::test]
    async fn append_short_term_appends() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, memory) = ctx_with_memory(&dir).await;

        let out = update_memory(&ctx, APPEND_SHORT_TERM, "test log").await;
        assert_eq!(out, "Entry appended to short term memory.");
        assert_eq!(memory.short_term().await, "- test log");
    }

    #[tokio::test]
    async fn add_long_term_overwrites_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, memory) = ctx_with_memory(&dir).await;
        memory.append_short_term("watching a video").await.unwrap();

        let out = update_memory(&ctx, ADD_LONG_TERM, "User prefers dark mode").await;
        assert_eq!(out, "Long term memory updated (overwritten).");
        // Destructive: the short-term entry and both headings are gone.
        assert_eq!(memory.read().await, "User prefers dark mode");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("memory.md")).unwrap(),
            "User prefers dark mode"
        );
    }

    #[tokio::test]
    async fn unknown_action_is_reported_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, memory) = ctx_with_memory(&dir).await;
        let before = memory.read().await;

        let out = update_memory(&ctx, "forget_everything", "x").await;
        assert_eq!(out, "Error: Unknown action 'forget_everything'.");
        assert_eq!(memory.read().await, before);
        assert!(!dir.path().join("memory.md").exists());
    }

    #[tokio::test]
    async fn missing_memory_in_state() {
        let ctx = ToolContext::new(Arc::new(SessionState::default()));
        let out = update_memory(&ctx, APPEND_SHORT_TERM, "x").await;
        assert_eq!(out, "Error: Memory system not accessible.");
    }

    #[tokio::test]
    async fn io_failure_becomes_status_string() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _memory) = ctx_with_memory(&dir).await;
        // Occupy the file path with a directory so the write fails.
        std::fs::create_dir(dir.path().join("memory.md")).unwrap();

        let out = update_memory(&ctx, APPEND_SHORT_TERM, "x").await;
        assert!(out.starts_with("Error: Failed to update memory:"));
    }

    #[tokio::test]
    async fn tool_reads_params() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, memory) = ctx_with_memory(&dir).await;

        let out = UpdateMemoryTool
            .execute(
                &ctx,
                serde_json::json!({"action": "append_short_term", "content": "via params"}),
            )
            .await
            .unwrap();
        assert_eq!(out, "Entry appended to short term memory.");
        assert!(memory.read().await.contains("- via params"));
    }
}
