//! Scripted model backends for driving the kernel in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rig::completion::{CompletionRequest, Message};
use rig::message::{AssistantContent, Text, ToolResultContent, UserContent};
use rig::OneOrMany;
use saguaro_config::ModelRef;

use crate::agent::binding::{CompletionBackend, ModelBinding, ModelFactory};

enum Reply {
    Content(AssistantContent),
    Fail(String),
}

/// What a backend saw of one completion request.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordedRequest {
    pub preamble: Option<String>,
    pub user_texts: Vec<String>,
    pub assistant_texts: Vec<String>,
    pub tool_results: Vec<String>,
    pub tool_names: Vec<String>,
}

/// Replies from a queue, in order. An empty queue answers "ok".
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<RecordedRequest>>,
    next_call: Mutex<usize>,
    latency: Mutex<Option<Duration>>,
    completed: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn binding(self: &Arc<Self>, name: &str) -> ModelBinding {
        ModelBinding::new(name, self.clone())
    }

    /// Sleep this long inside every completion before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Completions that ran to the end, as opposed to merely started.
    pub fn completed(&self) -> usize {
        *self.completed.lock().unwrap()
    }

    pub fn push_text(&self, text: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Reply::Content(AssistantContent::Text(Text {
                text: text.to_string(),
            })));
    }

    pub fn push_tool_call(&self, name: &str, arguments: serde_json::Value) {
        let id = {
            let mut next = self.next_call.lock().unwrap();
            *next += 1;
            format!("call-{next}")
        };
        self.replies
            .lock()
            .unwrap()
            .push_back(Reply::Content(AssistantContent::tool_call(id, name, arguments)));
    }

    pub fn push_failure(&self, reason: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Reply::Fail(reason.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, request: &CompletionRequest) {
        let mut recorded = RecordedRequest {
            preamble: request.preamble.clone(),
            tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
            ..RecordedRequest::default()
        };
        for message in request.chat_history.iter() {
            match message {
                Message::User { content } => {
                    for part in content.iter() {
                        match part {
                            UserContent::Text(t) => recorded.user_texts.push(t.text.clone()),
                            UserContent::ToolResult(r) => {
                                for c in r.content.iter() {
                                    if let ToolResultContent::Text(t) = c {
                                        recorded.tool_results.push(t.text.clone());
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Message::Assistant { content, .. } => {
                    for part in content.iter() {
                        if let AssistantContent::Text(t) = part {
                            recorded.assistant_texts.push(t.text.clone());
                        }
                    }
                }
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }
        // Continuation prompts are runner plumbing, not observations.
        recorded
            .user_texts
            .retain(|t| !t.starts_with("If more tool calls are needed"));
        self.requests.lock().unwrap().push(recorded);
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<OneOrMany<AssistantContent>> {
        self.record(&request);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        *self.completed.lock().unwrap() += 1;
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Content(content)) => Ok(OneOrMany::one(content)),
            Some(Reply::Fail(reason)) => anyhow::bail!("{reason}"),
            None => Ok(OneOrMany::one(AssistantContent::Text(Text {
                text: "ok".to_string(),
            }))),
        }
    }
}

/// Binds models by name to scripted backends.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    backends: HashMap<String, Arc<ScriptedBackend>>,
}

impl ScriptedFactory {
    pub fn with(mut self, model: &str, backend: &Arc<ScriptedBackend>) -> Self {
        self.backends.insert(model.to_string(), backend.clone());
        self
    }
}

impl ModelFactory for ScriptedFactory {
    fn bind(&self, model: &ModelRef) -> Result<ModelBinding> {
        self.backends
            .get(&model.model)
            .map(|b| b.binding(&model.model))
            .ok_or_else(|| anyhow::anyhow!("no backend scripted for {model}"))
    }
}
