use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use rig::completion::{CompletionRequest, Message};
use rig::message::{AssistantContent, Text, ToolCall, ToolResult, ToolResultContent, UserContent};
use rig::OneOrMany;
use tracing::{debug, info, warn};

use crate::agent::binding::ModelBinding;
use crate::agent::context::ContextItem;
use crate::session::{Message as SessionMessage, SessionError, SessionKey, SessionService};
use crate::tools::{ToolContext, ToolRegistry};

const CONTINUE_PROMPT: &str =
    "If more tool calls are needed, make them. Otherwise, respond with the result.";
const MAX_CONSECUTIVE_ERRORS: usize = 3;

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Shorten `s` for log lines.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.len() > max {
        let end = floor_char_boundary(s, max);
        format!("{}... ({} chars)", &s[..end], s.len())
    } else {
        s.to_string()
    }
}

/// Per-agent generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub max_tokens: u64,
    pub max_iterations: usize,
    /// Session messages replayed as history on each run.
    pub history_window: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            max_iterations: 10,
            history_window: 20,
        }
    }
}

/// An agent: a name, a bound model, a fixed instruction and its tools.
pub struct Agent {
    name: String,
    model: ModelBinding,
    instruction: String,
    tools: ToolRegistry,
    settings: GenerationSettings,
}

impl Agent {
    pub fn new(name: &str, model: ModelBinding, instruction: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            model,
            instruction: instruction.into(),
            tools: ToolRegistry::new(),
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &ModelBinding {
        &self.model
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model.name())
            .field("tools", &self.tools.names())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("model '{model}' failed: {reason}")]
    Model { model: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Reasoning(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: String,
    },
    FinalResponse(String),
}

/// One incremental unit produced by a run.
#[derive(Debug, Clone)]
pub struct Event {
    pub author: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(author: &str, kind: EventKind) -> Self {
        Self {
            author: author.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn final_text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::FinalResponse(text) => Some(text),
            _ => None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::Reasoning(text) => write!(f, "[{}] reasoning: {text}", self.author),
            EventKind::ToolCall { name, arguments } => {
                write!(f, "[{}] call {name}({arguments})", self.author)
            }
            EventKind::ToolResult { name, output } => {
                write!(f, "[{}] {name} -> {output}", self.author)
            }
            EventKind::FinalResponse(text) => write!(f, "[{}] {text}", self.author),
        }
    }
}

/// Every event of a drained run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub events: Vec<Event>,
}

impl RunOutcome {
    /// Text of the last final response, if the run produced one.
    pub fn final_text(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|e| e.final_text())
    }

    pub fn tools_used(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ToolCall { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: Vec<String> = self.events.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<Event, RunError>> + Send + 'a>>;

/// Runs an agent against sessions held by a [`SessionService`].
///
/// Uses the bound model for completions and dispatches tool calls itself,
/// feeding results back until the model answers with text.
pub struct Runner {
    agent: Arc<Agent>,
    app_name: String,
    sessions: Arc<dyn SessionService>,
}

impl Runner {
    pub fn new(agent: Arc<Agent>, app_name: &str, sessions: Arc<dyn SessionService>) -> Self {
        Self {
            agent,
            app_name: app_name.to_string(),
            sessions,
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Submit `input` as a new user turn in an existing session.
    ///
    /// The turn is committed to session history only once the model has
    /// produced its final response, right before that event is yielded.
    pub fn run<'a>(
        &'a self,
        user_id: &'a str,
        session_id: &'a str,
        input: ContextItem,
    ) -> EventStream<'a> {
        Box::pin(try_stream! {
            let agent = &self.agent;
            let settings = agent.settings();
            let key = SessionKey::new(&self.app_name, user_id, session_id);
            let session = self
                .sessions
                .get_session(&key)
                .await
                .ok_or_else(|| RunError::Session(SessionError::NotFound(key.clone())))?;

            let mut chat_history: Vec<Message> = session
                .get_history(settings.history_window)
                .iter()
                .filter_map(to_rig_message)
                .collect();
            let mut current_prompt = input.to_message();
            let tool_defs = agent.tools().definitions();
            let ctx = ToolContext {
                state: session.state.clone(),
                session_id: session_id.to_string(),
                agent_name: agent.name().to_string(),
            };

            let mut tools_used: Vec<String> = Vec::new();
            let mut consecutive_errors: usize = 0;
            let mut final_text: Option<String> = None;

            for iteration in 0..settings.max_iterations {
                let mut all_messages = chat_history.clone();
                all_messages.push(current_prompt.clone());

                debug!(
                    "LLM request [{}] [{}/{}]: {} messages",
                    agent.name(),
                    iteration + 1,
                    settings.max_iterations,
                    all_messages.len()
                );

                let request = CompletionRequest {
                    preamble: Some(agent.instruction().to_string()),
                    chat_history: OneOrMany::many(all_messages)
                        .unwrap_or_else(|_| OneOrMany::one(current_prompt.clone())),
                    documents: Vec::new(),
                    tools: tool_defs.clone(),
                    temperature: Some(settings.temperature),
                    max_tokens: Some(settings.max_tokens),
                    tool_choice: None,
                    additional_params: None,
                };

                let llm_start = std::time::Instant::now();
                let choice = agent
                    .model()
                    .complete(request)
                    .await
                    .map_err(|e| RunError::Model {
                        model: agent.model().name().to_string(),
                        reason: format!("{e:#}"),
                    })?;
                let llm_elapsed = llm_start.elapsed();

                let mut text_content = String::new();
                let mut reasoning: Vec<String> = Vec::new();
                let mut tool_calls: Vec<ToolCall> = Vec::new();
                for content in choice.iter() {
                    match content {
                        AssistantContent::Text(t) => text_content.push_str(&t.text),
                        AssistantContent::ToolCall(tc) => tool_calls.push(tc.clone()),
                        AssistantContent::Reasoning(r) => reasoning.push(r.reasoning.join(" ")),
                        _ => {}
                    }
                }
                for text in reasoning {
                    debug!("Model reasoning [{}]: {}", agent.name(), preview(&text, 200));
                    yield Event::new(agent.name(), EventKind::Reasoning(text));
                }

                if tool_calls.is_empty() {
                    if text_content.is_empty() {
                        text_content =
                            "I've completed processing but have no response to give.".into();
                    }
                    debug!(
                        "LLM response [{}] [{}/{}]: text ({} chars) in {:.1}s",
                        agent.name(),
                        iteration + 1,
                        settings.max_iterations,
                        text_content.len(),
                        llm_elapsed.as_secs_f64()
                    );
                    final_text = Some(text_content);
                    break;
                }

                debug!(
                    "LLM response [{}] [{}/{}]: {} tool call(s) in {:.1}s",
                    agent.name(),
                    iteration + 1,
                    settings.max_iterations,
                    tool_calls.len(),
                    llm_elapsed.as_secs_f64()
                );

                chat_history.push(current_prompt);
                chat_history.push(Message::Assistant {
                    id: None,
                    content: choice.clone(),
                });

                let mut tool_results: Vec<UserContent> = Vec::new();
                let mut iteration_has_success = false;
                let mut last_error = String::new();
                for tc in &tool_calls {
                    let tool_name = tc.function.name.clone();
                    let tool_args = tc.function.arguments.clone();
                    tools_used.push(tool_name.clone());

                    info!(
                        "Tool call [{}] [{}/{}]: {tool_name}({})",
                        agent.name(),
                        iteration + 1,
                        settings.max_iterations,
                        preview(&tool_args.to_string(), 200)
                    );
                    yield Event::new(
                        agent.name(),
                        EventKind::ToolCall {
                            name: tool_name.clone(),
                            arguments: tool_args.clone(),
                        },
                    );

                    let output = match agent.tools().execute(&tool_name, &ctx, tool_args).await {
                        Ok(r) => {
                            if r.starts_with("Error") {
                                last_error.clone_from(&r);
                            } else {
                                iteration_has_success = true;
                            }
                            r
                        }
                        Err(e) => {
                            let err = format!("Error executing {tool_name}: {e}");
                            last_error.clone_from(&err);
                            err
                        }
                    };
                    debug!("Tool result [{tool_name}]: {}", preview(&output, 200));

                    tool_results.push(UserContent::ToolResult(ToolResult {
                        id: tc.id.clone(),
                        call_id: tc.call_id.clone(),
                        content: OneOrMany::one(ToolResultContent::Text(Text {
                            text: output.clone(),
                        })),
                    }));
                    yield Event::new(
                        agent.name(),
                        EventKind::ToolResult {
                            name: tool_name,
                            output,
                        },
                    );
                }

                // Bail if every tool call has failed for too many consecutive
                // iterations (e.g. the model keeps sending malformed params).
                if iteration_has_success {
                    consecutive_errors = 0;
                } else {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!(
                            "Circuit breaker [{}]: {consecutive_errors} consecutive iterations with all tool calls failing",
                            agent.name()
                        );
                        final_text = Some(format!(
                            "I'm having trouble using a tool correctly and had to stop retrying. \
                             Last error: {last_error}."
                        ));
                        break;
                    }
                }

                tool_results.push(UserContent::Text(Text {
                    text: CONTINUE_PROMPT.into(),
                }));
                current_prompt = Message::User {
                    content: OneOrMany::many(tool_results).unwrap_or_else(|_| {
                        OneOrMany::one(UserContent::Text(Text {
                            text: CONTINUE_PROMPT.into(),
                        }))
                    }),
                };
            }

            let response = match final_text {
                Some(text) => text,
                None => {
                    warn!(
                        "Agent '{}' reached max iterations ({}) without final response",
                        agent.name(),
                        settings.max_iterations
                    );
                    "I've been working on this but reached the maximum number of iterations."
                        .to_string()
                }
            };

            self.sessions
                .append_messages(
                    &key,
                    vec![
                        SessionMessage::new("user", &input.history_text()),
                        SessionMessage::new("assistant", &response).with_tools(tools_used),
                    ],
                )
                .await
                .map_err(RunError::Session)?;

            yield Event::new(agent.name(), EventKind::FinalResponse(response));
        })
    }

    /// Run and drain every event, returning them all.
    pub async fn run_to_completion(
        &self,
        user_id: &str,
        session_id: &str,
        input: ContextItem,
    ) -> Result<RunOutcome, RunError> {
        let mut events = self.run(user_id, session_id, input);
        let mut outcome = RunOutcome::default();
        while let Some(event) = events.next().await {
            outcome.events.push(event?);
        }
        Ok(outcome)
    }
}

/// Convert a stored session message into a rig history message.
fn to_rig_message(msg: &SessionMessage) -> Option<Message> {
    let text = Text {
        text: msg.content.clone(),
    };
    match msg.role.as_str() {
        "user" => Some(Message::User {
            content: OneOrMany::one(UserContent::Text(text)),
        }),
        "assistant" => Some(Message::Assistant {
            id: None,
            content: OneOrMany::one(AssistantContent::Text(text)),
        }),
        _ => None,
    }
}
