use std::sync::Arc;

use futures::{Stream, StreamExt};
use saguaro_config::{resolve_path, Config, ModelRef};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::binding::{ModelBinding, ModelFactory};
use crate::agent::context::{render_cortex_instruction, ContextItem, NEOCORTEX_INSTRUCTION};
use crate::agent::memory::{MemoryError, MemoryStore};
use crate::agent::runner::{preview, Agent, GenerationSettings, RunError, RunOutcome, Runner};
use crate::session::{
    InMemorySessionService, SessionError, SessionKey, SessionService, SessionState,
};
use crate::tools::memory::UpdateMemoryTool;
use crate::tools::neocortex::SummonNeocortexTool;
use crate::tools::{Tool, ToolRegistry};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("failed to bind {tier} model '{model}': {reason}")]
    ModelBinding {
        tier: &'static str,
        model: String,
        reason: String,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// How a proactive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The context stream ran out.
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub ticks_completed: usize,
    pub ticks_failed: usize,
}

/// The cognitive kernel: a fast cortex agent that observes a context stream
/// and keeps the memory file current, with a slower neocortex agent it can
/// delegate to.
pub struct Kernel {
    app_name: String,
    user_id: String,
    session_id: String,
    memory: Arc<MemoryStore>,
    cortex: Arc<Agent>,
    neocortex: Arc<Agent>,
    state: Arc<SessionState>,
    sessions: Arc<InMemorySessionService>,
    runner: Runner,
}

impl Kernel {
    /// Build the kernel. The memory file is read once here; the cortex
    /// instruction keeps that snapshot for the lifetime of the kernel.
    pub async fn new(config: &Config, models: &dyn ModelFactory) -> Result<Self, KernelError> {
        let kernel_cfg = &config.kernel;

        let memory = Arc::new(MemoryStore::open(resolve_path(&kernel_cfg.memory_path)).await?);
        let snapshot = memory.read().await;
        info!(
            "Memory loaded from {} ({} chars)",
            memory.path().display(),
            snapshot.len()
        );

        let settings = GenerationSettings {
            temperature: f64::from(kernel_cfg.temperature),
            max_tokens: u64::from(kernel_cfg.max_tokens),
            max_iterations: kernel_cfg.max_tool_iterations as usize,
            history_window: kernel_cfg.history_window,
        };

        let neocortex_model = bind(models, "neocortex", &config.models.neocortex)?;
        let neocortex = Arc::new(
            Agent::new("neocortex", neocortex_model, NEOCORTEX_INSTRUCTION)
                .with_settings(settings.clone()),
        );

        let state = Arc::new(SessionState::new(memory.clone(), neocortex.clone()));

        let memory_tool = UpdateMemoryTool;
        let neocortex_tool =
            SummonNeocortexTool::new(neocortex.clone(), &kernel_cfg.app_name, &kernel_cfg.user_id);
        let instruction =
            render_cortex_instruction(&snapshot, memory_tool.name(), neocortex_tool.name());
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(memory_tool));
        tools.register(Box::new(neocortex_tool));

        let cortex_model = bind(models, "cortex", &config.models.cortex)?;
        let cortex = Arc::new(
            Agent::new("cortex", cortex_model, instruction)
                .with_tools(tools)
                .with_settings(settings),
        );

        let sessions = Arc::new(InMemorySessionService::new());
        let runner = Runner::new(cortex.clone(), &kernel_cfg.app_name, sessions.clone());

        info!(
            "Kernel ready: cortex={}, neocortex={}",
            config.models.cortex, config.models.neocortex
        );

        Ok(Self {
            app_name: kernel_cfg.app_name.clone(),
            user_id: kernel_cfg.user_id.clone(),
            session_id: kernel_cfg.session_id.clone(),
            memory,
            cortex,
            neocortex,
            state,
            sessions,
            runner,
        })
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn cortex(&self) -> &Arc<Agent> {
        &self.cortex
    }

    pub fn neocortex(&self) -> &Arc<Agent> {
        &self.neocortex
    }

    /// State seeded into the kernel session.
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn sessions(&self) -> &Arc<InMemorySessionService> {
        &self.sessions
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.session_id)
    }

    /// Create the kernel session, or keep the one a previous loop created.
    async fn start_session(&self) -> Result<(), KernelError> {
        match self
            .sessions
            .create_session(self.session_key(), self.state.clone())
            .await
        {
            Ok(()) => {
                info!("Session {} started", self.session_key());
                Ok(())
            }
            Err(SessionError::AlreadyExists(key)) => {
                debug!("Session {key} already exists, reusing it");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Submit one observation to the cortex and drain the run.
    pub async fn tick(&self, item: ContextItem) -> Result<RunOutcome, RunError> {
        self.runner
            .run_to_completion(&self.user_id, &self.session_id, item)
            .await
    }

    /// Feed every item of `stream` to the cortex, one tick at a time, until
    /// the stream ends or `cancel` fires.
    ///
    /// A failed tick is logged and counted; the loop moves on to the next
    /// item. A tick interrupted by cancellation commits nothing to history.
    pub async fn run_proactive_loop<S>(
        &self,
        stream: S,
        cancel: CancellationToken,
    ) -> Result<LoopReport, KernelError>
    where
        S: Stream<Item = ContextItem>,
    {
        self.start_session().await?;
        info!("Proactive loop running. Waiting for context stream...");

        let mut stream = std::pin::pin!(stream);
        let mut ticks_completed = 0;
        let mut ticks_failed = 0;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopOutcome::Cancelled,
                next = stream.next() => next,
            };
            let Some(item) = next else {
                break LoopOutcome::Exhausted;
            };

            let tick = ticks_completed + ticks_failed + 1;
            debug!("Tick {tick}: {}", preview(&item.history_text(), 200));
            let started = std::time::Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Tick {tick} interrupted by shutdown");
                    break LoopOutcome::Cancelled;
                }
                result = self.tick(item) => result,
            };

            match result {
                Ok(outcome) => {
                    ticks_completed += 1;
                    let tools = outcome.tools_used();
                    debug!(
                        "Tick {tick} done in {:.1}s (tools: {})",
                        started.elapsed().as_secs_f64(),
                        if tools.is_empty() { "none".to_string() } else { tools.join(", ") }
                    );
                    if let Some(text) = outcome.final_text() {
                        info!("Cortex: {}", preview(text, 200));
                    }
                }
                Err(e) => {
                    ticks_failed += 1;
                    error!("Error in proactive loop (tick {tick}): {e}");
                }
            }
        };

        info!(
            "Proactive loop stopped ({outcome:?}): {ticks_completed} ticks, {ticks_failed} failed"
        );
        Ok(LoopReport {
            outcome,
            ticks_completed,
            ticks_failed,
        })
    }
}

fn bind(
    models: &dyn ModelFactory,
    tier: &'static str,
    model: &ModelRef,
) -> Result<ModelBinding, KernelError> {
    models.bind(model).map_err(|e| KernelError::ModelBinding {
        tier,
        model: model.to_string(),
        reason: format!("{e:#}"),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::session::StateEntry;
    use crate::testing::{ScriptedBackend, ScriptedFactory};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        cortex: Arc<ScriptedBackend>,
        neocortex: Arc<ScriptedBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::default();
            config.kernel.memory_path = dir.path().join("memory.md").to_string_lossy().into_owned();
            config.models.cortex = ModelRef::new("gemini", "small");
            config.models.neocortex = ModelRef::new("gemini", "large");
            Self {
                _dir: dir,
                config,
                cortex: ScriptedBackend::new(),
                neocortex: ScriptedBackend::new(),
            }
        }

        fn factory(&self) -> ScriptedFactory {
            ScriptedFactory::default()
                .with("small", &self.cortex)
                .with("large", &self.neocortex)
        }

        async fn kernel(&self) -> Kernel {
            Kernel::new(&self.config, &self.factory()).await.unwrap()
        }
    }

    fn items(texts: &[&str]) -> Vec<ContextItem> {
        texts.iter().map(|t| ContextItem::text(*t)).collect()
    }

    #[tokio::test]
    async fn wiring_of_agents_tools_and_state() {
        let fx = Fixture::new();
        let kernel = fx.kernel().await;

        assert_eq!(
            kernel.cortex().tools().names(),
            vec!["summon_neocortex", "update_memory"]
        );
        assert!(kernel.neocortex().tools().is_empty());
        assert_eq!(kernel.neocortex().instruction(), NEOCORTEX_INSTRUCTION);

        let state = kernel.state();
        assert_eq!(state.keys(), vec!["memory", "neocortex"]);
        match state.get("memory") {
            Some(StateEntry::Memory(m)) => assert!(Arc::ptr_eq(m, kernel.memory())),
            _ => panic!("memory missing from state"),
        }
        match state.get("neocortex") {
            Some(StateEntry::Agent(a)) => assert!(Arc::ptr_eq(a, kernel.neocortex())),
            _ => panic!("neocortex missing from state"),
        }
    }

    #[tokio::test]
    async fn instruction_freezes_memory_snapshot() {
        let fx = Fixture::new();
        std::fs::write(
            &fx.config.kernel.memory_path,
            "# Long Term Memory\nUser writes Rust\n# Short Term Memory\n",
        )
        .unwrap();
        let kernel = fx.kernel().await;

        assert!(kernel.cortex().instruction().contains("User writes Rust"));

        kernel.memory().write("replaced").await.unwrap();
        assert!(kernel.cortex().instruction().contains("User writes Rust"));
        assert!(!kernel.cortex().instruction().contains("replaced"));
    }

    #[tokio::test]
    async fn first_run_uses_default_document() {
        let fx = Fixture::new();
        let kernel = fx.kernel().await;
        assert_eq!(kernel.memory().read().await, MemoryStore::default_document());
        assert!(kernel
            .cortex()
            .instruction()
            .contains("[SYSTEM STATE / MEMORY]\n# Long Term Memory"));
    }

    #[tokio::test]
    async fn unbindable_model_is_fatal() {
        let fx = Fixture::new();
        let factory = ScriptedFactory::default().with("large", &fx.neocortex);

        let err = Kernel::new(&fx.config, &factory).await.err().unwrap();
        match err {
            KernelError::ModelBinding { tier, model, .. } => {
                assert_eq!(tier, "cortex");
                assert_eq!(model, "gemini/small");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn loop_survives_a_failing_tick() {
        let fx = Fixture::new();
        fx.cortex.push_text("one");
        fx.cortex.push_failure("model unavailable");
        fx.cortex.push_text("three");
        fx.cortex.push_text("four");
        let kernel = fx.kernel().await;

        let report = kernel
            .run_proactive_loop(
                stream::iter(items(&["a", "b", "c", "d"])),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            report,
            LoopReport {
                outcome: LoopOutcome::Exhausted,
                ticks_completed: 3,
                ticks_failed: 1,
            }
        );

        let session = kernel
            .sessions()
            .get_session(&kernel.session_key())
            .await
            .unwrap();
        let history: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["a", "one", "c", "three", "d", "four"]);
    }

    #[tokio::test]
    async fn tick_appends_to_memory() {
        let fx = Fixture::new();
        fx.cortex.push_tool_call(
            "update_memory",
            serde_json::json!({"action": "append_short_term", "content": "user opened a PR"}),
        );
        fx.cortex.push_text("logged");
        let kernel = fx.kernel().await;

        let report = kernel
            .run_proactive_loop(
                stream::iter(items(&["browser: github pull request"])),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.ticks_completed, 1);

        let on_disk = std::fs::read_to_string(&fx.config.kernel.memory_path).unwrap();
        assert!(on_disk.ends_with("# Short Term Memory\n- user opened a PR\n"));

        let session = kernel
            .sessions()
            .get_session(&kernel.session_key())
            .await
            .unwrap();
        assert_eq!(
            session.messages[1].tools_used,
            Some(vec!["update_memory".to_string()])
        );
    }

    #[tokio::test]
    async fn tick_delegates_to_neocortex() {
        let fx = Fixture::new();
        fx.cortex.push_tool_call(
            "summon_neocortex",
            serde_json::json!({"task": "refactor the parser"}),
        );
        fx.cortex.push_text("delegated");
        fx.neocortex.push_text("split it into a lexer and a parser");
        let kernel = fx.kernel().await;

        let outcome = {
            kernel.start_session().await.unwrap();
            kernel.tick(ContextItem::text("editor: parser.rs")).await.unwrap()
        };
        assert_eq!(outcome.final_text(), Some("delegated"));

        let neo_requests = fx.neocortex.requests();
        assert_eq!(neo_requests.len(), 1);
        assert_eq!(neo_requests[0].user_texts, vec!["refactor the parser".to_string()]);
        assert_eq!(
            fx.cortex.requests()[1].tool_results,
            vec!["Neocortex responded: split it into a lexer and a parser".to_string()]
        );

        // The nested run never touches the kernel session service.
        assert_eq!(kernel.sessions().len().await, 1);
    }

    #[tokio::test]
    async fn second_loop_reuses_session() {
        let fx = Fixture::new();
        let kernel = fx.kernel().await;

        for text in ["first", "second"] {
            kernel
                .run_proactive_loop(stream::iter(items(&[text])), CancellationToken::new())
                .await
                .unwrap();
        }

        let session = kernel
            .sessions()
            .get_session(&kernel.session_key())
            .await
            .unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(fx.cortex.requests()[1].user_texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn cancelled_before_first_item() {
        let fx = Fixture::new();
        let kernel = fx.kernel().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = kernel
            .run_proactive_loop(stream::pending::<ContextItem>(), cancel)
            .await
            .unwrap();
        assert_eq!(report.outcome, LoopOutcome::Cancelled);
        assert_eq!(report.ticks_completed, 0);
        assert!(fx.cortex.requests().is_empty());
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_context() {
        let fx = Fixture::new();
        let kernel = fx.kernel().await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let context = stream::iter(items(&["only item"])).chain(stream::pending());
        let report = kernel.run_proactive_loop(context, cancel).await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::Cancelled);
        assert_eq!(report.ticks_completed, 1);
        assert_eq!(report.ticks_failed, 0);
    }

    fn cancel_after(cancel: &CancellationToken, delay: Duration) {
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
    }

    #[tokio::test]
    async fn cancel_mid_tick_leaves_no_history() {
        let fx = Fixture::new();
        fx.cortex.set_latency(Duration::from_millis(300));
        fx.cortex.push_text("never seen");
        let kernel = fx.kernel().await;
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(50));

        let context = stream::iter(items(&["screen: compiler output"])).chain(stream::pending());
        let report = kernel.run_proactive_loop(context, cancel).await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::Cancelled);
        assert_eq!(report.ticks_completed, 0);
        assert_eq!(report.ticks_failed, 0);
        assert_eq!(fx.cortex.requests().len(), 1);
        assert_eq!(fx.cortex.completed(), 0);

        let session = kernel
            .sessions()
            .get_session(&kernel.session_key())
            .await
            .unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_delegation_stops_neocortex() {
        let fx = Fixture::new();
        fx.cortex.push_tool_call(
            "summon_neocortex",
            serde_json::json!({"task": "write the migration plan"}),
        );
        fx.neocortex.set_latency(Duration::from_millis(300));
        fx.neocortex.push_text("plan");
        let kernel = fx.kernel().await;
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(50));

        let context = stream::iter(items(&["editor: schema.sql"])).chain(stream::pending());
        let report = kernel.run_proactive_loop(context, cancel).await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::Cancelled);
        assert_eq!(report.ticks_completed, 0);

        // Give a detached nested run time to finish, had it survived.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.neocortex.requests().len(), 1);
        assert_eq!(fx.neocortex.completed(), 0);
        assert_eq!(fx.cortex.requests().len(), 1);

        let session = kernel
            .sessions()
            .get_session(&kernel.session_key())
            .await
            .unwrap();
        assert!(session.messages.is_empty());
    }
}
