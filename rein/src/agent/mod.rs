//! The turn loop: stream a reply, run its actions, feed results back, repeat.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actions::{Action, ActionExecutor, ActionResult, PlanOutcome, PlanRunner};
use crate::context::{ChatMessage, ContextError, ContextStore, OperationKind, OperationRecord, Role};
use crate::llm::{LlmError, LlmTransport};
use crate::phase::{Phase, PhaseStateMachine};
use crate::prompts::PromptArgs;
use crate::provider::PhaseModels;
use crate::stream::StreamProtocolHandler;
use crate::tools::Toolbox;

/// Send an event to the channel if it's still open.
pub(crate) async fn send_event(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if !tx.is_closed() {
        let _ = tx.send(event).await;
    }
}

/// Tokens left free for the model's reply when sizing the context.
const RESPONSE_RESERVE_TOKENS: usize = 4_096;
/// Result text shown in an `ActionResult` event.
const EVENT_PREVIEW_CHARS: usize = 200;

const DEFAULT_SYSTEM_INSTRUCTIONS: &str = "\
You are rein, an autonomous coding agent working inside the user's repository. \
You act only through the action tags described in the phase instructions. \
Be precise: read before you edit, keep changes minimal, and verify your work.";

/// Configuration for the agent loop.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Model for any phase without an override.
    pub default_model: String,
    pub phase_models: PhaseModels,
    pub max_turns: usize,
    /// Retries for network and rate-limit failures.
    pub max_retries: usize,
    /// Fixed delay between those retries.
    pub retry_delay: Duration,
    /// Overrides the transport's context length.
    pub context_length: Option<usize>,
    pub prompt_args: PromptArgs,
    pub system_instructions: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: "anthropic/claude-sonnet-4.6".to_string(),
            phase_models: PhaseModels::default(),
            max_turns: 25,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            context_length: None,
            prompt_args: PromptArgs::default(),
            system_instructions: None,
        }
    }
}

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted {
        turn: usize,
        phase: Phase,
        model: String,
    },
    TextDelta {
        content: String,
    },
    ActionResult {
        id: String,
        tag: String,
        success: bool,
        preview: String,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
        model: String,
    },
    Retrying {
        attempt: usize,
        max_attempts: usize,
        delay_ms: u64,
        error: String,
    },
    ContextEvicted {
        tokens_before: usize,
        tokens_after: usize,
    },
    Error {
        message: String,
    },
    Done {
        outcome: RunOutcome,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// `end_task` ran successfully.
    Completed { summary: String },
    /// The model replied without requesting any action.
    Idle { response: String },
    /// `max_turns` turns ran without finishing.
    TurnLimit { turns: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] LlmError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("run cancelled")]
    Cancelled,
}

/// How one streaming attempt ended.
enum StreamEnd {
    Finished,
    Cancelled,
    Failed(LlmError),
}

/// One session: conversation state, phase machine and collaborators.
pub struct Agent {
    agent_id: String,
    transport: Arc<dyn LlmTransport>,
    runner: PlanRunner,
    phases: PhaseStateMachine,
    store: ContextStore,
    stream: StreamProtocolHandler,
    config: AgentConfig,
}

impl Agent {
    pub fn new(transport: Arc<dyn LlmTransport>, tools: Toolbox, config: AgentConfig) -> Self {
        let phases = PhaseStateMachine::new(&config.default_model, &config.phase_models);
        let mut agent = Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            transport,
            runner: PlanRunner::new(ActionExecutor::new(tools)),
            phases,
            store: ContextStore::new(),
            stream: StreamProtocolHandler::new(),
            config,
        };
        agent.install_base_context();
        agent
    }

    fn install_base_context(&mut self) {
        let system = self
            .config
            .system_instructions
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTIONS.to_string());
        self.store.set_system_instructions(system);
        let prompt = self.phases.prompt(&self.config.prompt_args);
        let phase = self.phases.current();
        if let Err(e) = self.store.add_message(Role::System, &prompt, phase) {
            tracing::warn!(error = %e, "could not install phase prompt");
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn phase(&self) -> Phase {
        self.phases.current()
    }

    pub fn model(&self) -> &str {
        self.phases.model()
    }

    pub fn context(&self) -> &ContextStore {
        &self.store
    }

    pub fn set_model(&mut self, phase: Phase, model: impl Into<String>) {
        self.phases.set_model(phase, model);
    }

    /// Back to Discovery with an empty conversation.
    pub fn reset(&mut self) {
        self.store.reset();
        self.stream.reset();
        self.phases.reset();
        self.install_base_context();
    }

    fn token_budget(&self) -> usize {
        let window = self
            .config
            .context_length
            .unwrap_or_else(|| self.transport.context_length(self.phases.model()));
        window
            .saturating_sub(RESPONSE_RESERVE_TOKENS)
            .max(window / 2)
    }

    async fn evict_to(&mut self, budget: usize, events: &mpsc::Sender<AgentEvent>) {
        let before = self.store.estimated_tokens();
        if self.store.evict(budget) {
            let after = self.store.estimated_tokens();
            tracing::info!(before, after, budget, "evicted context");
            send_event(
                events,
                AgentEvent::ContextEvicted {
                    tokens_before: before,
                    tokens_after: after,
                },
            )
            .await;
        }
    }

    /// Run `task` until `end_task`, a reply without actions, or the turn limit.
    ///
    /// Transport failures that survive retries and eviction end the run with an
    /// error unless part of a reply had already arrived.
    pub async fn run(
        &mut self,
        task: &str,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        tracing::info!(agent_id = %self.agent_id, phase = %self.phases.current(), "starting run");
        self.store.add_message(Role::User, task, self.phases.current())?;

        for turn in 1..=self.config.max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let phase = self.phases.current();
            send_event(
                &events,
                AgentEvent::TurnStarted {
                    turn,
                    phase,
                    model: self.phases.model().to_string(),
                },
            )
            .await;

            let budget = self.token_budget();
            if self.store.estimated_tokens() > budget {
                self.evict_to(budget, &events).await;
            }

            let response = self.stream_turn(&events, &cancel).await?;
            if !response.trim().is_empty() {
                self.store.add_message(Role::Assistant, &response, phase)?;
            }

            let outcome = self.stream.process(&self.runner).await;
            self.stream.reset();
            let Some(outcome) = outcome else {
                tracing::info!(turn, "reply requested no actions");
                return self.finish(&events, RunOutcome::Idle { response }).await;
            };

            self.absorb_results(&outcome, &events).await;

            if let Some(summary) = &outcome.end_task {
                let done = RunOutcome::Completed {
                    summary: summary.clone(),
                };
                return self.finish(&events, done).await;
            }

            if outcome.end_phase.is_some() && !outcome.failed {
                let t = self
                    .phases
                    .transition(&mut self.store, &self.config.prompt_args);
                self.store.add_message(Role::System, &t.prompt, t.to)?;
                send_event(
                    &events,
                    AgentEvent::PhaseChanged {
                        from: t.from,
                        to: t.to,
                        model: t.model,
                    },
                )
                .await;
            }

            let next = outcome.follow_up().or_else(|| outcome.failure_report());
            match next {
                Some(text) => {
                    self.store
                        .add_message(Role::User, &text, self.phases.current())?;
                }
                None => {
                    return self.finish(&events, RunOutcome::Idle { response }).await;
                }
            }
        }

        let turns = self.config.max_turns;
        tracing::warn!(turns, "turn limit reached");
        self.finish(&events, RunOutcome::TurnLimit { turns }).await
    }

    async fn finish(
        &self,
        events: &mpsc::Sender<AgentEvent>,
        outcome: RunOutcome,
    ) -> Result<RunOutcome, AgentError> {
        send_event(
            events,
            AgentEvent::Done {
                outcome: outcome.clone(),
            },
        )
        .await;
        Ok(outcome)
    }

    /// Stream one reply into the handler, retrying and evicting as needed.
    /// Returns the reply text (possibly partial).
    async fn stream_turn(
        &mut self,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let mut attempt = 0;
        let mut evicted = false;
        loop {
            self.stream.reset();
            let model = self.phases.model().to_string();
            let messages = self.store.messages();
            match self.stream_once(&model, &messages, events, cancel).await {
                StreamEnd::Finished => return Ok(self.stream.response().to_string()),
                StreamEnd::Cancelled => return Err(AgentError::Cancelled),
                StreamEnd::Failed(err) => {
                    if matches!(err, LlmError::ContextLength(_)) && !evicted {
                        evicted = true;
                        tracing::warn!(error = %err, "context too long, evicting and retrying");
                        let budget = self.token_budget() / 2;
                        self.evict_to(budget, events).await;
                        continue;
                    }
                    if err.is_retryable() && attempt < self.config.max_retries {
                        attempt += 1;
                        let delay = self.config.retry_delay;
                        tracing::warn!(
                            attempt,
                            max = self.config.max_retries,
                            error = %err,
                            "retrying LLM call"
                        );
                        send_event(
                            events,
                            AgentEvent::Retrying {
                                attempt,
                                max_attempts: self.config.max_retries,
                                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error: err.to_string(),
                            },
                        )
                        .await;
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }

                    let partial = self.stream.response().to_string();
                    if partial.trim().is_empty() {
                        send_event(
                            events,
                            AgentEvent::Error {
                                message: err.to_string(),
                            },
                        )
                        .await;
                        return Err(AgentError::Transport(err));
                    }
                    tracing::warn!(error = %err, "stream failed, continuing with partial reply");
                    send_event(
                        events,
                        AgentEvent::Error {
                            message: format!("{err} (continuing with partial response)"),
                        },
                    )
                    .await;
                    return Ok(partial);
                }
            }
        }
    }

    async fn stream_once(
        &mut self,
        model: &str,
        messages: &[ChatMessage],
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut chunks = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            result = self.transport.stream_message(model, messages) => match result {
                Ok(s) => s,
                Err(e) => return StreamEnd::Failed(e),
            },
        };
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = chunks.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    self.stream.on_chunk(&chunk);
                    send_event(events, AgentEvent::TextDelta { content: chunk }).await;
                }
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Finished,
            }
        }
    }

    /// Emit one event per result and upsert read/write/command records.
    async fn absorb_results(&mut self, outcome: &PlanOutcome, events: &mpsc::Sender<AgentEvent>) {
        for result in &outcome.results {
            let preview = result
                .data
                .as_deref()
                .or(result.error.as_deref())
                .unwrap_or_default();
            send_event(
                events,
                AgentEvent::ActionResult {
                    id: result.id.clone(),
                    tag: result.tag.clone(),
                    success: result.success,
                    preview: preview.chars().take(EVENT_PREVIEW_CHARS).collect(),
                },
            )
            .await;
            for record in operation_records(result) {
                self.store.record(record);
            }
        }
    }
}

/// Operation records implied by one result.
fn operation_records(result: &ActionResult) -> Vec<OperationRecord> {
    let Some(action) = &result.action else {
        return Vec::new();
    };
    let record = |kind, key: &str, content: Option<String>| {
        OperationRecord::completed(kind, key, result.success, content, result.error.clone())
    };
    match action {
        Action::ReadFile { paths } => {
            let content = if paths.len() == 1 {
                result.data.clone()
            } else {
                None
            };
            paths
                .iter()
                .map(|p| record(OperationKind::Read, p, content.clone()))
                .collect()
        }
        Action::WriteFile { path, content } => {
            vec![record(OperationKind::Write, path, Some(content.clone()))]
        }
        Action::EditFile { files } => files
            .iter()
            .map(|f| record(OperationKind::Write, &f.path, None))
            .collect(),
        Action::CopyFileSlice { destination, .. } => {
            vec![record(OperationKind::Write, destination, None)]
        }
        Action::ExecuteCommand { command } => {
            vec![record(OperationKind::Command, command, result.data.clone())]
        }
        _ => Vec::new(),
    }
}
