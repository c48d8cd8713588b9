pub mod actions;
pub mod agent;
pub mod context;
pub mod llm;
pub mod phase;
pub mod prompts;
pub mod provider;
pub mod stream;
pub mod tools;

// Re-exports
pub use actions::{
    Action, ActionError, ActionExecutor, ActionParser, ActionResult, ExecutionPlan,
    ParsedAction, PlanOutcome, PlanRunner,
};
pub use agent::{Agent, AgentConfig, AgentError, AgentEvent, RunOutcome};
pub use context::{ChatMessage, ContextData, ContextError, ContextStore, Role};
pub use llm::{LlmError, LlmTransport, OpenAiCompatible};
pub use phase::{Phase, PhaseStateMachine};
pub use prompts::PromptArgs;
pub use provider::{PhaseModels, Provider, ReinConfig};
pub use stream::StreamProtocolHandler;
pub use tools::Toolbox;
