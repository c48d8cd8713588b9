use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ContextStore;
use crate::prompts::{self, PromptArgs};
use crate::provider::PhaseModels;

/// One stage of the Discovery → Strategy → Execute workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Discovery,
    Strategy,
    Execute,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Discovery, Phase::Strategy, Phase::Execute];

    /// Execute is terminal and loops onto itself.
    pub fn next(self) -> Phase {
        match self {
            Phase::Discovery => Phase::Strategy,
            Phase::Strategy | Phase::Execute => Phase::Execute,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Strategy => "strategy",
            Phase::Execute => "execute",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What changed in one [`PhaseStateMachine::transition`].
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub model: String,
    /// The new phase's prompt, already wrapped in `<phase_prompt>`.
    pub prompt: String,
}

/// Tracks the active phase and the model assigned to each phase.
#[derive(Clone, Debug)]
pub struct PhaseStateMachine {
    current: Phase,
    models: BTreeMap<Phase, String>,
}

impl PhaseStateMachine {
    /// Every phase uses `default_model` unless `overrides` names another.
    pub fn new(default_model: &str, overrides: &PhaseModels) -> Self {
        let models = Phase::ALL
            .into_iter()
            .map(|phase| {
                let model = overrides
                    .get(phase)
                    .map(str::to_string)
                    .unwrap_or_else(|| default_model.to_string());
                (phase, model)
            })
            .collect();
        Self {
            current: Phase::Discovery,
            models,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Model of the active phase.
    pub fn model(&self) -> &str {
        self.model_for(self.current)
    }

    pub fn model_for(&self, phase: Phase) -> &str {
        self.models.get(&phase).map(String::as_str).unwrap_or_default()
    }

    pub fn set_model(&mut self, phase: Phase, model: impl Into<String>) {
        self.models.insert(phase, model.into());
    }

    /// Prompt for the active phase.
    pub fn prompt(&self, args: &PromptArgs) -> String {
        prompts::phase_prompt(self.current, args)
    }

    /// Purge phase-scoped context, advance, and generate the next phase's prompt.
    ///
    /// The caller decides whether to install `prompt`; the purge and model switch
    /// have already happened when this returns.
    pub fn transition(&mut self, store: &mut ContextStore, args: &PromptArgs) -> PhaseTransition {
        let from = self.current;
        store.purge_phase_context();
        self.current = from.next();
        let model = self.model().to_string();
        tracing::info!(from = %from, to = %self.current, model = %model, "phase transition");
        PhaseTransition {
            from,
            to: self.current,
            model,
            prompt: self.prompt(args),
        }
    }

    pub fn reset(&mut self) {
        self.current = Phase::Discovery;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;

    fn machine() -> PhaseStateMachine {
        let overrides = PhaseModels {
            strategy: Some("thinker".into()),
            ..Default::default()
        };
        PhaseStateMachine::new("base", &overrides)
    }

    #[test]
    fn starts_in_discovery_with_default_model() {
        let m = machine();
        assert_eq!(m.current(), Phase::Discovery);
        assert_eq!(m.model(), "base");
        assert_eq!(m.model_for(Phase::Strategy), "thinker");
        assert_eq!(m.model_for(Phase::Execute), "base");
    }

    #[test]
    fn discovery_to_strategy_clears_instructions_and_switches_model() {
        let mut m = machine();
        let mut store = ContextStore::new();
        store
            .add_message(
                Role::System,
                "<phase_prompt>look around</phase_prompt>",
                Phase::Discovery,
            )
            .unwrap();
        store
            .add_message(Role::System, "scoped note", Phase::Discovery)
            .unwrap();
        store.add_message(Role::User, "fix it", Phase::Discovery).unwrap();
        assert_eq!(store.data().phase_instructions.len(), 1);

        let t = m.transition(&mut store, &PromptArgs::default());
        assert_eq!(t.from, Phase::Discovery);
        assert_eq!(t.to, Phase::Strategy);
        assert_eq!(t.model, "thinker");
        assert_eq!(m.model(), "thinker");
        assert!(store.data().phase_instructions.is_empty());
        let history = &store.data().conversation_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "fix it");
        assert!(t.prompt.starts_with("<phase_prompt>"));
    }

    #[test]
    fn execute_is_terminal() {
        let mut m = machine();
        let mut store = ContextStore::new();
        m.transition(&mut store, &PromptArgs::default());
        m.transition(&mut store, &PromptArgs::default());
        assert_eq!(m.current(), Phase::Execute);
        let t = m.transition(&mut store, &PromptArgs::default());
        assert_eq!((t.from, t.to), (Phase::Execute, Phase::Execute));
    }

    #[test]
    fn reset_returns_to_discovery() {
        let mut m = machine();
        let mut store = ContextStore::new();
        m.transition(&mut store, &PromptArgs::default());
        m.reset();
        assert_eq!(m.current(), Phase::Discovery);
        assert_eq!(m.model(), "base");
    }

    #[test]
    fn set_model_overrides_one_phase() {
        let mut m = machine();
        m.set_model(Phase::Execute, "fast");
        assert_eq!(m.model_for(Phase::Execute), "fast");
    }
}
