use crate::actions::scanner::validate_nesting;
use crate::actions::{ActionParser, ExecutionPlan, ParsedAction, PlanOutcome, PlanRunner};

/// Per-turn streaming state: the text seen so far and the actions it completed.
///
/// Chunks are fed as they arrive; a turn is complete once at least one action
/// tag has closed. [`process`](Self::process) plans and runs every completed
/// action of the turn at once, so dependencies span the whole reply.
#[derive(Default)]
pub struct StreamProtocolHandler {
    parser: ActionParser,
    response: String,
    pending: Vec<ParsedAction>,
    is_processing: bool,
}

impl StreamProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk. Returns true once the turn holds a complete action.
    pub fn on_chunk(&mut self, chunk: &str) -> bool {
        self.response.push_str(chunk);
        let completed = self.parser.feed(chunk);
        if !completed.is_empty() {
            tracing::debug!(count = completed.len(), "action tags completed");
        }
        self.pending.extend(completed);
        self.drop_if_malformed();
        self.is_complete()
    }

    /// A structural violation anywhere in the turn voids every action in it,
    /// including ones that closed before the violation arrived.
    fn drop_if_malformed(&mut self) -> bool {
        match validate_nesting(self.parser.buffer()) {
            Ok(_) => false,
            Err(e) => {
                if !self.pending.is_empty() {
                    tracing::warn!(
                        error = %e,
                        dropped = self.pending.len(),
                        "malformed reply, dropping actions"
                    );
                    self.pending.clear();
                }
                true
            }
        }
    }

    /// Whether at least one complete, unprocessed action is buffered.
    pub fn is_complete(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    /// Scanner buffer (text not yet cleared by a processed turn).
    pub fn buffer(&self) -> &str {
        self.parser.buffer()
    }

    /// Everything streamed this turn.
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Actions completed so far this turn, in source order.
    pub fn pending(&self) -> &[ParsedAction] {
        &self.pending
    }

    /// Plan for the buffered actions, leaving them in place.
    pub fn plan(&self) -> ExecutionPlan {
        ActionParser::plan(self.pending.clone())
    }

    /// Run the buffered actions. `None` when nothing is complete or a plan is
    /// already running. Clears the buffer, dedup set and flags afterwards; the
    /// response text stays until [`reset`](Self::reset).
    pub async fn process(&mut self, runner: &PlanRunner) -> Option<PlanOutcome> {
        if self.is_processing || self.drop_if_malformed() || !self.is_complete() {
            return None;
        }
        self.is_processing = true;

        let plan = ActionParser::plan(std::mem::take(&mut self.pending));
        tracing::debug!(
            groups = plan.groups.len(),
            actions = plan.action_count(),
            "executing plan"
        );
        let task_runner = runner.clone();
        let outcome = match tokio::spawn(async move { task_runner.run(&plan).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "plan execution aborted");
                PlanOutcome::default()
            }
        };

        self.parser.clear();
        self.is_processing = false;
        Some(outcome)
    }

    /// Drop all per-turn state, including the response text.
    pub fn reset(&mut self) {
        self.parser.clear();
        self.response.clear();
        self.pending.clear();
        self.is_processing = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::actions::ActionExecutor;
    use crate::tools::testing::{MemoryFiles, toolbox};

    fn runner(files: Arc<MemoryFiles>) -> PlanRunner {
        PlanRunner::new(ActionExecutor::new(toolbox(files)))
    }

    #[tokio::test]
    async fn split_tag_executes_once_complete() {
        let files = Arc::new(MemoryFiles::with(&[("x", "content")]));
        let runner = runner(files.clone());
        let mut handler = StreamProtocolHandler::new();

        assert!(!handler.on_chunk("<read_f"));
        assert!(handler.process(&runner).await.is_none());
        assert!(files.log().is_empty());

        assert!(handler.on_chunk("ile><path>x</path></read_file>"));
        let outcome = handler.process(&runner).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(files.log(), vec!["read x"]);
    }

    #[tokio::test]
    async fn processed_tags_are_not_rerun() {
        let files = Arc::new(MemoryFiles::with(&[("x", "1")]));
        let runner = runner(files.clone());
        let mut handler = StreamProtocolHandler::new();
        handler.on_chunk("<read_file><path>x</path></read_file>");
        handler.process(&runner).await.unwrap();
        assert!(!handler.is_complete());
        assert!(handler.process(&runner).await.is_none());
        assert_eq!(files.log().len(), 1);
        assert!(handler.buffer().is_empty());
    }

    #[tokio::test]
    async fn whole_turn_is_planned_together() {
        let files = Arc::new(MemoryFiles::default());
        let runner = runner(files.clone());
        let mut handler = StreamProtocolHandler::new();
        handler.on_chunk("<write_file><path>t</path><content>x</content></write_file>");
        handler.on_chunk("then <delete_file><path>t</path></delete_file>");
        assert_eq!(handler.plan().groups.len(), 2);
        let outcome = handler.process(&runner).await.unwrap();
        assert!(!outcome.failed);
        assert_eq!(files.log(), vec!["write t", "delete t"]);
    }

    #[tokio::test]
    async fn stray_close_tag_voids_the_turn() {
        let files = Arc::new(MemoryFiles::with(&[("a", "1")]));
        let runner = runner(files.clone());
        let mut handler = StreamProtocolHandler::new();
        assert!(handler.on_chunk("<read_file><path>a</path></read_file>"));
        assert!(!handler.on_chunk(" stray </write_file>"));
        assert_eq!(handler.plan().action_count(), 0);
        assert!(handler.process(&runner).await.is_none());
        assert!(files.log().is_empty());
    }

    #[test]
    fn response_accumulates_until_reset() {
        let mut handler = StreamProtocolHandler::new();
        handler.on_chunk("Hello ");
        handler.on_chunk("world");
        assert_eq!(handler.response(), "Hello world");
        assert!(!handler.is_complete());
        assert!(!handler.is_processing());
        handler.reset();
        assert_eq!(handler.response(), "");
    }
}
